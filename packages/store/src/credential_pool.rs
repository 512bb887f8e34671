//! Rotation pool of rate-limited API credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use analysis_core::{Credential, CredentialConfig, CredentialId, CredentialStatus};
use thiserror::Error;
use tokio::time::Instant;

/// Credential pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No credential available: all credentials are cooling down")]
    NoCredentialAvailable,

    #[error("Unknown credential: {0}")]
    UnknownCredential(CredentialId),

    #[error("Credential pool needs at least one credential")]
    Empty,
}

/// Cooldown applied by a rate-limit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    pub duration: Duration,
    pub until: Instant,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct SlotState {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
}

impl SlotState {
    fn is_usable(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    state: Mutex<SlotState>,
}

/// Interchangeable credentials with independent cooldown state.
///
/// Each credential has its own lock; the round-robin cursor is an atomic.
/// Cooldown expiry is checked lazily by `acquire`.
#[derive(Debug)]
pub struct CredentialPool {
    slots: Vec<Slot>,
    index: HashMap<CredentialId, usize>,
    next: AtomicUsize,
    cooldown_base: Duration,
    max_multiplier: u32,
}

impl CredentialPool {
    /// Create a pool. `max_multiplier` caps the cooldown at `base * max_multiplier`.
    pub fn new(
        credentials: Vec<Credential>,
        cooldown_base: Duration,
        max_multiplier: u32,
    ) -> Result<Self, PoolError> {
        if credentials.is_empty() {
            return Err(PoolError::Empty);
        }
        let index = credentials
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        let slots = credentials
            .into_iter()
            .map(|credential| Slot {
                credential,
                state: Mutex::new(SlotState::default()),
            })
            .collect();

        Ok(Self {
            slots,
            index,
            next: AtomicUsize::new(0),
            cooldown_base,
            max_multiplier: max_multiplier.max(1),
        })
    }

    pub fn from_config(config: &CredentialConfig) -> Result<Self, PoolError> {
        Self::new(
            config.credentials(),
            config.cooldown_base(),
            config.cooldown_max_multiplier,
        )
    }

    /// Pick the next usable credential in round-robin order.
    pub fn acquire(&self) -> Result<Credential, PoolError> {
        self.acquire_at(Instant::now())
    }

    /// Like [`acquire`](Self::acquire), evaluated at `now`.
    ///
    /// Scanning starts right after the previously returned credential, so
    /// the same credential comes back twice in a row only when it is the
    /// sole usable one. Fails immediately when every credential is cooling.
    pub fn acquire_at(&self, now: Instant) -> Result<Credential, PoolError> {
        let len = self.slots.len();

        // The cursor only grows, so a successful compare-exchange proves no
        // other caller picked from the same position in between.
        'scan: loop {
            let cursor = self.next.load(Ordering::Acquire);
            let start = cursor % len;

            for offset in 0..len {
                let slot = &self.slots[(start + offset) % len];
                let mut state = lock(&slot.state);
                if !state.is_usable(now) {
                    continue;
                }
                let advanced = cursor.wrapping_add(offset + 1);
                if self
                    .next
                    .compare_exchange(cursor, advanced, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue 'scan;
                }
                state.cooldown_until = None;
                return Ok(slot.credential.clone());
            }

            return Err(PoolError::NoCredentialAvailable);
        }
    }

    /// Put a credential into cooldown after a rate-limit response.
    pub fn report_rate_limited(&self, id: &CredentialId) -> Result<Cooldown, PoolError> {
        self.report_rate_limited_at(id, Instant::now())
    }

    /// Cooldown is `base * 2^failures`, capped at `base * max_multiplier`.
    /// An existing longer cooldown is never shortened.
    pub fn report_rate_limited_at(
        &self,
        id: &CredentialId,
        now: Instant,
    ) -> Result<Cooldown, PoolError> {
        let slot = self.slot(id)?;
        let mut state = lock(&slot.state);

        let duration = self.cooldown_for(state.consecutive_failures);
        let until = now + duration;
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        tracing::warn!(
            credential = %id,
            cooldown_ms = duration.as_millis() as u64,
            failures = state.consecutive_failures,
            "Credential rate limited"
        );

        Ok(Cooldown {
            duration,
            until: state.cooldown_until.unwrap_or(until),
            consecutive_failures: state.consecutive_failures,
        })
    }

    /// Reset the failure counter after a successful call.
    pub fn report_success(&self, id: &CredentialId) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        lock(&slot.state).consecutive_failures = 0;
        Ok(())
    }

    /// Snapshot of every credential in configuration order.
    pub fn status(&self) -> Vec<CredentialStatus> {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> Vec<CredentialStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let state = lock(&slot.state);
                let remaining = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default();
                CredentialStatus {
                    id: slot.credential.id.clone(),
                    masked_secret: slot.credential.masked(),
                    usable: state.is_usable(now),
                    cooldown_remaining_ms: remaining.as_millis() as u64,
                    consecutive_failures: state.consecutive_failures,
                }
            })
            .collect()
    }

    /// Whether a specific credential could be handed out at `now`.
    pub fn is_usable_at(&self, id: &CredentialId, now: Instant) -> Result<bool, PoolError> {
        Ok(lock(&self.slot(id)?.state).is_usable(now))
    }

    pub fn consecutive_failures(&self, id: &CredentialId) -> Result<u32, PoolError> {
        Ok(lock(&self.slot(id)?.state).consecutive_failures)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: &CredentialId) -> Result<&Slot, PoolError> {
        self.index
            .get(id)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| PoolError::UnknownCredential(id.clone()))
    }

    fn cooldown_for(&self, failures: u32) -> Duration {
        let multiplier = 2u32
            .checked_pow(failures)
            .unwrap_or(u32::MAX)
            .min(self.max_multiplier);
        self.cooldown_base.saturating_mul(multiplier)
    }
}

// A poisoned slot only means another thread panicked mid-update of plain data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
