//! Service configuration, read from environment variables.
//!
//! Each section deserializes with `#[serde(default)]`, so partial JSON
//! documents work as well. [`ServiceConfig::from_env`] is the entry point
//! used by the daemon; [`ServiceConfig::from_lookup`] takes any variable
//! source and is what the tests drive.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Credential;

/// Number of indexed `API_KEY_n` variables scanned at startup.
pub const MAX_ENV_CREDENTIALS: usize = 9;

/// Secret value shipped in sample env files; never a real key.
const PLACEHOLDER_SECRET: &str = "YOUR_API_KEY";

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("no API credentials configured")]
    NoCredentials,

    #[error("credential {0} has an empty or placeholder secret")]
    InvalidCredential(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Autoscaler and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Floor on pool size.
    pub min_workers: usize,
    /// Ceiling on pool size.
    pub max_workers: usize,
    /// Seconds between autoscaler ticks.
    pub check_interval_secs: u64,
    /// Minimum seconds since the last scale action before scaling up.
    pub scale_up_cooldown_secs: u64,
    /// Minimum seconds since the last scale action before scaling down.
    pub scale_down_cooldown_secs: u64,
    /// Queue depth one worker is expected to absorb.
    pub target_items_per_worker: u64,
    /// Prefix for generated worker names.
    pub worker_prefix: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 3,
            max_workers: 20,
            check_interval_secs: 10,
            scale_up_cooldown_secs: 30,
            scale_down_cooldown_secs: 120,
            target_items_per_worker: 1,
            worker_prefix: "worker".to_string(),
        }
    }
}

impl ScalingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_secs)
    }
}

/// Task executor retry budgets and timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum analysis calls per work item under rate limiting.
    pub max_attempts: u32,
    /// Re-tries of `acquire()` while every credential is cooling.
    pub max_acquire_retries: u32,
    /// Sleep between credential acquisition attempts (ms).
    pub acquire_backoff_ms: u64,
    /// Re-tries after non-rate-limit failures.
    pub max_hard_retries: u32,
    /// Linear backoff step after a hard failure (ms).
    pub hard_retry_backoff_ms: u64,
    /// Upper bound on one analysis call (seconds).
    pub call_timeout_secs: u64,
    /// Idle worker poll interval (ms).
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_acquire_retries: 3,
            acquire_backoff_ms: 2_000,
            max_hard_retries: 3,
            hard_retry_backoff_ms: 5_000,
            call_timeout_secs: 300,
            poll_interval_ms: 100,
        }
    }
}

impl ExecutorConfig {
    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn hard_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.hard_retry_backoff_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Credential secrets and cooldown parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Secrets in configuration order.
    pub keys: Vec<String>,
    /// `API_KEY_n` index of each key when read from the environment; ids
    /// fall back to the position in `keys` when this is empty.
    #[serde(skip)]
    pub key_slots: Vec<usize>,
    /// Cooldown after the first rate limit (seconds).
    pub cooldown_base_secs: u64,
    /// Cap on the cooldown as a multiple of the base.
    pub cooldown_max_multiplier: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            key_slots: Vec::new(),
            cooldown_base_secs: 30,
            cooldown_max_multiplier: 64,
        }
    }
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("keys", &self.credentials())
            .field("cooldown_base_secs", &self.cooldown_base_secs)
            .field("cooldown_max_multiplier", &self.cooldown_max_multiplier)
            .finish()
    }
}

impl CredentialConfig {
    pub fn cooldown_base(&self) -> Duration {
        Duration::from_secs(self.cooldown_base_secs)
    }

    /// Build the credential list with stable `key-{index}` ids.
    pub fn credentials(&self) -> Vec<Credential> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, secret)| Credential::new(self.key_id(i), secret.clone()))
            .collect()
    }

    fn key_id(&self, position: usize) -> String {
        let index = self.key_slots.get(position).copied().unwrap_or(position);
        format!("key-{index}")
    }
}

/// Queue durability and staleness settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory for queue snapshots; `None` keeps the queue in memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    /// Seconds after which a RUNNING item is reported as stale.
    pub stale_after_secs: u64,
    /// Seconds between queue housekeeping ticks.
    pub tick_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            stale_after_secs: 600,
            tick_interval_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub scaling: ScalingConfig,
    pub executor: ExecutorConfig,
    pub credentials: CredentialConfig,
    pub queue: QueueConfig,
}

impl ServiceConfig {
    /// Load from process environment variables and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source and validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let scaling = &mut config.scaling;
        read_var(&lookup, "MIN_WORKERS", &mut scaling.min_workers)?;
        read_var(&lookup, "MAX_WORKERS", &mut scaling.max_workers)?;
        read_var(&lookup, "CHECK_INTERVAL_SECS", &mut scaling.check_interval_secs)?;
        read_var(&lookup, "SCALE_UP_COOLDOWN_SECS", &mut scaling.scale_up_cooldown_secs)?;
        read_var(&lookup, "SCALE_DOWN_COOLDOWN_SECS", &mut scaling.scale_down_cooldown_secs)?;
        read_var(&lookup, "TARGET_ITEMS_PER_WORKER", &mut scaling.target_items_per_worker)?;
        if let Some(prefix) = lookup("WORKER_PREFIX").filter(|p| !p.is_empty()) {
            scaling.worker_prefix = prefix;
        }

        let executor = &mut config.executor;
        read_var(&lookup, "MAX_ATTEMPTS", &mut executor.max_attempts)?;
        read_var(&lookup, "MAX_ACQUIRE_RETRIES", &mut executor.max_acquire_retries)?;
        read_var(&lookup, "ACQUIRE_BACKOFF_MS", &mut executor.acquire_backoff_ms)?;
        read_var(&lookup, "MAX_HARD_RETRIES", &mut executor.max_hard_retries)?;
        read_var(&lookup, "HARD_RETRY_BACKOFF_MS", &mut executor.hard_retry_backoff_ms)?;
        read_var(&lookup, "CALL_TIMEOUT_SECS", &mut executor.call_timeout_secs)?;
        read_var(&lookup, "POLL_INTERVAL_MS", &mut executor.poll_interval_ms)?;

        let credentials = &mut config.credentials;
        read_var(&lookup, "COOLDOWN_BASE_SECS", &mut credentials.cooldown_base_secs)?;
        read_var(&lookup, "COOLDOWN_MAX_MULTIPLIER", &mut credentials.cooldown_max_multiplier)?;
        (credentials.key_slots, credentials.keys) = (0..MAX_ENV_CREDENTIALS)
            .filter_map(|i| lookup(&format!("API_KEY_{i}")).map(|secret| (i, secret)))
            .unzip();

        let queue = &mut config.queue;
        if let Some(dir) = lookup("SNAPSHOT_DIR").filter(|d| !d.is_empty()) {
            queue.snapshot_dir = Some(PathBuf::from(dir));
        }
        read_var(&lookup, "STALE_AFTER_SECS", &mut queue.stale_after_secs)?;
        read_var(&lookup, "QUEUE_TICK_INTERVAL_SECS", &mut queue.tick_interval_secs)?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scaling = &self.scaling;
        if scaling.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if scaling.min_workers > scaling.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                scaling.min_workers, scaling.max_workers
            )));
        }
        if scaling.check_interval_secs == 0 || self.queue.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("tick intervals must be at least 1s".into()));
        }
        if scaling.target_items_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "target_items_per_worker must be at least 1".into(),
            ));
        }
        if scaling.scale_down_cooldown_secs < scaling.scale_up_cooldown_secs {
            return Err(ConfigError::Invalid(
                "scale_down_cooldown must not be shorter than scale_up_cooldown".into(),
            ));
        }
        if self.executor.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.credentials.cooldown_max_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "cooldown_max_multiplier must be at least 1".into(),
            ));
        }
        if self.credentials.keys.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        for (i, secret) in self.credentials.keys.iter().enumerate() {
            let secret = secret.trim();
            if secret.is_empty() || secret == PLACEHOLDER_SECRET {
                return Err(ConfigError::InvalidCredential(self.credentials.key_id(i)));
            }
        }
        Ok(())
    }
}

// Overwrite `slot` when the variable is present; leave the default otherwise.
fn read_var<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn default_config_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.scaling.min_workers, 3);
        assert_eq!(config.scaling.max_workers, 20);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.credentials.cooldown_max_multiplier, 64);
        assert!(config.queue.snapshot_dir.is_none());
    }

    #[test]
    fn reads_overrides_and_indexed_keys() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("MIN_WORKERS", "2"),
            ("MAX_WORKERS", "8"),
            ("TARGET_ITEMS_PER_WORKER", "5"),
            ("API_KEY_0", "alpha-secret"),
            ("API_KEY_3", "delta-secret"),
        ]))?;

        assert_eq!(config.scaling.min_workers, 2);
        assert_eq!(config.scaling.max_workers, 8);
        assert_eq!(config.scaling.target_items_per_worker, 5);
        assert_eq!(config.scaling.check_interval_secs, 10);

        let ids: Vec<String> = config
            .credentials
            .credentials()
            .into_iter()
            .map(|c| c.id.0)
            .collect();
        assert_eq!(ids, vec!["key-0", "key-3"]);
        Ok(())
    }

    #[test]
    fn gap_in_indexed_keys_keeps_env_index() {
        assert_eq!(
            ServiceConfig::from_lookup(lookup_from(&[
                ("API_KEY_1", "bravo-secret"),
                ("API_KEY_4", "YOUR_API_KEY"),
            ])),
            Err(ConfigError::InvalidCredential("key-4".into()))
        );
    }

    #[test]
    fn reads_queue_settings() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("SNAPSHOT_DIR", "/var/lib/analysis"),
            ("STALE_AFTER_SECS", "120"),
            ("QUEUE_TICK_INTERVAL_SECS", "5"),
            ("API_KEY_0", "k"),
        ]))?;
        assert_eq!(config.queue.snapshot_dir, Some(PathBuf::from("/var/lib/analysis")));
        assert_eq!(config.queue.stale_after(), Duration::from_secs(120));
        assert_eq!(config.queue.tick_interval(), Duration::from_secs(5));

        let stopped = ServiceConfig::from_lookup(lookup_from(&[
            ("QUEUE_TICK_INTERVAL_SECS", "0"),
            ("API_KEY_0", "k"),
        ]));
        assert!(matches!(stopped, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn rejects_missing_and_placeholder_keys() {
        assert_eq!(
            ServiceConfig::from_lookup(lookup_from(&[])),
            Err(ConfigError::NoCredentials)
        );
        assert_eq!(
            ServiceConfig::from_lookup(lookup_from(&[("API_KEY_0", "YOUR_API_KEY")])),
            Err(ConfigError::InvalidCredential("key-0".into()))
        );
    }

    #[test]
    fn rejects_bad_numbers_and_bounds() {
        let bad_number =
            ServiceConfig::from_lookup(lookup_from(&[("MIN_WORKERS", "three"), ("API_KEY_0", "k")]));
        assert!(matches!(bad_number, Err(ConfigError::InvalidValue { .. })));

        let inverted = ServiceConfig::from_lookup(lookup_from(&[
            ("MIN_WORKERS", "10"),
            ("MAX_WORKERS", "4"),
            ("API_KEY_0", "k"),
        ]));
        assert!(matches!(inverted, Err(ConfigError::Invalid(_))));

        let thrashing = ServiceConfig::from_lookup(lookup_from(&[
            ("SCALE_UP_COOLDOWN_SECS", "60"),
            ("SCALE_DOWN_COOLDOWN_SECS", "10"),
            ("API_KEY_0", "k"),
        ]));
        assert!(matches!(thrashing, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn deserialize_partial_json() -> Result<(), serde_json::Error> {
        let config: ServiceConfig =
            serde_json::from_str(r#"{ "scaling": { "max_workers": 50 }, "credentials": { "keys": ["k"] } }"#)?;
        assert_eq!(config.scaling.max_workers, 50);
        assert_eq!(config.scaling.min_workers, 3);
        assert_eq!(config.credentials.keys.len(), 1);
        assert_eq!(config.credentials.cooldown_base_secs, 30);
        Ok(())
    }

    #[test]
    fn debug_masks_secrets() {
        let mut config = CredentialConfig::default();
        config.keys.push("supersecretvalue".into());
        let printed = format!("{config:?}");
        assert!(!printed.contains("supersecretvalue"));
    }
}
