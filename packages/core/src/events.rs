//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CredentialId, FailureReason, WorkItemId};

/// Events emitted by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkEvent {
    // Item events
    /// A work item entered the queue.
    ItemEnqueued {
        item_id: WorkItemId,
        timestamp: DateTime<Utc>,
    },
    /// An executor picked the item up.
    ItemStarted {
        item_id: WorkItemId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Analysis returned a result.
    ItemSucceeded {
        item_id: WorkItemId,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Analysis gave up.
    ItemFailed {
        item_id: WorkItemId,
        reason: FailureReason,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    // Credential events
    /// A credential hit a rate limit and is cooling down.
    CredentialCooling {
        credential_id: CredentialId,
        cooldown_ms: u64,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    // Pool events
    /// The autoscaler changed the worker count.
    PoolScaled {
        from: usize,
        to: usize,
        queue_depth: u64,
        timestamp: DateTime<Utc>,
    },
    /// A worker finished draining and stopped.
    WorkerRetired {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkEvent::ItemEnqueued { timestamp, .. }
            | WorkEvent::ItemStarted { timestamp, .. }
            | WorkEvent::ItemSucceeded { timestamp, .. }
            | WorkEvent::ItemFailed { timestamp, .. }
            | WorkEvent::CredentialCooling { timestamp, .. }
            | WorkEvent::PoolScaled { timestamp, .. }
            | WorkEvent::WorkerRetired { timestamp, .. } => *timestamp,
        }
    }

    /// Get the work item associated with this event, if any.
    pub fn item_id(&self) -> Option<WorkItemId> {
        match self {
            WorkEvent::ItemEnqueued { item_id, .. }
            | WorkEvent::ItemStarted { item_id, .. }
            | WorkEvent::ItemSucceeded { item_id, .. }
            | WorkEvent::ItemFailed { item_id, .. } => Some(*item_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            WorkEvent::ItemEnqueued { item_id, .. } => format!("Item {} enqueued", item_id),
            WorkEvent::ItemStarted {
                item_id, worker_id, ..
            } => format!("Item {} started by {}", item_id, worker_id),
            WorkEvent::ItemSucceeded {
                item_id,
                attempts,
                duration_ms,
                ..
            } => format!(
                "Item {} succeeded after {} attempt(s) in {}ms",
                item_id, attempts, duration_ms
            ),
            WorkEvent::ItemFailed {
                item_id,
                reason,
                attempts,
                ..
            } => format!("Item {} failed ({}) after {} attempt(s)", item_id, reason, attempts),
            WorkEvent::CredentialCooling {
                credential_id,
                cooldown_ms,
                ..
            } => format!("Credential {} cooling for {}ms", credential_id, cooldown_ms),
            WorkEvent::PoolScaled { from, to, .. } => format!("Pool scaled {} -> {}", from, to),
            WorkEvent::WorkerRetired { worker_id, .. } => format!("Worker {} retired", worker_id),
        }
    }
}
