//! Health snapshot reported to status callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CredentialStatus, QueueStats};

/// Combined view of queue, pool and credential state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub queue: QueueStats,
    pub workers: usize,
    pub credentials: Vec<CredentialStatus>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Whether any credential can take a call right now.
    pub fn has_usable_credential(&self) -> bool {
        self.credentials.iter().any(|c| c.usable)
    }

    pub fn is_healthy(&self) -> bool {
        self.workers > 0 && self.has_usable_credential()
    }
}
