//! Queue statistics and the on-disk snapshot format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkItem;

/// Counts of work items by lifecycle stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Items waiting for an executor.
    pub pending: u64,
    /// Items held by an executor.
    pub running: u64,
    /// Items that ended `Succeeded` (since start).
    pub succeeded: u64,
    /// Items that ended `Failed` (since start).
    pub failed: u64,
}

impl QueueStats {
    /// Queue depth as seen by the autoscaler (pending + running).
    pub fn depth(&self) -> u64 {
        self.pending + self.running
    }

    /// Total processed items.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }
}

/// Everything the queue needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<WorkItem>,
    pub taken_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            taken_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_counts_pending_and_running() {
        let stats = QueueStats {
            pending: 40,
            running: 10,
            succeeded: 3,
            failed: 1,
        };
        assert_eq!(stats.depth(), 50);
        assert_eq!(stats.processed(), 4);
        assert_eq!(stats.success_rate(), Some(75.0));
        assert_eq!(QueueStats::default().success_rate(), None);
    }
}
