//! Shared key-value record of work item state.

use analysis_core::{QueueStats, WorkItem, WorkItemId, WorkStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

/// Status store errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Work item not found: {0}")]
    NotFound(WorkItemId),

    #[error("Work item already exists: {0}")]
    AlreadyExists(WorkItemId),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: WorkItemId,
        from: &'static str,
        to: &'static str,
    },
}

/// Work item records keyed by id.
///
/// Every read-modify-write holds the lock of the item's shard only, so
/// executors updating different items do not serialize on each other.
#[derive(Debug, Default)]
pub struct StatusStore {
    items: DashMap<WorkItemId, WorkItem>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    /// Insert a new item. Ids are never reused.
    pub fn put(&self, item: WorkItem) -> Result<(), StoreError> {
        match self.items.entry(item.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(item.id)),
            Entry::Vacant(slot) => {
                slot.insert(item);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        self.items
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    /// Move an item to its next status.
    ///
    /// Only PENDING → RUNNING and RUNNING → SUCCEEDED/FAILED are accepted;
    /// anything else, including touching a terminal item, is rejected.
    pub fn update_status(&self, id: WorkItemId, status: WorkStatus) -> Result<WorkItem, StoreError> {
        let mut entry = self.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !entry.status.can_transition_to(&status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: entry.status.as_str(),
                to: status.as_str(),
            });
        }
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Count one more analysis call against a RUNNING item.
    pub fn record_attempt(&self, id: WorkItemId) -> Result<u32, StoreError> {
        let mut entry = self.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !matches!(entry.status, WorkStatus::Running { .. }) {
            return Err(StoreError::InvalidTransition {
                id,
                from: entry.status.as_str(),
                to: "running",
            });
        }
        entry.attempts = entry.attempts.saturating_add(1);
        entry.updated_at = Utc::now();
        Ok(entry.attempts)
    }

    /// RUNNING items whose last update is older than `older_than`.
    pub fn stale_running(&self, older_than: chrono::Duration) -> Vec<WorkItem> {
        self.stale_running_at(Utc::now(), older_than)
    }

    pub fn stale_running_at(&self, now: DateTime<Utc>, older_than: chrono::Duration) -> Vec<WorkItem> {
        self.items
            .iter()
            .filter(|entry| {
                matches!(entry.status, WorkStatus::Running { .. })
                    && now - entry.updated_at > older_than
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Items per lifecycle stage.
    pub fn counts(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.items.iter() {
            match entry.status {
                WorkStatus::Pending => stats.pending += 1,
                WorkStatus::Running { .. } => stats.running += 1,
                WorkStatus::Succeeded { .. } => stats.succeeded += 1,
                WorkStatus::Failed { .. } => stats.failed += 1,
            }
        }
        stats
    }

    /// Copy of every item, oldest first.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
