//! File-based queue snapshots.

use std::path::{Path, PathBuf};

use analysis_core::QueueSnapshot;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SNAPSHOT_FILE: &str = "queue.json";

/// Persists the queue's work items so pending items survive a restart.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    /// Directory holding the snapshot file.
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Write the snapshot.
    pub async fn save(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path();
        let json = serde_json::to_string_pretty(snapshot)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Saved {} items to {:?}", snapshot.items.len(), path);
        Ok(())
    }

    /// Read the last snapshot, if one was written.
    pub async fn load(&self) -> Result<Option<QueueSnapshot>, PersistenceError> {
        let path = self.path();
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let mut file = fs::File::open(&path).await?;
        let mut json = String::new();
        file.read_to_string(&mut json).await?;

        let snapshot: QueueSnapshot = serde_json::from_str(&json)?;
        tracing::debug!("Loaded {} items from {:?}", snapshot.items.len(), path);
        Ok(Some(snapshot))
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use analysis_core::{PayloadRef, WorkItem};

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() -> Result<(), PersistenceError> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path().join("nested"));
        assert!(store.load().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() -> Result<(), PersistenceError> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path());

        let first = QueueSnapshot::new(vec![WorkItem::new(PayloadRef::new("a.mp3"))]);
        store.save(&first).await?;
        let second = QueueSnapshot::new(vec![
            WorkItem::new(PayloadRef::new("b.mp3")),
            WorkItem::new(PayloadRef::new("c.mp3")).with_context("interview"),
        ]);
        store.save(&second).await?;

        let loaded = store.load().await?.unwrap();
        assert_eq!(loaded, second);
        assert!(!dir.path().join("queue.json.tmp").exists());
        Ok(())
    }
}
