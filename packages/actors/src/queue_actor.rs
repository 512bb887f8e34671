//! Queue actor: FIFO handoff of pending work items to workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use analysis_core::{
    Failure, FailureReason, QueueSnapshot, QueueStats, WorkEvent, WorkItemId, WorkStatus,
};
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use store::StatusStore;
use tokio::sync::broadcast;

use crate::messages::QueueMessage;
use crate::persistence::SnapshotStore;

/// State for the queue actor.
pub struct QueueActorState {
    /// Work item records shared with executors and status callers.
    store: Arc<StatusStore>,
    /// Pending items in arrival order.
    pending: VecDeque<WorkItemId>,
    /// Items handed to a worker, by the worker holding them.
    in_flight: HashMap<WorkItemId, String>,
    /// Snapshot target, when durability is enabled.
    persistence: Option<SnapshotStore>,
    /// Event broadcaster.
    event_tx: Option<broadcast::Sender<WorkEvent>>,
    /// Housekeeping tick interval.
    tick_interval: Duration,
    /// Age after which a RUNNING item is reported.
    stale_after: chrono::Duration,
}

impl QueueActorState {
    /// Create a new queue actor state.
    pub fn new(store: Arc<StatusStore>) -> Self {
        Self {
            store,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            persistence: None,
            event_tx: None,
            tick_interval: Duration::from_secs(30),
            stale_after: chrono::Duration::minutes(10),
        }
    }

    /// Enable snapshots in the given store.
    pub fn with_persistence(mut self, persistence: SnapshotStore) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Set the housekeeping interval and stale threshold.
    pub fn with_housekeeping(mut self, tick_interval: Duration, stale_after: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        self
    }

    /// Broadcast an event.
    fn broadcast(&self, event: WorkEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn stats(&self) -> QueueStats {
        let counts = self.store.counts();
        QueueStats {
            pending: self.pending.len() as u64,
            running: self.in_flight.len() as u64,
            succeeded: counts.succeeded,
            failed: counts.failed,
        }
    }

    /// Load the last snapshot into the store and re-queue what was pending.
    async fn restore(&mut self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = match persistence.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to load queue snapshot: {}", e);
                return;
            }
        };

        let mut requeued = 0;
        for item in snapshot.items {
            let id = item.id;
            let pending = matches!(item.status, WorkStatus::Pending);
            if let Err(e) = self.store.put(item) {
                tracing::warn!("Skipping restored item: {}", e);
                continue;
            }
            if pending {
                self.pending.push_back(id);
                requeued += 1;
            }
        }
        tracing::info!(
            "Restored {} items from snapshot, {} pending",
            self.store.len(),
            requeued
        );
    }

    /// Release every item held by `worker_id`. Items it never claimed go back
    /// to the front of the queue; items it left RUNNING are failed.
    fn release_worker(&mut self, worker_id: &str) {
        let held: Vec<WorkItemId> = self
            .in_flight
            .iter()
            .filter(|(_, holder)| holder.as_str() == worker_id)
            .map(|(id, _)| *id)
            .collect();

        for item_id in held {
            self.in_flight.remove(&item_id);
            let item = match self.store.get(item_id) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!("Released unknown item: {}", e);
                    continue;
                }
            };
            match item.status {
                WorkStatus::Pending => {
                    tracing::info!(item = %item_id, worker = worker_id, "Re-queueing item of lost worker");
                    self.pending.push_front(item_id);
                }
                WorkStatus::Running { started_at, .. } => {
                    let now = Utc::now();
                    let failure = Failure::new(
                        FailureReason::ProviderError,
                        format!("worker {} exited while processing the item", worker_id),
                    );
                    let failed = WorkStatus::Failed {
                        started_at,
                        failed_at: now,
                        failure,
                    };
                    if let Err(e) = self.store.update_status(item_id, failed) {
                        tracing::error!(item = %item_id, "Cannot fail item of lost worker: {}", e);
                        continue;
                    }
                    tracing::warn!(item = %item_id, worker = worker_id, "Failed item of lost worker");
                    self.broadcast(WorkEvent::ItemFailed {
                        item_id,
                        reason: FailureReason::ProviderError,
                        attempts: item.attempts,
                        timestamp: now,
                    });
                }
                _ => {}
            }
        }
    }

    async fn save_snapshot(&self) {
        if let Some(persistence) = &self.persistence {
            let snapshot = QueueSnapshot::new(self.store.snapshot());
            if let Err(e) = persistence.save(&snapshot).await {
                tracing::warn!("Failed to save queue snapshot: {}", e);
            }
        }
    }
}

/// Queue actor that hands each pending item to exactly one worker.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        mut args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor");
        args.restore().await;

        // Start periodic tick
        let interval = args.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if myself.send_message(QueueMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(args)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.save_snapshot().await;
        tracing::info!("Queue actor stopped with {} pending items", state.pending.len());
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { item, reply } => {
                let item = *item;
                let item_id = item.id;
                if !matches!(item.status, WorkStatus::Pending) {
                    let _ = reply.send(Err(format!("Item {} is not pending", item_id)));
                    return Ok(());
                }
                if let Err(e) = state.store.put(item) {
                    let _ = reply.send(Err(e.to_string()));
                    return Ok(());
                }

                state.pending.push_back(item_id);
                state.broadcast(WorkEvent::ItemEnqueued {
                    item_id,
                    timestamp: Utc::now(),
                });
                tracing::debug!(item = %item_id, depth = state.pending.len(), "Item enqueued");

                let _ = reply.send(Ok(item_id));
            }

            QueueMessage::RequestItem { worker_id, reply } => {
                let mut handed_out = None;
                while let Some(item_id) = state.pending.pop_front() {
                    // Only items still PENDING in the store are handed out.
                    match state.store.get(item_id) {
                        Ok(item) if matches!(item.status, WorkStatus::Pending) => {
                            state.in_flight.insert(item_id, worker_id.clone());
                            handed_out = Some(item_id);
                            break;
                        }
                        Ok(item) => tracing::warn!(
                            item = %item_id,
                            status = item.status.as_str(),
                            "Dropping non-pending item from queue"
                        ),
                        Err(e) => tracing::warn!("Dropping unknown item from queue: {}", e),
                    }
                }
                if reply.send(handed_out).is_err()
                    && let Some(item_id) = handed_out
                {
                    tracing::warn!(item = %item_id, worker = %worker_id, "Worker went away before taking item, re-queueing");
                    state.in_flight.remove(&item_id);
                    state.pending.push_front(item_id);
                }
            }

            QueueMessage::ItemFinished { item_id, worker_id } => {
                if state.in_flight.remove(&item_id).is_none() {
                    tracing::warn!(item = %item_id, worker = %worker_id, "Finished item was not in flight");
                }
            }

            QueueMessage::WorkerLost { worker_id } => {
                state.release_worker(&worker_id);
            }

            QueueMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            QueueMessage::Tick => {
                for item in state.store.stale_running(state.stale_after) {
                    tracing::warn!(
                        item = %item.id,
                        since = %item.updated_at,
                        "Item has been running past the staleness threshold"
                    );
                }
                state.save_snapshot().await;
            }

            QueueMessage::Shutdown => {
                tracing::info!("Shutting down queue actor");
                myself.stop(None);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use analysis_core::{PayloadRef, WorkItem};
    use ractor::rpc::CallResult;
    use std::error::Error;

    async fn enqueue(
        queue: &ActorRef<QueueMessage>,
        item: WorkItem,
    ) -> Result<Result<WorkItemId, String>, Box<dyn Error>> {
        let result = ractor::rpc::call(
            queue,
            |reply| QueueMessage::Enqueue {
                item: Box::new(item),
                reply,
            },
            None,
        )
        .await?;
        match result {
            CallResult::Success(r) => Ok(r),
            _ => Err("enqueue call failed".into()),
        }
    }

    async fn request(queue: &ActorRef<QueueMessage>) -> Result<Option<WorkItemId>, Box<dyn Error>> {
        match ractor::rpc::call(
            queue,
            |reply| QueueMessage::RequestItem {
                worker_id: "worker-1".into(),
                reply,
            },
            None,
        )
        .await?
        {
            CallResult::Success(r) => Ok(r),
            _ => Err("request call failed".into()),
        }
    }

    async fn stats(queue: &ActorRef<QueueMessage>) -> Result<QueueStats, Box<dyn Error>> {
        match ractor::rpc::call(queue, |reply| QueueMessage::GetStats { reply }, None).await? {
            CallResult::Success(r) => Ok(r),
            _ => Err("stats call failed".into()),
        }
    }

    #[tokio::test]
    async fn hands_out_items_in_arrival_order_once() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(StatusStore::new());
        let (queue, handle) = Actor::spawn(None, QueueActor, QueueActorState::new(store.clone())).await?;

        let first = enqueue(&queue, WorkItem::new(PayloadRef::new("1.mp3"))).await??;
        let second = enqueue(&queue, WorkItem::new(PayloadRef::new("2.mp3"))).await??;
        assert_eq!(stats(&queue).await?.depth(), 2);

        assert_eq!(request(&queue).await?, Some(first));
        assert_eq!(request(&queue).await?, Some(second));
        assert_eq!(request(&queue).await?, None);

        let s = stats(&queue).await?;
        assert_eq!((s.pending, s.running), (0, 2));

        queue.send_message(QueueMessage::ItemFinished {
            item_id: first,
            worker_id: "worker-1".into(),
        })?;
        assert_eq!(stats(&queue).await?.running, 1);

        queue.stop(None);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn rejects_duplicates_and_non_pending_items() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(StatusStore::new());
        let (queue, handle) = Actor::spawn(None, QueueActor, QueueActorState::new(store.clone())).await?;

        let item = WorkItem::new(PayloadRef::new("dup.mp3"));
        enqueue(&queue, item.clone()).await??;
        assert!(enqueue(&queue, item).await?.is_err());

        let mut running = WorkItem::new(PayloadRef::new("odd.mp3"));
        running.status = WorkStatus::Running {
            started_at: Utc::now(),
            worker_id: "elsewhere".into(),
        };
        assert!(enqueue(&queue, running).await?.is_err());

        queue.stop(None);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn pending_items_survive_a_restart() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;

        let store = Arc::new(StatusStore::new());
        let state = QueueActorState::new(store.clone()).with_persistence(SnapshotStore::new(dir.path()));
        let (queue, handle) = Actor::spawn(None, QueueActor, state).await?;
        let taken = enqueue(&queue, WorkItem::new(PayloadRef::new("taken.mp3"))).await??;
        let waiting = enqueue(&queue, WorkItem::new(PayloadRef::new("waiting.mp3"))).await??;
        assert_eq!(request(&queue).await?, Some(taken));
        store.update_status(
            taken,
            WorkStatus::Running {
                started_at: Utc::now(),
                worker_id: "worker-1".into(),
            },
        )?;
        queue.send_message(QueueMessage::Shutdown)?;
        handle.await?;

        let restored = Arc::new(StatusStore::new());
        let state = QueueActorState::new(restored.clone()).with_persistence(SnapshotStore::new(dir.path()));
        let (queue, handle) = Actor::spawn(None, QueueActor, state).await?;

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(taken)?.status.as_str(), "running");
        assert_eq!(request(&queue).await?, Some(waiting));
        assert_eq!(request(&queue).await?, None);

        queue.stop(None);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn item_is_kept_when_the_requester_is_gone() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(StatusStore::new());
        let (queue, handle) = Actor::spawn(None, QueueActor, QueueActorState::new(store.clone())).await?;
        let id = enqueue(&queue, WorkItem::new(PayloadRef::new("orphan.mp3"))).await??;

        let (tx, rx) = ractor::concurrency::oneshot();
        drop(rx);
        queue.send_message(QueueMessage::RequestItem {
            worker_id: "worker-gone".into(),
            reply: tx.into(),
        })?;

        assert_eq!(request(&queue).await?, Some(id));
        assert_eq!(stats(&queue).await?.running, 1);

        queue.stop(None);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn lost_worker_releases_its_items() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(StatusStore::new());
        let (tx, mut rx) = broadcast::channel(16);
        let state = QueueActorState::new(store.clone()).with_event_tx(tx);
        let (queue, handle) = Actor::spawn(None, QueueActor, state).await?;

        let unclaimed = enqueue(&queue, WorkItem::new(PayloadRef::new("a.mp3"))).await??;
        let claimed = enqueue(&queue, WorkItem::new(PayloadRef::new("b.mp3"))).await??;
        assert_eq!(request(&queue).await?, Some(unclaimed));
        assert_eq!(request(&queue).await?, Some(claimed));
        store.update_status(
            claimed,
            WorkStatus::Running {
                started_at: Utc::now(),
                worker_id: "worker-1".into(),
            },
        )?;

        queue.send_message(QueueMessage::WorkerLost {
            worker_id: "worker-1".into(),
        })?;

        let s = stats(&queue).await?;
        assert_eq!((s.pending, s.running), (1, 0));
        assert_eq!(store.get(claimed)?.status.as_str(), "failed");
        assert_eq!(request(&queue).await?, Some(unclaimed));

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkEvent::ItemFailed { item_id, .. } = event {
                failed.push(item_id);
            }
        }
        assert_eq!(failed, vec![claimed]);

        queue.stop(None);
        handle.await?;
        Ok(())
    }
}
