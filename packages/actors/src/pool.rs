//! Worker pool supervisor and the control seam the autoscaler drives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::WorkEvent;
use chrono::Utc;
use futures_util::future::BoxFuture;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio::sync::broadcast;

use crate::executor::TaskExecutor;
use crate::messages::{PoolMessage, QueueMessage, ScaleError, WorkerMessage};
use crate::worker_actor::{QUEUE_UNAVAILABLE, RETIRED, WorkerActor, WorkerArgs};

/// Operations the autoscaler needs from whatever runs the workers.
pub trait PoolControl: Send + Sync {
    /// Number of active workers, not counting ones draining.
    fn current_count(&self) -> BoxFuture<'_, Result<usize, ScaleError>>;

    /// Spawn or retire workers until the active count equals `target`,
    /// clamped to the pool's bounds. Returns the new active count.
    fn scale_to(&self, target: usize) -> BoxFuture<'_, Result<usize, ScaleError>>;

    /// Retire one worker once its current item is done.
    fn drain_one(&self) -> BoxFuture<'_, Result<usize, ScaleError>>;
}

/// `PoolControl` over a running [`WorkerPool`] actor.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    actor: ActorRef<PoolMessage>,
    timeout: Duration,
}

impl WorkerPoolHandle {
    pub fn new(actor: ActorRef<PoolMessage>) -> Self {
        Self {
            actor,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn actor(&self) -> &ActorRef<PoolMessage> {
        &self.actor
    }

    /// Names of the active workers.
    pub async fn list_workers(&self) -> Result<Vec<String>, ScaleError> {
        self.call(|reply| PoolMessage::ListWorkers { reply }).await
    }

    async fn call<T, F>(&self, build: F) -> Result<T, ScaleError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> PoolMessage + Send,
    {
        match ractor::rpc::call(&self.actor, build, Some(self.timeout)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ScaleError::Unavailable("request timed out".into())),
            Ok(CallResult::SenderError) => {
                Err(ScaleError::Unavailable("pool dropped the request".into()))
            }
            Err(e) => Err(ScaleError::Unavailable(e.to_string())),
        }
    }
}

impl PoolControl for WorkerPoolHandle {
    fn current_count(&self) -> BoxFuture<'_, Result<usize, ScaleError>> {
        Box::pin(async move { self.call(|reply| PoolMessage::CurrentCount { reply }).await })
    }

    fn scale_to(&self, target: usize) -> BoxFuture<'_, Result<usize, ScaleError>> {
        Box::pin(async move {
            self.call(|reply| PoolMessage::ScaleTo { target, reply })
                .await?
        })
    }

    fn drain_one(&self) -> BoxFuture<'_, Result<usize, ScaleError>> {
        Box::pin(async move { self.call(|reply| PoolMessage::DrainOne { reply }).await? })
    }
}

/// Worker pool arguments.
pub struct WorkerPoolArgs {
    pub queue: ActorRef<QueueMessage>,
    pub executor: Arc<TaskExecutor>,
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_prefix: String,
    pub poll_interval: Duration,
    pub event_tx: Option<broadcast::Sender<WorkEvent>>,
}

/// State for the worker pool.
pub struct WorkerPoolState {
    args: WorkerPoolArgs,
    /// Workers accepting new items, oldest first.
    active: Vec<(String, ActorRef<WorkerMessage>)>,
    /// Workers told to stop that have not exited yet.
    retiring: HashMap<ActorId, String>,
    /// Worker counter for unique names.
    spawned: u64,
    shutting_down: bool,
}

impl WorkerPoolState {
    fn broadcast(&self, event: WorkEvent) {
        if let Some(ref tx) = self.args.event_tx {
            let _ = tx.send(event);
        }
    }

    fn clamp(&self, target: usize) -> usize {
        target.clamp(self.args.min_workers, self.args.max_workers)
    }

    async fn spawn_worker(&mut self, myself: &ActorRef<PoolMessage>) -> Result<(), ActorProcessingErr> {
        self.spawned += 1;
        let worker_id = format!("{}-{}", self.args.worker_prefix, self.spawned);
        let args = WorkerArgs {
            worker_id: worker_id.clone(),
            queue: self.args.queue.clone(),
            executor: self.args.executor.clone(),
            poll_interval: self.args.poll_interval,
        };

        let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

        self.active.push((worker_id, worker));
        Ok(())
    }

    /// Stop the newest worker; ractor lets its current item finish first.
    fn retire_one(&mut self) -> Option<String> {
        let (worker_id, worker) = self.active.pop()?;
        tracing::info!("Retiring worker {}", worker_id);
        worker.stop(Some(RETIRED.to_string()));
        self.retiring.insert(worker.get_id(), worker_id.clone());
        Some(worker_id)
    }

    async fn scale_to(
        &mut self,
        myself: &ActorRef<PoolMessage>,
        target: usize,
    ) -> Result<usize, ScaleError> {
        let target = self.clamp(target);
        let from = self.active.len();

        while self.active.len() < target {
            self.spawn_worker(myself)
                .await
                .map_err(|e| ScaleError::Unavailable(e.to_string()))?;
        }
        while self.active.len() > target {
            self.retire_one();
        }

        if from != target {
            tracing::info!("Worker pool scaled from {} to {}", from, target);
        }
        Ok(self.active.len())
    }

    async fn worker_exited(
        &mut self,
        myself: &ActorRef<PoolMessage>,
        id: ActorId,
        cause: String,
    ) {
        if let Some(worker_id) = self.retiring.remove(&id) {
            tracing::info!("Worker {} retired", worker_id);
            self.broadcast(WorkEvent::WorkerRetired {
                worker_id,
                timestamp: Utc::now(),
            });
        } else if let Some(pos) = self.active.iter().position(|(_, w)| w.get_id() == id) {
            let (worker_id, _) = self.active.remove(pos);
            tracing::warn!("Worker {} exited unexpectedly: {}", worker_id, cause);

            if cause == QUEUE_UNAVAILABLE {
                // Replacements would lose the queue the same way.
                tracing::error!(
                    "Queue is gone, not replacing worker {} ({} workers left)",
                    worker_id,
                    self.active.len()
                );
            } else {
                let lost = QueueMessage::WorkerLost {
                    worker_id: worker_id.clone(),
                };
                if let Err(e) = self.args.queue.send_message(lost) {
                    tracing::warn!("Cannot release items of worker {}: {}", worker_id, e);
                }

                if !self.shutting_down {
                    while self.active.len() < self.args.min_workers {
                        if let Err(e) = self.spawn_worker(myself).await {
                            tracing::error!("Cannot replace worker {}: {}", worker_id, e);
                            break;
                        }
                    }
                }
            }
        }

        if self.shutting_down && self.active.is_empty() && self.retiring.is_empty() {
            myself.stop(None);
        }
    }
}

/// Supervisor owning the worker actors.
pub struct WorkerPool;

impl Actor for WorkerPool {
    type Msg = PoolMessage;
    type State = WorkerPoolState;
    type Arguments = WorkerPoolArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker pool with {}..{} workers",
            args.min_workers,
            args.max_workers
        );

        let mut state = WorkerPoolState {
            args,
            active: Vec::new(),
            retiring: HashMap::new(),
            spawned: 0,
            shutting_down: false,
        };
        while state.active.len() < state.args.min_workers {
            state.spawn_worker(&myself).await?;
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::CurrentCount { reply } => {
                let _ = reply.send(state.active.len());
            }

            PoolMessage::ScaleTo { target, reply } => {
                let result = if state.shutting_down {
                    Err(ScaleError::Unavailable("pool is shutting down".into()))
                } else {
                    state.scale_to(&myself, target).await
                };
                let _ = reply.send(result);
            }

            PoolMessage::DrainOne { reply } => {
                let result = if state.shutting_down {
                    Err(ScaleError::Unavailable("pool is shutting down".into()))
                } else if state.active.len() <= state.args.min_workers {
                    Err(ScaleError::AtMinimum(state.args.min_workers))
                } else {
                    state.retire_one();
                    Ok(state.active.len())
                };
                let _ = reply.send(result);
            }

            PoolMessage::ListWorkers { reply } => {
                let names = state.active.iter().map(|(name, _)| name.clone()).collect();
                let _ = reply.send(names);
            }

            PoolMessage::Shutdown => {
                tracing::info!("Shutting down worker pool");
                state.shutting_down = true;
                while state.retire_one().is_some() {}
                if state.retiring.is_empty() {
                    myself.stop(None);
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let cause = reason.unwrap_or_else(|| "stopped".to_string());
                state.worker_exited(&myself, cell.get_id(), cause).await;
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                state.worker_exited(&myself, cell.get_id(), err.to_string()).await;
            }
            _ => {}
        }
        Ok(())
    }
}
