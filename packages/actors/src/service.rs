//! Wires the store, credential pool and actors into one running service.

use std::sync::Arc;
use std::time::Duration;

use analysis_core::{
    ConfigError, HealthReport, PayloadRef, QueueStats, ServiceConfig, WorkEvent, WorkItem,
    WorkItemId,
};
use chrono::Utc;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef};
use store::{CredentialPool, PoolError, StatusStore, StoreError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::analyzer::Analyzer;
use crate::autoscaler::{AutoscalerActor, AutoscalerArgs, ControlLoop, ScalingPolicy};
use crate::executor::TaskExecutor;
use crate::messages::{AutoscalerMessage, PoolMessage, QueueMessage};
use crate::persistence::SnapshotStore;
use crate::pool::{PoolControl, WorkerPool, WorkerPoolArgs, WorkerPoolHandle};
use crate::queue_actor::{QueueActor, QueueActorState};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to service callers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credentials(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn {0}")]
    Spawn(String),

    #[error("queue error: {0}")]
    Queue(String),
}

/// Handle to a running service.
pub struct ServiceHandle {
    store: Arc<StatusStore>,
    credentials: Arc<CredentialPool>,
    queue: ActorRef<QueueMessage>,
    queue_task: JoinHandle<()>,
    pool: WorkerPoolHandle,
    pool_task: JoinHandle<()>,
    autoscaler: ActorRef<AutoscalerMessage>,
    autoscaler_task: JoinHandle<()>,
    event_tx: broadcast::Sender<WorkEvent>,
    stale_after: Duration,
}

/// Validate the configuration and start the queue, worker pool and autoscaler.
pub async fn start_service(
    config: ServiceConfig,
    analyzer: Arc<dyn Analyzer>,
) -> Result<ServiceHandle, ServiceError> {
    config.validate()?;

    let (event_tx, _) = broadcast::channel(1024);
    let store = Arc::new(StatusStore::new());
    let credentials = Arc::new(CredentialPool::from_config(&config.credentials)?);
    tracing::info!(
        "Loaded {} credentials: {:?}",
        credentials.len(),
        config.credentials.credentials()
    );

    let mut queue_state = QueueActorState::new(store.clone())
        .with_event_tx(event_tx.clone())
        .with_housekeeping(config.queue.tick_interval(), config.queue.stale_after());
    if let Some(dir) = &config.queue.snapshot_dir {
        queue_state = queue_state.with_persistence(SnapshotStore::new(dir));
    }
    let (queue, queue_task) = Actor::spawn(None, QueueActor, queue_state)
        .await
        .map_err(|e| ServiceError::Spawn(format!("queue: {}", e)))?;

    let executor = Arc::new(
        TaskExecutor::new(
            store.clone(),
            credentials.clone(),
            analyzer,
            config.executor.clone(),
        )
        .with_event_tx(event_tx.clone()),
    );

    let pool_args = WorkerPoolArgs {
        queue: queue.clone(),
        executor,
        min_workers: config.scaling.min_workers,
        max_workers: config.scaling.max_workers,
        worker_prefix: config.scaling.worker_prefix.clone(),
        poll_interval: config.executor.poll_interval(),
        event_tx: Some(event_tx.clone()),
    };
    let (pool_actor, pool_task) = match Actor::spawn(None, WorkerPool, pool_args).await {
        Ok(spawned) => spawned,
        Err(e) => {
            queue.stop(None);
            return Err(ServiceError::Spawn(format!("worker pool: {}", e)));
        }
    };
    let pool = WorkerPoolHandle::new(pool_actor);

    let control = ControlLoop::new(
        ScalingPolicy::from_config(&config.scaling),
        Arc::new(pool.clone()),
    )
    .with_event_tx(event_tx.clone());
    let autoscaler_args = AutoscalerArgs {
        control,
        queue: queue.clone(),
        check_interval: config.scaling.check_interval(),
    };
    let (autoscaler, autoscaler_task) =
        match Actor::spawn(None, AutoscalerActor, autoscaler_args).await {
            Ok(spawned) => spawned,
            Err(e) => {
                pool.actor().send_message(PoolMessage::Shutdown).ok();
                queue.stop(None);
                return Err(ServiceError::Spawn(format!("autoscaler: {}", e)));
            }
        };

    tracing::info!("Analysis service started");

    Ok(ServiceHandle {
        store,
        credentials,
        queue,
        queue_task,
        pool,
        pool_task,
        autoscaler,
        autoscaler_task,
        event_tx,
        stale_after: config.queue.stale_after(),
    })
}

impl ServiceHandle {
    /// Enqueue a new work item and return its id.
    pub async fn submit(
        &self,
        payload: impl Into<String>,
        context: Option<String>,
    ) -> Result<WorkItemId, ServiceError> {
        let mut item = WorkItem::new(PayloadRef::new(payload));
        item.context = context;

        let result = ractor::rpc::call(
            &self.queue,
            |reply| QueueMessage::Enqueue {
                item: Box::new(item),
                reply,
            },
            Some(CALL_TIMEOUT),
        )
        .await;
        match result {
            Ok(CallResult::Success(Ok(id))) => Ok(id),
            Ok(CallResult::Success(Err(e))) => Err(ServiceError::Queue(e)),
            Ok(_) => Err(ServiceError::Queue("enqueue was not acknowledged".into())),
            Err(e) => Err(ServiceError::Queue(e.to_string())),
        }
    }

    /// Current record of a work item.
    pub fn status(&self, id: WorkItemId) -> Result<WorkItem, ServiceError> {
        Ok(self.store.get(id)?)
    }

    /// Queue depth and outcome counts.
    pub async fn stats(&self) -> Result<QueueStats, ServiceError> {
        let result = ractor::rpc::call(
            &self.queue,
            |reply| QueueMessage::GetStats { reply },
            Some(CALL_TIMEOUT),
        )
        .await;
        match result {
            Ok(CallResult::Success(stats)) => Ok(stats),
            Ok(_) => Err(ServiceError::Queue("stats request was not answered".into())),
            Err(e) => Err(ServiceError::Queue(e.to_string())),
        }
    }

    /// Snapshot of queue, pool and credential state.
    pub async fn health(&self) -> Result<HealthReport, ServiceError> {
        let queue = self.stats().await?;
        let workers = self
            .pool
            .current_count()
            .await
            .map_err(|e| ServiceError::Queue(e.to_string()))?;

        Ok(HealthReport {
            queue,
            workers,
            credentials: self.credentials.status(),
            checked_at: Utc::now(),
        })
    }

    /// RUNNING items older than the configured staleness threshold.
    pub fn stale_items(&self) -> Vec<WorkItem> {
        let older_than =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        self.store.stale_running(older_than)
    }

    /// Subscribe to work events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    pub fn pool(&self) -> &WorkerPoolHandle {
        &self.pool
    }

    /// Stop the autoscaler, drain the workers, then stop the queue.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down analysis service");

        self.autoscaler.stop(None);
        if let Err(e) = self.autoscaler_task.await {
            tracing::warn!("Autoscaler task ended abnormally: {}", e);
        }

        if self.pool.actor().send_message(PoolMessage::Shutdown).is_ok()
            && let Err(e) = self.pool_task.await
        {
            tracing::warn!("Worker pool task ended abnormally: {}", e);
        }

        if self.queue.send_message(QueueMessage::Shutdown).is_ok()
            && let Err(e) = self.queue_task.await
        {
            tracing::warn!("Queue task ended abnormally: {}", e);
        }

        tracing::info!("Analysis service stopped");
    }
}
