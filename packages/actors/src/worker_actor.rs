//! Worker actor: pulls items from the queue and runs them through the executor.

use std::sync::Arc;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::executor::TaskExecutor;
use crate::messages::{QueueMessage, WorkerMessage};

/// Stop reason the pool uses when it retires a worker.
pub const RETIRED: &str = "retired";

/// Stop reason of a worker whose queue stopped answering.
pub const QUEUE_UNAVAILABLE: &str = "queue unavailable";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    /// Queue actor reference.
    pub queue: ActorRef<QueueMessage>,
    /// Shared executor.
    pub executor: Arc<TaskExecutor>,
    /// Delay before polling an empty queue again.
    pub poll_interval: Duration,
    /// Items this worker finished, whatever the outcome.
    pub processed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queue: ActorRef<QueueMessage>,
    pub executor: Arc<TaskExecutor>,
    pub poll_interval: Duration,
}

/// Worker actor that processes one item at a time.
///
/// A worker is stopped with `stop(Some(RETIRED))`. Ractor handles the stop
/// only after the current message, so an item in progress always completes.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queue: args.queue,
            executor: args.executor,
            poll_interval: args.poll_interval,
            processed: 0,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            "Worker {} stopped after {} items",
            state.worker_id,
            state.processed
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                let worker_id = state.worker_id.clone();
                let next = ractor::rpc::call(
                    &state.queue,
                    |reply| QueueMessage::RequestItem { worker_id, reply },
                    Some(REQUEST_TIMEOUT),
                )
                .await;

                match next {
                    Ok(CallResult::Success(Some(item_id))) => {
                        let status = state.executor.execute(item_id, &state.worker_id).await;
                        state.processed += 1;
                        tracing::debug!(
                            worker = %state.worker_id,
                            item = %item_id,
                            status = status.as_ref().map(|s| s.as_str()).unwrap_or("skipped"),
                            "Worker finished item"
                        );

                        let _ = state.queue.send_message(QueueMessage::ItemFinished {
                            item_id,
                            worker_id: state.worker_id.clone(),
                        });
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    Ok(CallResult::Success(None)) | Ok(CallResult::Timeout) => {
                        schedule_poll(myself, state.poll_interval);
                    }
                    Ok(CallResult::SenderError) | Err(_) => {
                        tracing::warn!("Worker {} lost its queue, stopping", state.worker_id);
                        myself.stop(Some(QUEUE_UNAVAILABLE.to_string()));
                    }
                }
            }
        }

        Ok(())
    }
}

fn schedule_poll(myself: ActorRef<WorkerMessage>, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = myself.send_message(WorkerMessage::Poll);
    });
}
