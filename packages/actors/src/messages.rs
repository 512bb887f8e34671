//! Message types for actor communication.

use analysis_core::{QueueStats, WorkItem, WorkItemId};
use ractor::RpcReplyPort;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Enqueue a new work item.
    Enqueue {
        item: Box<WorkItem>,
        reply: RpcReplyPort<Result<WorkItemId, String>>,
    },

    /// Request the next item for a worker.
    RequestItem {
        worker_id: String,
        reply: RpcReplyPort<Option<WorkItemId>>,
    },

    /// A worker is done with an item (whatever the outcome).
    ItemFinished {
        item_id: WorkItemId,
        worker_id: String,
    },

    /// A worker exited without reporting its items; release what it held.
    WorkerLost { worker_id: String },

    /// Get queue stats.
    GetStats { reply: RpcReplyPort<QueueStats> },

    /// Periodic tick for housekeeping.
    Tick,

    /// Save a final snapshot and stop.
    Shutdown,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Ask the queue for an item and process it.
    Poll,
}

/// Messages for the WorkerPool supervisor.
#[derive(Debug)]
pub enum PoolMessage {
    /// Number of active (non-retiring) workers.
    CurrentCount { reply: RpcReplyPort<usize> },

    /// Spawn or drain workers until the active count equals the clamped target.
    ScaleTo {
        target: usize,
        reply: RpcReplyPort<Result<usize, ScaleError>>,
    },

    /// Retire one worker after its current item.
    DrainOne {
        reply: RpcReplyPort<Result<usize, ScaleError>>,
    },

    /// Names of the active workers.
    ListWorkers { reply: RpcReplyPort<Vec<String>> },

    /// Retire every worker and stop once they are gone.
    Shutdown,
}

/// Messages for the AutoscalerActor.
#[derive(Debug)]
pub enum AutoscalerMessage {
    /// Sample the queue and apply the scaling policy.
    Tick,
}

/// Failure to deliver or apply a scaling directive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScaleError {
    #[error("Worker pool unavailable: {0}")]
    Unavailable(String),

    #[error("Worker pool is already at its minimum of {0}")]
    AtMinimum(usize),
}
