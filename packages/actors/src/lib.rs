//! Actor system for the analysis service.
//!
//! This crate provides the Ractor-based actors that move work items from
//! submission to a terminal status, and the autoscaler that sizes the
//! worker pool.
//!
//! # Architecture
//!
//! - `QueueActor` - FIFO of pending items, hands each one to one worker
//! - `WorkerPool` - Supervisor that spawns and drains `WorkerActor`s
//! - `WorkerActor` - Pulls items and runs them through the `TaskExecutor`
//! - `AutoscalerActor` - Ticks the `ControlLoop` against queue depth
//!
//! # Usage
//!
//! ```ignore
//! use actors::start_service;
//!
//! let service = start_service(ServiceConfig::from_env()?, analyzer).await?;
//! let id = service.submit("uploads/meeting.mp3", None).await?;
//! let item = service.status(id)?;
//! service.shutdown().await;
//! ```

mod analyzer;
mod autoscaler;
mod executor;
mod messages;
mod persistence;
mod pool;
mod queue_actor;
mod service;
mod worker_actor;

pub use analyzer::{
    AnalysisError, AnalysisFuture, AnalysisOutcome, AnalysisRequest, Analyzer, FnAnalyzer,
};
pub use autoscaler::{
    AutoscalerActor, AutoscalerArgs, ControlLoop, ScaleDecision, ScalingPolicy, TickOutcome,
};
pub use executor::{CallOutcome, TaskExecutor};
pub use messages::{AutoscalerMessage, PoolMessage, QueueMessage, ScaleError, WorkerMessage};
pub use persistence::{PersistenceError, SnapshotStore};
pub use pool::{PoolControl, WorkerPool, WorkerPoolArgs, WorkerPoolHandle};
pub use queue_actor::{QueueActor, QueueActorState};
pub use service::{ServiceError, ServiceHandle, start_service};
pub use worker_actor::{QUEUE_UNAVAILABLE, RETIRED, WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
