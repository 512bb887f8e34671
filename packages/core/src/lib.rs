//! Core domain types for the audio analysis orchestration core.
//!
//! This crate contains shared types used across all packages:
//! - WorkItem and WorkStatus for analysis tasks
//! - Credential types for the rotation pool
//! - Queue statistics, health snapshots and configuration
//! - Events for real-time updates

mod config;
mod credential;
mod events;
mod health;
mod queue;
mod work_item;

pub use config::{
    ConfigError, CredentialConfig, ExecutorConfig, MAX_ENV_CREDENTIALS, QueueConfig, ScalingConfig,
    ServiceConfig,
};
pub use credential::{Credential, CredentialId, CredentialStatus};
pub use events::WorkEvent;
pub use health::HealthReport;
pub use queue::{QueueSnapshot, QueueStats};
pub use work_item::{
    AnalysisResult, Failure, FailureReason, PayloadRef, WorkItem, WorkItemId, WorkStatus,
};
