//! Retry/rotation state machine for one work item.
//!
//! ```text
//! START -> ACQUIRE_CREDENTIAL -> CALLING -> SUCCESS
//!              ^    |  (none)        |---> RATE_LIMITED --(attempts left)--> ACQUIRE_CREDENTIAL
//!              |    v                |---> HARD_FAILURE --(retries left)---> ACQUIRE_CREDENTIAL
//!              +- backoff
//! ```
//!
//! Every transition is written to the [`StatusStore`] before `execute`
//! returns, and every path ends in a terminal status.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use analysis_core::{
    AnalysisResult, Credential, ExecutorConfig, Failure, FailureReason, WorkEvent, WorkItemId,
    WorkStatus,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use store::{CredentialPool, PoolError, StatusStore};
use tokio::sync::broadcast;

use crate::analyzer::{AnalysisError, AnalysisRequest, Analyzer};

/// Classified result of one analysis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(String),
    RateLimited(String),
    HardFailure(String),
}

#[derive(Debug)]
enum Step {
    AcquireCredential,
    Calling(Credential),
}

#[derive(Debug)]
enum Finish {
    Succeeded(AnalysisResult),
    Failed(Failure),
}

/// Consumes work items: acquires credentials, calls the analyzer, records outcomes.
pub struct TaskExecutor {
    store: Arc<StatusStore>,
    credentials: Arc<CredentialPool>,
    analyzer: Arc<dyn Analyzer>,
    config: ExecutorConfig,
    event_tx: Option<broadcast::Sender<WorkEvent>>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<StatusStore>,
        credentials: Arc<CredentialPool>,
        analyzer: Arc<dyn Analyzer>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            analyzer,
            config,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one item to a terminal status.
    ///
    /// Returns `None` only when the item could not be claimed (unknown id or
    /// not PENDING); that is logged as an error and the item is left alone.
    pub async fn execute(&self, id: WorkItemId, worker_id: &str) -> Option<WorkStatus> {
        let item = match self.store.get(id) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(item = %id, worker = worker_id, "Cannot execute item: {}", e);
                return None;
            }
        };

        let started_at = Utc::now();
        let running = WorkStatus::Running {
            started_at,
            worker_id: worker_id.to_string(),
        };
        if let Err(e) = self.store.update_status(id, running) {
            tracing::error!(item = %id, worker = worker_id, "Cannot claim item: {}", e);
            return None;
        }
        self.broadcast(WorkEvent::ItemStarted {
            item_id: id,
            worker_id: worker_id.to_string(),
            timestamp: started_at,
        });
        tracing::info!(item = %id, worker = worker_id, payload = %item.payload, "Processing item");

        let request = AnalysisRequest::from(&item);
        let (finish, attempts) = self.run(&request).await;
        Some(self.complete(id, started_at, finish, attempts))
    }

    async fn run(&self, request: &AnalysisRequest) -> (Finish, u32) {
        let id = request.item_id;
        let mut attempts: u32 = 0;
        let mut acquire_failures: u32 = 0;
        let mut hard_failures: u32 = 0;
        let mut step = Step::AcquireCredential;

        let finish = loop {
            step = match step {
                Step::AcquireCredential => match self.credentials.acquire() {
                    Ok(credential) => {
                        acquire_failures = 0;
                        Step::Calling(credential)
                    }
                    Err(e) => {
                        if acquire_failures >= self.config.max_acquire_retries {
                            break Finish::Failed(Failure::new(
                                FailureReason::AllCredentialsExhausted,
                                format!("{} (after {} retries)", e, acquire_failures),
                            ));
                        }
                        acquire_failures += 1;
                        tracing::debug!(item = %id, retry = acquire_failures, "Waiting for a credential");
                        tokio::time::sleep(self.config.acquire_backoff()).await;
                        Step::AcquireCredential
                    }
                },

                Step::Calling(credential) => {
                    attempts += 1;
                    if let Err(e) = self.store.record_attempt(id) {
                        tracing::error!(item = %id, "Failed to record attempt: {}", e);
                    }

                    match self.call(&credential, request).await {
                        CallOutcome::Success(text) => {
                            self.report_success(&credential);
                            break Finish::Succeeded(AnalysisResult::new(text, credential.id.0));
                        }
                        CallOutcome::RateLimited(detail) => {
                            self.report_rate_limited(&credential);
                            if attempts >= self.config.max_attempts {
                                break Finish::Failed(Failure::new(
                                    FailureReason::RateLimitExhausted,
                                    detail,
                                ));
                            }
                            Step::AcquireCredential
                        }
                        CallOutcome::HardFailure(detail) => {
                            if hard_failures >= self.config.max_hard_retries {
                                break Finish::Failed(Failure::new(
                                    FailureReason::ProviderError,
                                    detail,
                                ));
                            }
                            hard_failures += 1;
                            tracing::warn!(
                                item = %id,
                                credential = %credential.id,
                                retry = hard_failures,
                                "Analysis call failed: {}",
                                detail
                            );
                            tokio::time::sleep(self.config.hard_retry_backoff() * hard_failures)
                                .await;
                            Step::AcquireCredential
                        }
                    }
                }
            };
        };

        (finish, attempts)
    }

    /// One analyzer call under the call timeout. A panicking analyzer is a
    /// hard failure, not a dead worker.
    async fn call(&self, credential: &Credential, request: &AnalysisRequest) -> CallOutcome {
        let timeout = self.config.call_timeout();
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.analyzer.analyze(credential, request)
        })) {
            Ok(future) => future,
            Err(panic) => return CallOutcome::HardFailure(panic_detail(panic.as_ref())),
        };

        match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(Ok(text))) => CallOutcome::Success(text),
            Ok(Ok(Err(AnalysisError::RateLimited(detail)))) => CallOutcome::RateLimited(detail),
            Ok(Ok(Err(AnalysisError::Other(detail)))) => CallOutcome::HardFailure(detail),
            Ok(Err(panic)) => CallOutcome::HardFailure(panic_detail(panic.as_ref())),
            Err(_) => CallOutcome::HardFailure(format!(
                "analysis call timed out after {}s",
                timeout.as_secs()
            )),
        }
    }

    fn report_success(&self, credential: &Credential) {
        if let Err(e) = self.credentials.report_success(&credential.id) {
            tracing::error!(credential = %credential.id, "Failed to report success: {}", e);
        }
    }

    fn report_rate_limited(&self, credential: &Credential) {
        match self.credentials.report_rate_limited(&credential.id) {
            Ok(cooldown) => self.broadcast(WorkEvent::CredentialCooling {
                credential_id: credential.id.clone(),
                cooldown_ms: cooldown.duration.as_millis() as u64,
                consecutive_failures: cooldown.consecutive_failures,
                timestamp: Utc::now(),
            }),
            Err(PoolError::UnknownCredential(id)) => {
                tracing::error!(credential = %id, "Rate limit reported for unknown credential");
            }
            Err(e) => tracing::error!(credential = %credential.id, "{}", e),
        }
    }

    fn complete(
        &self,
        id: WorkItemId,
        started_at: DateTime<Utc>,
        finish: Finish,
        attempts: u32,
    ) -> WorkStatus {
        let now = Utc::now();
        let (status, event) = match finish {
            Finish::Succeeded(result) => {
                tracing::info!(item = %id, attempts, "Item succeeded");
                (
                    WorkStatus::Succeeded {
                        started_at,
                        completed_at: now,
                        result,
                    },
                    WorkEvent::ItemSucceeded {
                        item_id: id,
                        attempts,
                        duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
                        timestamp: now,
                    },
                )
            }
            Finish::Failed(failure) => {
                tracing::warn!(item = %id, attempts, reason = %failure.reason, "Item failed: {}", failure.detail);
                let reason = failure.reason;
                (
                    WorkStatus::Failed {
                        started_at,
                        failed_at: now,
                        failure,
                    },
                    WorkEvent::ItemFailed {
                        item_id: id,
                        reason,
                        attempts,
                        timestamp: now,
                    },
                )
            }
        };

        if let Err(e) = self.store.update_status(id, status.clone()) {
            tracing::error!(item = %id, "Failed to persist terminal status: {}", e);
        }
        self.broadcast(event);
        status
    }

    /// Broadcast an event.
    fn broadcast(&self, event: WorkEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    format!("analysis call panicked: {message}")
}
