//! Work item domain types: one uploaded audio file, one analysis task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a work item, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub Ulid);

impl WorkItemId {
    /// Create a new unique work item ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a work item ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to the uploaded audio. The submission path owns the file behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

impl PayloadRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Categorized reason a work item ended in `Failed`.
///
/// These are stable and enumerable; the free-form detail lives in [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every attempt was answered with a rate-limit error.
    RateLimitExhausted,
    /// The provider kept failing for reasons other than rate limiting.
    ProviderError,
    /// No credential became usable within the acquisition budget.
    AllCredentialsExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RateLimitExhausted => "rate_limit_exhausted",
            FailureReason::ProviderError => "provider_error",
            FailureReason::AllCredentialsExhausted => "all_credentials_exhausted",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure payload: the categorized reason first, diagnostics second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    /// Underlying error text from the last failed step.
    pub detail: String,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// Output of a successful analysis call. The core never looks inside `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Raw provider output.
    pub text: String,
    /// Credential that produced this result.
    pub credential_id: String,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(text: impl Into<String>, credential_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            credential_id: credential_id.into(),
            completed_at: Utc::now(),
        }
    }
}

/// Current status of a work item in its lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// Held by a task executor.
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    /// Analysis returned a result.
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: AnalysisResult,
    },
    /// Analysis gave up.
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        failure: Failure,
    },
}

impl WorkStatus {
    /// Check if the item is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Succeeded { .. } | WorkStatus::Failed { .. })
    }

    /// Position along PENDING → RUNNING → {SUCCEEDED | FAILED}.
    pub fn stage(&self) -> u8 {
        match self {
            WorkStatus::Pending => 0,
            WorkStatus::Running { .. } => 1,
            WorkStatus::Succeeded { .. } | WorkStatus::Failed { .. } => 2,
        }
    }

    /// Whether `next` is the immediate successor of this status.
    pub fn can_transition_to(&self, next: &WorkStatus) -> bool {
        !self.is_terminal() && next.stage() == self.stage() + 1
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running { .. } => "running",
            WorkStatus::Succeeded { .. } => "succeeded",
            WorkStatus::Failed { .. } => "failed",
        }
    }

    /// When the item entered `Running`, if it ever did.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            WorkStatus::Pending => None,
            WorkStatus::Running { started_at, .. }
            | WorkStatus::Succeeded { started_at, .. }
            | WorkStatus::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            WorkStatus::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            WorkStatus::Succeeded { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// One submitted audio file tracked through processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub payload: PayloadRef,
    /// Optional analysis context supplied by the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub status: WorkStatus,
    /// Number of analysis calls made so far.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a new pending work item.
    pub fn new(payload: PayloadRef) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId::new(),
            payload,
            context: None,
            status: WorkStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach an analysis context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> WorkStatus {
        WorkStatus::Running {
            started_at: Utc::now(),
            worker_id: "worker-1".into(),
        }
    }

    fn failed() -> WorkStatus {
        WorkStatus::Failed {
            started_at: Utc::now(),
            failed_at: Utc::now(),
            failure: Failure::new(FailureReason::ProviderError, "boom"),
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        assert!(WorkStatus::Pending.can_transition_to(&running()));
        assert!(running().can_transition_to(&failed()));
        assert!(!WorkStatus::Pending.can_transition_to(&failed()));
        assert!(!running().can_transition_to(&WorkStatus::Pending));
        assert!(!running().can_transition_to(&running()));
        assert!(!failed().can_transition_to(&running()));
        assert!(!failed().can_transition_to(&failed()));
    }

    #[test]
    fn failure_reason_serializes_snake_case() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&FailureReason::AllCredentialsExhausted)?;
        assert_eq!(json, "\"all_credentials_exhausted\"");

        let status = serde_json::to_value(failed())?;
        assert_eq!(status["status"], "failed");
        assert_eq!(status["failure"]["reason"], "provider_error");
        Ok(())
    }
}
