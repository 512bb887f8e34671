//! The external analysis call, as seen by the task executor.

use std::future::Future;
use std::pin::Pin;

use analysis_core::{Credential, PayloadRef, WorkItem, WorkItemId};

/// What the analysis call receives besides the credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub item_id: WorkItemId,
    pub payload: PayloadRef,
    pub context: Option<String>,
}

impl From<&WorkItem> for AnalysisRequest {
    fn from(item: &WorkItem) -> Self {
        Self {
            item_id: item.id,
            payload: item.payload.clone(),
            context: item.context.clone(),
        }
    }
}

/// Failure classes the executor distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// The provider throttled this credential.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Anything else: network, malformed response, provider error.
    #[error("{0}")]
    Other(String),
}

/// Raw provider output on success; the core never interprets it.
pub type AnalysisOutcome = Result<String, AnalysisError>;

/// Future type for async analysis calls.
pub type AnalysisFuture = Pin<Box<dyn Future<Output = AnalysisOutcome> + Send>>;

/// The remote analysis operation.
///
/// Implementations clone whatever they need out of the arguments so the
/// returned future is `'static`.
pub trait Analyzer: Send + Sync + 'static {
    fn analyze(&self, credential: &Credential, request: &AnalysisRequest) -> AnalysisFuture;
}

/// A simple function-based analyzer.
pub struct FnAnalyzer<F>
where
    F: Fn(&Credential, &AnalysisRequest) -> AnalysisFuture + Send + Sync + 'static,
{
    analyze: F,
}

impl<F> FnAnalyzer<F>
where
    F: Fn(&Credential, &AnalysisRequest) -> AnalysisFuture + Send + Sync + 'static,
{
    pub fn new(analyze: F) -> Self {
        Self { analyze }
    }
}

impl<F> Analyzer for FnAnalyzer<F>
where
    F: Fn(&Credential, &AnalysisRequest) -> AnalysisFuture + Send + Sync + 'static,
{
    fn analyze(&self, credential: &Credential, request: &AnalysisRequest) -> AnalysisFuture {
        (self.analyze)(credential, request)
    }
}
