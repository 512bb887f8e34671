//! Stand-in analyzer for running the daemon without a provider.

use std::sync::Arc;
use std::time::Duration;

use actors::{AnalysisError, AnalysisFuture, Analyzer, FnAnalyzer};

/// Simulates a provider from the payload name.
///
/// Payloads containing `ratelimit` are throttled, payloads containing
/// `fail` return a provider error, anything else succeeds after `delay`.
pub fn demo_analyzer(delay: Duration) -> Arc<dyn Analyzer> {
    Arc::new(FnAnalyzer::new(move |credential, request| -> AnalysisFuture {
        let payload = request.payload.to_string();
        let key = credential.id.0.clone();
        Box::pin(async move {
            tracing::info!("Analyzing {} with {}", payload, key);
            tokio::time::sleep(delay).await;
            if payload.contains("ratelimit") {
                Err(AnalysisError::RateLimited(format!("{key} is throttled")))
            } else if payload.contains("fail") {
                Err(AnalysisError::Other("Intentional failure".into()))
            } else {
                Ok(format!("Summary of {payload}"))
            }
        })
    }))
}
