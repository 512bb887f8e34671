use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{AnalysisError, AnalysisFuture, Analyzer, FnAnalyzer, ServiceHandle};
use analysis_core::{ServiceConfig, WorkItem, WorkItemId};
use tokio::sync::watch;
use tokio::time::Instant;

/// Fast timings, no snapshots, autoscaler effectively idle after its first tick.
pub fn test_config(keys: usize) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.scaling.min_workers = 2;
    config.scaling.max_workers = 4;
    config.scaling.check_interval_secs = 3600;
    config.executor.acquire_backoff_ms = 10;
    config.executor.hard_retry_backoff_ms = 10;
    config.executor.poll_interval_ms = 5;
    config.executor.call_timeout_secs = 5;
    config.queue.tick_interval_secs = 3600;
    config.credentials.keys = (0..keys).map(|i| format!("test-secret-{i}")).collect();
    config
}

/// Analyzer that succeeds immediately, echoing payload and credential.
pub fn echo_analyzer() -> Arc<dyn Analyzer> {
    Arc::new(FnAnalyzer::new(|credential, request| -> AnalysisFuture {
        let text = format!("{} via {}", request.payload, credential.id.0);
        Box::pin(async move { Ok(text) })
    }))
}

/// Analyzer that rate-limits one credential and succeeds with the others.
pub fn throttling_analyzer(throttled: &'static str) -> Arc<dyn Analyzer> {
    Arc::new(FnAnalyzer::new(move |credential, request| -> AnalysisFuture {
        let key = credential.id.0.clone();
        let text = format!("{} via {}", request.payload, key);
        Box::pin(async move {
            if key == throttled {
                Err(AnalysisError::RateLimited("429 Too Many Requests".into()))
            } else {
                Ok(text)
            }
        })
    }))
}

/// Analyzer whose calls block until the returned sender is set to `true`.
pub fn gated_analyzer() -> (Arc<dyn Analyzer>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let analyzer = FnAnalyzer::new(move |_, request| -> AnalysisFuture {
        let mut rx = rx.clone();
        let text = format!("analysis of {}", request.payload);
        Box::pin(async move {
            let _ = rx.wait_for(|open| *open).await;
            Ok(text)
        })
    });
    (Arc::new(analyzer), tx)
}

pub async fn wait_for_terminal(
    service: &ServiceHandle,
    id: WorkItemId,
) -> Result<WorkItem, Box<dyn Error>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let item = service.status(id)?;
        if item.status.is_terminal() {
            return Ok(item);
        }
        if Instant::now() > deadline {
            return Err(format!("item {id} did not finish").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
