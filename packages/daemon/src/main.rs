//! Analysis service daemon.
//!
//! Reads configuration from the environment, starts the service with the
//! demo analyzer, submits any payload paths given as arguments and runs
//! until interrupted.

use std::time::Duration;

use actors::start_service;
use analysis_core::ServiceConfig;

mod demo;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ServiceConfig::from_env()?;
    tracing::info!("Configuration: {:?}", config);

    let service = start_service(config, demo::demo_analyzer(Duration::from_secs(1))).await?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!("{}", event.description());
        }
    });

    for payload in std::env::args().skip(1) {
        let id = service.submit(payload.clone(), None).await?;
        tracing::info!("Submitted {} as {}", payload, id);
    }

    tokio::signal::ctrl_c().await?;

    match service.health().await {
        Ok(health) => tracing::info!(
            "Final state: {} succeeded, {} failed, {} pending",
            health.queue.succeeded,
            health.queue.failed,
            health.queue.pending
        ),
        Err(e) => tracing::warn!("Cannot read final state: {}", e),
    }
    service.shutdown().await;

    Ok(())
}
