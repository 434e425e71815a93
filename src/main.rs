//! linewatch - production-line capture and face-matching batch processor
//!
//! Main entry point.

use linewatch::config_store::ConfigStore;
use linewatch::state::AppState;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linewatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting linewatch v{}", env!("CARGO_PKG_VERSION"));

    let config = ConfigStore::load_from_env()?;
    tracing::info!(
        lines = config.lines.len(),
        cameras = config.lines.iter().map(|l| l.cameras.len()).sum::<usize>(),
        capture_enabled = config.capture.enabled,
        capture_mode = config.capture.mode.as_str(),
        processing_enabled = config.processing.enabled,
        frames_dir = %config.storage.frames_dir.display(),
        "Configuration loaded"
    );

    let metrics_interval = Duration::from_secs(config.processing.metrics_interval_secs.max(1));
    let state = AppState::build(config).await?;
    state.start().await;

    let metrics_state = state.clone();
    let metrics = tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_state.log_metrics(metrics_interval).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    metrics.abort();
    state.shutdown().await;

    tracing::info!("linewatch stopped");
    Ok(())
}
