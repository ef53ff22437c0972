use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod injector;
mod orchestrator;
mod session;
mod signal;
mod stats;
mod transport;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stampede=debug,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Stampede websocket load generator");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    info!("Loading config from {}", config_path);

    let config = config::Config::from_file(&config_path)?;
    let api = Arc::new(api::HttpApi::new(
        config.target.backend_url.clone(),
        std::time::Duration::from_millis(config.target.request_timeout_ms),
    ));
    let connector = Arc::new(transport::WsConnector::new(&config.target.ws_url)?);
    info!(
        "Target: backend {}, websocket {}",
        api.base_url(),
        config.target.ws_url
    );

    let orchestrator = orchestrator::StressOrchestrator::new(
        session::SessionSettings::from_config(&config),
        orchestrator::RunPlan::from_config(&config),
        api.clone(),
        connector,
        api.clone(),
    );

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && !stop.is_raised() {
            warn!("Interrupted, stopping early");
            stop.raise();
        }
    });

    let report = orchestrator
        .run(
            config.run.client_count,
            config.run.channel_count,
            config.run.duration(),
        )
        .await?;

    report.log_summary();
    info!("Final stats: {}", serde_json::to_string(&report)?);

    Ok(())
}
