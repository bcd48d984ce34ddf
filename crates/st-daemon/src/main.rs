//! stock tracker daemon: serves the watchlist API with traces, metrics and
//! correlated logs, and tears telemetry down in order on ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use st_daemon::api::{self, AppState};
use st_daemon::config::DaemonConfig;
use st_daemon::market::HttpMarketClient;
use st_telemetry::logging;
use st_telemetry::metrics::runtime::TrackingAllocator;
use st_telemetry::Telemetry;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: TrackingAllocator<mimalloc::MiMalloc> = TrackingAllocator::new(mimalloc::MiMalloc);

const CONFIG_ENV: &str = "STOCK_TRACKER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "stock-tracker.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = DaemonConfig::load_or_default(&path)
        .with_context(|| format!("failed to load config from {path}"))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;

    logging::init_from_config(&config.telemetry.service.name, &config.telemetry.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "stock tracker starting");

    let telemetry = Telemetry::builder(config.telemetry.clone())
        .with_heap_stats(&GLOBAL)
        .build()
        .await
        .context("failed to initialize telemetry")?;

    let market = HttpMarketClient::new(
        config.market.clone(),
        telemetry.spans().clone(),
        telemetry.external().clone(),
    )
    .context("failed to build market data client")?;
    let state = AppState::new(&telemetry, Arc::new(market));
    let app = api::router(state, telemetry.http(), &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "API server listening");
    if let Some(addr) = telemetry.metrics_addr() {
        info!(%addr, "metrics endpoint listening");
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "API server failed");
    }

    match telemetry.shutdown().await {
        Ok(report) if report.is_clean() => info!(%report, "telemetry shut down"),
        Ok(report) => warn!(%report, "telemetry shut down with errors"),
        Err(e) => warn!(error = %e, "telemetry shutdown skipped"),
    }
    served.context("API server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, serving until killed");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received, initiating shutdown");
}
