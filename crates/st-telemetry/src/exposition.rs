use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::TelemetryError;
use crate::metrics::prometheus::PrometheusReader;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Router exposing `GET /metrics` for a Prometheus scraper.
pub fn metrics_router(reader: PrometheusReader) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(reader)
}

async fn scrape(State(reader): State<PrometheusReader>) -> Response {
    match reader.render() {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "metrics collection failed");
            (StatusCode::SERVICE_UNAVAILABLE, format!("metrics unavailable: {e}")).into_response()
        }
    }
}

/// The auxiliary scrape server, closed last during shutdown.
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl MetricsServer {
    /// Bind `addr` and serve the scrape endpoint on the current runtime.
    pub async fn spawn(addr: SocketAddr, reader: PrometheusReader) -> Result<Self, TelemetryError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let app = metrics_router(reader);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });
        info!(%local_addr, "metrics endpoint listening");
        Ok(Self {
            local_addr,
            stop: Some(stop),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the server to stop accepting connections and drain.
    pub(crate) fn begin_shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Wait for the serve task to exit.
    pub(crate) async fn join(self) -> Result<(), String> {
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("metrics server task failed: {e}")),
        }
    }
}
