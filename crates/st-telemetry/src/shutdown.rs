use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use opentelemetry_sdk::trace::TracerProvider;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ShutdownError, ShutdownReport};
use crate::exposition::MetricsServer;

pub const STEP_TRACER_PROVIDER: &str = "tracer_provider";
pub const STEP_METER_PROVIDER: &str = "meter_provider";
pub const STEP_METRICS_ENDPOINT: &str = "metrics_endpoint";

/// Everything the coordinator tears down, taken on the first call.
pub(crate) struct Producers {
    pub tracer_provider: TracerProvider,
    pub meter_provider: SdkMeterProvider,
    pub metrics_server: Option<MetricsServer>,
    /// Whether the providers were also installed as process globals.
    pub global: bool,
}

// ---------------------------------------------------------------------------
// ShutdownCoordinator
// ---------------------------------------------------------------------------

/// Bounded, ordered teardown of the telemetry producers.
///
/// Order: tracer provider (flushes batched spans), meter provider (final
/// collection and export), then the scrape endpoint. All steps share one
/// deadline; a failed or overrunning step is recorded and the next step
/// still runs.
pub struct ShutdownCoordinator {
    producers: Mutex<Option<Producers>>,
    done: AtomicBool,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("done", &self.is_shut_down())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub(crate) fn new(producers: Producers) -> Self {
        Self {
            producers: Mutex::new(Some(producers)),
            done: AtomicBool::new(false),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Flush pending spans without tearing anything down. A no-op once
    /// shutdown has taken the providers.
    pub(crate) fn force_flush(&self) -> Result<(), String> {
        let guard = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(producers) = guard.as_ref() else {
            return Ok(());
        };
        let failures: Vec<String> = producers
            .tracer_provider
            .force_flush()
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Flush and close everything within `timeout`.
    ///
    /// Returns `Err(AlreadyShutDown)` on every call after the first.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, ShutdownError> {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            warn!("telemetry shutdown already performed");
            return Err(ShutdownError::AlreadyShutDown);
        }
        let producers = self
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(producers) = producers else {
            return Err(ShutdownError::AlreadyShutDown);
        };

        let deadline = Instant::now() + timeout;
        info!(timeout_ms = timeout.as_millis() as u64, "telemetry shutdown started");
        let mut report = ShutdownReport::default();

        let Producers {
            tracer_provider,
            meter_provider,
            metrics_server,
            global: installed_global,
        } = producers;

        // 1. Spans: flush the batch processor, then drop the last provider
        //    references so processors shut down.
        let step = run_blocking(STEP_TRACER_PROVIDER, deadline, move || {
            let failures: Vec<String> = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|r| r.err().map(|e| e.to_string()))
                .collect();
            if installed_global {
                global::shutdown_tracer_provider();
            }
            drop(tracer_provider);
            if failures.is_empty() {
                Ok(())
            } else {
                Err(format!("span flush failed: {}", failures.join("; ")))
            }
        })
        .await;
        record(&mut report, STEP_TRACER_PROVIDER, step);

        // 2. Metrics: final collection/export and reader shutdown.
        let step = run_blocking(STEP_METER_PROVIDER, deadline, move || {
            meter_provider.shutdown().map_err(|e| e.to_string())
        })
        .await;
        record(&mut report, STEP_METER_PROVIDER, step);

        // 3. Scrape endpoint.
        if let Some(mut server) = metrics_server {
            server.begin_shutdown();
            let step = match tokio::time::timeout_at(deadline, server.join()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(ShutdownError::Step {
                    step: STEP_METRICS_ENDPOINT,
                    message,
                }),
                Err(_) => Err(ShutdownError::Timeout {
                    step: STEP_METRICS_ENDPOINT,
                }),
            };
            record(&mut report, STEP_METRICS_ENDPOINT, step);
        }

        if report.is_clean() {
            info!(steps = report.completed.len(), "telemetry shutdown complete");
        } else {
            warn!(%report, "telemetry shutdown finished with errors");
        }
        Ok(report)
    }
}

fn record(report: &mut ShutdownReport, step: &'static str, result: Result<(), ShutdownError>) {
    match result {
        Ok(()) => report.completed.push(step),
        Err(e) => {
            warn!(step, error = %e, "telemetry shutdown step failed");
            report.errors.push(e);
        }
    }
}

/// Run a blocking SDK call on its own thread and wait for it until
/// `deadline`. An overrunning call is abandoned, not cancelled.
async fn run_blocking<F>(step: &'static str, deadline: Instant, f: F) -> Result<(), ShutdownError>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(format!("telemetry-{step}"))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| ShutdownError::Step {
            step,
            message: format!("could not spawn worker: {e}"),
        })?;

    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(message))) => Err(ShutdownError::Step { step, message }),
        Ok(Err(_)) => Err(ShutdownError::Step {
            step,
            message: "worker exited without reporting".to_string(),
        }),
        Err(_) => Err(ShutdownError::Timeout { step }),
    }
}
