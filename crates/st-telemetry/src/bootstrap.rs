//! Provider wiring.
//!
//! [`TelemetryBuilder`] turns a [`TelemetryConfig`] into live tracer and
//! meter providers, registers the instrument catalog, and hands back a
//! [`Telemetry`] bundle holding every facade the service needs. Building
//! spawns exporter tasks on the current tokio runtime, so it is async.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::metrics::{MeterProvider as SdkMeterProvider, PeriodicReader};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{self as sdktrace, BatchSpanProcessor, Sampler};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use tracing::{info, warn};

use crate::config::{MetricsExporterKind, TelemetryConfig};
use crate::db::DbHooks;
use crate::error::{ShutdownError, ShutdownReport, TelemetryError};
use crate::exposition::MetricsServer;
use crate::external::ExternalCalls;
use crate::logging::{sink_from_config, CorrelatedLogger, LogSink};
use crate::metrics::prometheus::PrometheusReader;
use crate::metrics::runtime::{HeapStats, RuntimeSampler};
use crate::metrics::{Instruments, MetricRegistry};
use crate::middleware::HttpTelemetry;
use crate::resource::ResourceDescriptor;
use crate::shutdown::{Producers, ShutdownCoordinator};
use crate::span::{composite_propagator, SpanFactory};

const INSTRUMENTATION_NAME: &str = "st-telemetry";
const INSTRUMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

type TraceHook = Box<dyn FnOnce(sdktrace::Builder) -> sdktrace::Builder + Send>;

// ---------------------------------------------------------------------------
// TelemetryBuilder
// ---------------------------------------------------------------------------

pub struct TelemetryBuilder {
    config: TelemetryConfig,
    trace_hook: Option<TraceHook>,
    sampler: RuntimeSampler,
    sink: Option<Arc<dyn LogSink>>,
    install_global: bool,
    serve_metrics: bool,
}

impl std::fmt::Debug for TelemetryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuilder")
            .field("service", &self.config.service.name)
            .field("custom_exporter", &self.trace_hook.is_some())
            .field("install_global", &self.install_global)
            .field("serve_metrics", &self.serve_metrics)
            .finish()
    }
}

impl TelemetryBuilder {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            trace_hook: None,
            sampler: RuntimeSampler::new(),
            sink: None,
            install_global: true,
            serve_metrics: true,
        }
    }

    /// Export spans synchronously to `exporter` instead of batching them
    /// to the OTLP collector.
    pub fn with_span_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.trace_hook = Some(Box::new(move |builder: sdktrace::Builder| {
            builder.with_simple_exporter(exporter)
        }));
        self
    }

    /// Report heap usage from the process allocator.
    pub fn with_heap_stats(mut self, heap: &'static dyn HeapStats) -> Self {
        self.sampler = self.sampler.with_heap_stats(heap);
        self
    }

    /// Send correlated log records to `sink` instead of the configured one.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Also install the providers, propagator and error handler as the
    /// process-wide OpenTelemetry globals. On by default.
    pub fn install_global(mut self, yes: bool) -> Self {
        self.install_global = yes;
        self
    }

    /// Bind the Prometheus scrape endpoint. On by default; ignored when
    /// metrics are pushed over OTLP.
    pub fn serve_metrics(mut self, yes: bool) -> Self {
        self.serve_metrics = yes;
        self
    }

    pub async fn build(self) -> Result<Telemetry, TelemetryError> {
        let TelemetryBuilder {
            config,
            trace_hook,
            sampler,
            sink,
            install_global,
            serve_metrics,
        } = self;

        config.validate()?;
        let resource = ResourceDescriptor::from_config(&config.service)?;
        let catalog = Instruments::catalog(&config.histograms, sampler)?;
        let views = catalog.views()?;

        // -- traces ---------------------------------------------------------
        let trace_config = sdktrace::config()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.resource());
        let builder = sdktrace::TracerProvider::builder().with_config(trace_config);
        let builder = match trace_hook {
            Some(hook) => hook(builder),
            None => {
                let exporter = opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(config.traces.endpoint.clone())
                    .with_timeout(config.traces.export_timeout())
                    .build_span_exporter()
                    .map_err(|e| TelemetryError::TraceExporter(e.to_string()))?;
                let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio)
                    .with_max_queue_size(config.traces.max_queue_size)
                    .with_scheduled_delay(config.traces.scheduled_delay())
                    .build();
                builder.with_span_processor(processor)
            }
        };
        let tracer_provider = builder.build();
        let tracer = tracer_provider.versioned_tracer(
            INSTRUMENTATION_NAME,
            Some(INSTRUMENTATION_VERSION),
            Some(SCHEMA_URL),
            None,
        );

        // -- metrics --------------------------------------------------------
        let mut meter_builder = SdkMeterProvider::builder().with_resource(resource.resource());
        for view in views {
            meter_builder = meter_builder.with_view(view);
        }
        let prometheus = match config.metrics.exporter {
            MetricsExporterKind::Prometheus => {
                let reader = PrometheusReader::new();
                meter_builder = meter_builder.with_reader(reader.clone());
                Some(reader)
            }
            MetricsExporterKind::Otlp => {
                let exporter = opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(config.metrics.otlp_endpoint.clone())
                    .with_timeout(config.traces.export_timeout())
                    .build_metrics_exporter(
                        Box::new(DefaultAggregationSelector::new()),
                        Box::new(DefaultTemporalitySelector::new()),
                    )
                    .map_err(|e| TelemetryError::MetricExporter(e.to_string()))?;
                let reader = PeriodicReader::builder(exporter, runtime::Tokio)
                    .with_interval(Duration::from_secs(config.metrics.interval_secs))
                    .build();
                meter_builder = meter_builder.with_reader(reader);
                None
            }
        };
        let meter_provider = meter_builder.build();
        let meter = meter_provider.versioned_meter(
            INSTRUMENTATION_NAME,
            Some(INSTRUMENTATION_VERSION),
            Some(SCHEMA_URL),
            None,
        );
        let registry = MetricRegistry::register(&catalog, &meter, config.strict)?;
        let instruments = Instruments::from_registry(&registry, &config.histograms);

        // -- facades --------------------------------------------------------
        let sink = match sink {
            Some(sink) => sink,
            None => sink_from_config(&config.logging)?,
        };
        let logger = CorrelatedLogger::new(sink);
        let spans = SpanFactory::new(tracer);
        let db = DbHooks::new(
            spans.clone(),
            instruments.db_queries.clone(),
            instruments.db_duration.clone(),
            logger.clone(),
        );
        let external = ExternalCalls::new(
            spans.clone(),
            instruments.external_api_calls.clone(),
            instruments.external_api_duration.clone(),
            logger.clone(),
        );

        if install_global {
            global::set_text_map_propagator(composite_propagator());
            if let Err(e) = global::set_error_handler(|err| {
                warn!(error = %err, "opentelemetry error");
            }) {
                warn!(error = %e, "could not install opentelemetry error handler");
            }
            let _previous = global::set_tracer_provider(tracer_provider.clone());
            global::set_meter_provider(meter_provider.clone());
        }

        let metrics_server = match (&prometheus, serve_metrics) {
            (Some(reader), true) => {
                Some(MetricsServer::spawn(config.metrics.prometheus_addr, reader.clone()).await?)
            }
            _ => None,
        };
        let metrics_addr = metrics_server.as_ref().map(MetricsServer::local_addr);

        info!(
            service = %resource.service_name(),
            traces_endpoint = %config.traces.endpoint,
            metrics_exporter = ?config.metrics.exporter,
            instruments = catalog.len(),
            "telemetry initialized"
        );

        let coordinator = ShutdownCoordinator::new(Producers {
            tracer_provider,
            meter_provider,
            metrics_server,
            global: install_global,
        });

        Ok(Telemetry {
            config,
            resource,
            spans,
            registry,
            instruments,
            logger,
            db,
            external,
            prometheus,
            metrics_addr,
            shutdown: Arc::new(coordinator),
        })
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Everything a running service uses to emit telemetry.
///
/// Cloning the facades is cheap; the providers themselves are owned by the
/// [`ShutdownCoordinator`] and released when it runs.
#[derive(Debug)]
pub struct Telemetry {
    config: TelemetryConfig,
    resource: Arc<ResourceDescriptor>,
    spans: SpanFactory,
    registry: MetricRegistry,
    instruments: Instruments,
    logger: CorrelatedLogger,
    db: DbHooks,
    external: ExternalCalls,
    prometheus: Option<PrometheusReader>,
    metrics_addr: Option<SocketAddr>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Telemetry {
    /// Build with the default options: OTLP span export, globals installed,
    /// scrape endpoint bound when Prometheus is selected.
    pub async fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        TelemetryBuilder::new(config).build().await
    }

    pub fn builder(config: TelemetryConfig) -> TelemetryBuilder {
        TelemetryBuilder::new(config)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.resource
    }

    pub fn spans(&self) -> &SpanFactory {
        &self.spans
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    pub fn logger(&self) -> &CorrelatedLogger {
        &self.logger
    }

    pub fn db(&self) -> &DbHooks {
        &self.db
    }

    pub fn external(&self) -> &ExternalCalls {
        &self.external
    }

    /// State for the HTTP middleware.
    pub fn http(&self) -> HttpTelemetry {
        HttpTelemetry::new(self.spans.clone(), self.instruments.clone())
    }

    /// The pull reader, present when metrics are exported for scraping.
    pub fn prometheus(&self) -> Option<&PrometheusReader> {
        self.prometheus.as_ref()
    }

    /// Bound address of the scrape endpoint, if it was started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Push out every span ended so far. Blocks until the exporter answers.
    pub fn force_flush(&self) -> Result<(), TelemetryError> {
        self.shutdown
            .force_flush()
            .map_err(TelemetryError::TraceExporter)
    }

    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// Run the ordered teardown with the configured deadline.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        self.shutdown.shutdown(self.config.shutdown.timeout()).await
    }

    /// Run the ordered teardown with an explicit deadline.
    pub async fn shutdown_within(&self, timeout: Duration) -> Result<ShutdownReport, ShutdownError> {
        self.shutdown.shutdown(timeout).await
    }
}
