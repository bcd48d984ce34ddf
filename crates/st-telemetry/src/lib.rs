//! Observability core for the stock-tracker service.
//!
//! Wires OpenTelemetry tracer and meter providers from a single
//! [`TelemetryConfig`], and exposes the conventions every request path uses
//! to emit telemetry without touching SDK types directly.
//!
//! Key components:
//! - **Resource**: the process identity stamped on every span and metric
//! - **Bootstrap**: provider construction and optional global installation
//! - **Spans**: root/child span conventions and W3C context propagation
//! - **Metrics**: a declared instrument catalog, Prometheus pull or OTLP push
//! - **DB hooks**: before/after interception classifying store results
//! - **Logging**: JSON-lines records stamped with trace and span ids
//! - **Shutdown**: ordered, deadline-bounded flush and teardown

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod exposition;
pub mod external;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod resource;
pub mod shutdown;
pub mod span;

pub use bootstrap::{Telemetry, TelemetryBuilder};
pub use config::TelemetryConfig;
pub use db::{Classify, DbHooks, DbOperation, Outcome};
pub use error::{LogError, ShutdownError, ShutdownReport, TelemetryError};
pub use external::ExternalCalls;
pub use logging::{CorrelatedLogger, LogLevel, LogRecord, LogSink};
pub use metrics::{Instruments, MetricRegistry};
pub use middleware::{trace_layer, HttpTelemetry, RequestContext};
pub use resource::ResourceDescriptor;
pub use shutdown::ShutdownCoordinator;
pub use span::{SpanFactory, TracedSpan};
