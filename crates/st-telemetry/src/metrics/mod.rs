//! Instrument catalog and typed recording handles.
//!
//! Instruments are declared in an [`InstrumentCatalog`] before the meter
//! provider exists (bucket boundaries become SDK views), then materialised
//! once into a [`MetricRegistry`]. Request paths only ever look handles up;
//! nothing is created lazily.

pub mod prometheus;
pub mod runtime;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge, Unit};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::{new_view, Aggregation, Instrument, Stream, View};
use tracing::warn;

use crate::config::HistogramsConfig;
use crate::error::TelemetryError;
use runtime::RuntimeSampler;

// ---------------------------------------------------------------------------
// Stable names
// ---------------------------------------------------------------------------

/// Attribute keys shared by every recording site.
pub mod attributes {
    pub const DB_OPERATION: &str = "db.operation";
    pub const DB_TABLE: &str = "db.table";
    pub const OUTCOME: &str = "outcome";
    pub const ENDPOINT: &str = "endpoint";
    pub const HTTP_METHOD: &str = "http.method";
    pub const HTTP_ROUTE: &str = "http.route";
    pub const HTTP_STATUS_CODE: &str = "http.status_code";
    pub const API_NAME: &str = "api.name";
}

/// Instrument names of the service's default catalog.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
    pub const HTTP_REQUEST_SIZE: &str = "http_request_size_bytes";
    pub const HTTP_RESPONSE_SIZE: &str = "http_response_size_bytes";
    pub const DB_QUERY_COUNT: &str = "db_query_count";
    pub const DB_QUERY_DURATION: &str = "db_query_duration_seconds";
    pub const EXTERNAL_API_CALLS: &str = "external_api_calls_total";
    pub const EXTERNAL_API_DURATION: &str = "external_api_call_duration_seconds";
    pub const WATCHLIST_ADD_ATTEMPTS: &str = "watchlist_add_attempts_total";
    pub const WATCHLIST_ADD_FAILURES: &str = "watchlist_add_failures_total";
    pub const HEAP_ALLOCATED: &str = "process_heap_allocated_bytes";
    pub const UPTIME: &str = "process_uptime_seconds";
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Pull callback for an observable gauge. Must be pure and fast: it runs on
/// the exporter's collection cadence.
pub type GaugeCallback = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone)]
enum InstrumentKind {
    Counter,
    Histogram { buckets: Vec<f64> },
    ObservableGauge { callback: GaugeCallback },
}

impl fmt::Debug for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Counter => f.write_str("Counter"),
            InstrumentKind::Histogram { buckets } => {
                f.debug_struct("Histogram").field("buckets", buckets).finish()
            }
            InstrumentKind::ObservableGauge { .. } => f.write_str("ObservableGauge"),
        }
    }
}

#[derive(Debug, Clone)]
struct InstrumentSpec {
    name: String,
    description: String,
    unit: String,
    kind: InstrumentKind,
}

/// Validated declarations of every instrument the process will record.
#[derive(Debug, Default, Clone)]
pub struct InstrumentCatalog {
    specs: Vec<InstrumentSpec>,
    seen: AHashSet<String>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(
        &mut self,
        name: &str,
        description: &str,
        unit: &str,
    ) -> Result<&mut Self, TelemetryError> {
        self.declare(name, description, unit, InstrumentKind::Counter)
    }

    pub fn histogram(
        &mut self,
        name: &str,
        description: &str,
        unit: &str,
        buckets: &[f64],
    ) -> Result<&mut Self, TelemetryError> {
        validate_buckets(name, buckets)?;
        self.declare(
            name,
            description,
            unit,
            InstrumentKind::Histogram {
                buckets: buckets.to_vec(),
            },
        )
    }

    pub fn observable_gauge<F>(
        &mut self,
        name: &str,
        description: &str,
        unit: &str,
        callback: F,
    ) -> Result<&mut Self, TelemetryError>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.declare(
            name,
            description,
            unit,
            InstrumentKind::ObservableGauge {
                callback: Arc::new(callback),
            },
        )
    }

    fn declare(
        &mut self,
        name: &str,
        description: &str,
        unit: &str,
        kind: InstrumentKind,
    ) -> Result<&mut Self, TelemetryError> {
        validate_name(name)?;
        validate_unit(name, unit)?;
        if !self.seen.insert(name.to_string()) {
            return Err(TelemetryError::DuplicateInstrument(name.to_string()));
        }
        self.specs.push(InstrumentSpec {
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
            kind,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    /// One explicit-bucket view per declared histogram.
    pub fn views(&self) -> Result<Vec<Box<dyn View>>, TelemetryError> {
        let mut views = Vec::new();
        for spec in &self.specs {
            let InstrumentKind::Histogram { buckets } = &spec.kind else {
                continue;
            };
            let aggregation = Aggregation::ExplicitBucketHistogram {
                boundaries: buckets.clone(),
                record_min_max: true,
            };
            aggregation.validate().map_err(|e| TelemetryError::View {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
            let view = new_view(
                Instrument::new().name(spec.name.clone()),
                Stream::new().aggregation(aggregation),
            )
            .map_err(|e| TelemetryError::View {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
            views.push(view);
        }
        Ok(views)
    }
}

/// OTel instrument-name syntax: a letter, then up to 254 of `[A-Za-z0-9_.-/]`.
fn validate_name(name: &str) -> Result<(), TelemetryError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            name.len() <= 255
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::InvalidInstrumentName(name.to_string()))
    }
}

/// Units are case-sensitive printable ASCII, at most 63 characters.
fn validate_unit(name: &str, unit: &str) -> Result<(), TelemetryError> {
    if unit.len() <= 63 && unit.chars().all(|c| c.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(TelemetryError::InvalidUnit {
            name: name.to_string(),
            unit: unit.to_string(),
        })
    }
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<(), TelemetryError> {
    let invalid = |reason: &str| TelemetryError::InvalidBuckets {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if buckets.is_empty() {
        return Err(invalid("no boundaries"));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(invalid("boundaries must be finite"));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid("boundaries must be strictly increasing"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

enum Registered {
    Counter(Counter<u64>),
    Histogram {
        inner: Histogram<f64>,
        buckets: Vec<f64>,
    },
    Gauge {
        // Held so the instrument lives as long as the registry.
        _inner: ObservableGauge<f64>,
        callback: GaugeCallback,
    },
}

/// Every instrument registered at bootstrap, looked up by name.
///
/// Lookups of unknown names are programming errors: in strict mode they
/// panic, otherwise they log a warning and return a handle that records
/// nothing.
#[derive(Clone)]
pub struct MetricRegistry {
    instruments: Arc<AHashMap<String, Registered>>,
    strict: bool,
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.instruments.keys().collect();
        names.sort();
        f.debug_struct("MetricRegistry")
            .field("instruments", &names)
            .field("strict", &self.strict)
            .finish()
    }
}

impl MetricRegistry {
    /// Create every declared instrument on `meter`.
    pub fn register(
        catalog: &InstrumentCatalog,
        meter: &Meter,
        strict: bool,
    ) -> Result<Self, TelemetryError> {
        let mut instruments = AHashMap::with_capacity(catalog.len());
        for spec in &catalog.specs {
            let name: Cow<'static, str> = Cow::Owned(spec.name.clone());
            let description = spec.description.clone();
            let unit = Unit::new(spec.unit.clone());
            let registered = match &spec.kind {
                InstrumentKind::Counter => {
                    let counter = meter
                        .u64_counter(name)
                        .with_description(description)
                        .with_unit(unit)
                        .try_init()
                        .map_err(|e| TelemetryError::MetricExporter(e.to_string()))?;
                    Registered::Counter(counter)
                }
                InstrumentKind::Histogram { buckets } => {
                    let histogram = meter
                        .f64_histogram(name)
                        .with_description(description)
                        .with_unit(unit)
                        .try_init()
                        .map_err(|e| TelemetryError::MetricExporter(e.to_string()))?;
                    Registered::Histogram {
                        inner: histogram,
                        buckets: buckets.clone(),
                    }
                }
                InstrumentKind::ObservableGauge { callback } => {
                    let poll = Arc::clone(callback);
                    let gauge = meter
                        .f64_observable_gauge(name)
                        .with_description(description)
                        .with_unit(unit)
                        .with_callback(move |observer| observer.observe(poll(), &[]))
                        .try_init()
                        .map_err(|e| TelemetryError::MetricExporter(e.to_string()))?;
                    Registered::Gauge {
                        _inner: gauge,
                        callback: Arc::clone(callback),
                    }
                }
            };
            instruments.insert(spec.name.clone(), registered);
        }
        Ok(Self {
            instruments: Arc::new(instruments),
            strict,
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.instruments.contains_key(name)
    }

    pub fn counter(&self, name: &str) -> CounterHandle {
        match self.instruments.get(name) {
            Some(Registered::Counter(c)) => CounterHandle {
                name: Arc::from(name),
                inner: Some(c.clone()),
            },
            _ => {
                self.unregistered("counter", name);
                CounterHandle {
                    name: Arc::from(name),
                    inner: None,
                }
            }
        }
    }

    /// Histogram handle; `buckets` must match what was registered.
    pub fn histogram(&self, name: &str, buckets: &[f64]) -> HistogramHandle {
        match self.instruments.get(name) {
            Some(Registered::Histogram { inner, buckets: registered }) => {
                if registered.as_slice() != buckets {
                    self.misuse(&format!(
                        "histogram `{name}` requested with buckets {buckets:?}, registered with {registered:?}"
                    ));
                }
                HistogramHandle {
                    name: Arc::from(name),
                    inner: Some(inner.clone()),
                }
            }
            _ => {
                self.unregistered("histogram", name);
                HistogramHandle {
                    name: Arc::from(name),
                    inner: None,
                }
            }
        }
    }

    pub fn observable_gauge(&self, name: &str) -> GaugeHandle {
        match self.instruments.get(name) {
            Some(Registered::Gauge { callback, .. }) => GaugeHandle {
                name: Arc::from(name),
                callback: Some(Arc::clone(callback)),
            },
            _ => {
                self.unregistered("observable gauge", name);
                GaugeHandle {
                    name: Arc::from(name),
                    callback: None,
                }
            }
        }
    }

    fn unregistered(&self, kind: &str, name: &str) {
        self.misuse(&format!("{kind} `{name}` was never registered"));
    }

    fn misuse(&self, msg: &str) {
        if self.strict {
            panic!("metric registry misuse: {msg}");
        }
        warn!(msg, "metric registry misuse, recording disabled for this handle");
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CounterHandle {
    name: Arc<str>,
    inner: Option<Counter<u64>>,
}

impl CounterHandle {
    pub fn add(&self, value: u64, attributes: &[KeyValue]) {
        if let Some(counter) = &self.inner {
            counter.add(value, attributes);
        }
    }

    pub fn inc(&self, attributes: &[KeyValue]) {
        self.add(1, attributes);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False for the no-op handle returned on an unregistered lookup.
    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }
}

impl fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("name", &self.name)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Clone)]
pub struct HistogramHandle {
    name: Arc<str>,
    inner: Option<Histogram<f64>>,
}

impl HistogramHandle {
    /// Negative and non-finite observations are dropped with a warning.
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        let Some(histogram) = &self.inner else {
            return;
        };
        if !value.is_finite() || value < 0.0 {
            warn!(histogram = %self.name, value, "dropping invalid histogram observation");
            return;
        }
        histogram.record(value, attributes);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }
}

impl fmt::Debug for HistogramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramHandle")
            .field("name", &self.name)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Handle to a pull-based gauge. Values are produced by the registered
/// callback at collection time; [`sample`](Self::sample) evaluates it on demand.
#[derive(Clone)]
pub struct GaugeHandle {
    name: Arc<str>,
    callback: Option<GaugeCallback>,
}

impl GaugeHandle {
    pub fn sample(&self) -> Option<f64> {
        self.callback.as_ref().map(|cb| cb())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_live(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for GaugeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeHandle")
            .field("name", &self.name)
            .field("live", &self.is_live())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Typed handles for the service's default catalog.
#[derive(Debug, Clone)]
pub struct Instruments {
    pub http_requests: CounterHandle,
    pub http_duration: HistogramHandle,
    pub http_request_size: HistogramHandle,
    pub http_response_size: HistogramHandle,
    pub db_queries: CounterHandle,
    pub db_duration: HistogramHandle,
    pub external_api_calls: CounterHandle,
    pub external_api_duration: HistogramHandle,
    pub watchlist_add_attempts: CounterHandle,
    pub watchlist_add_failures: CounterHandle,
    pub heap_allocated: GaugeHandle,
    pub uptime: GaugeHandle,
}

impl Instruments {
    /// Declarations backing [`Instruments::from_registry`].
    pub fn catalog(
        buckets: &HistogramsConfig,
        sampler: RuntimeSampler,
    ) -> Result<InstrumentCatalog, TelemetryError> {
        let heap = sampler.clone();
        let mut catalog = InstrumentCatalog::new();
        catalog
            .counter(names::HTTP_REQUESTS_TOTAL, "Inbound HTTP requests", "{request}")?
            .histogram(
                names::HTTP_REQUEST_DURATION,
                "Inbound HTTP request latency",
                "s",
                &buckets.http,
            )?
            .histogram(
                names::HTTP_REQUEST_SIZE,
                "Inbound HTTP request body size",
                "By",
                &buckets.size_bytes,
            )?
            .histogram(
                names::HTTP_RESPONSE_SIZE,
                "HTTP response body size",
                "By",
                &buckets.size_bytes,
            )?
            .counter(names::DB_QUERY_COUNT, "Database operations", "{operation}")?
            .histogram(
                names::DB_QUERY_DURATION,
                "Database operation latency",
                "s",
                &buckets.db,
            )?
            .counter(names::EXTERNAL_API_CALLS, "Outbound market-data API calls", "{call}")?
            .histogram(
                names::EXTERNAL_API_DURATION,
                "Outbound market-data API latency",
                "s",
                &buckets.external_api,
            )?
            .counter(
                names::WATCHLIST_ADD_ATTEMPTS,
                "Attempts to add a symbol to a watchlist",
                "{attempt}",
            )?
            .counter(
                names::WATCHLIST_ADD_FAILURES,
                "Failed watchlist additions",
                "{failure}",
            )?
            .observable_gauge(
                names::HEAP_ALLOCATED,
                "Bytes currently allocated on the heap",
                "By",
                move || heap.sample().heap_allocated_bytes as f64,
            )?
            .observable_gauge(names::UPTIME, "Seconds since process start", "s", move || {
                sampler.sample().uptime_secs
            })?;
        Ok(catalog)
    }

    pub fn from_registry(registry: &MetricRegistry, buckets: &HistogramsConfig) -> Self {
        Self {
            http_requests: registry.counter(names::HTTP_REQUESTS_TOTAL),
            http_duration: registry.histogram(names::HTTP_REQUEST_DURATION, &buckets.http),
            http_request_size: registry.histogram(names::HTTP_REQUEST_SIZE, &buckets.size_bytes),
            http_response_size: registry.histogram(names::HTTP_RESPONSE_SIZE, &buckets.size_bytes),
            db_queries: registry.counter(names::DB_QUERY_COUNT),
            db_duration: registry.histogram(names::DB_QUERY_DURATION, &buckets.db),
            external_api_calls: registry.counter(names::EXTERNAL_API_CALLS),
            external_api_duration: registry
                .histogram(names::EXTERNAL_API_DURATION, &buckets.external_api),
            watchlist_add_attempts: registry.counter(names::WATCHLIST_ADD_ATTEMPTS),
            watchlist_add_failures: registry.counter(names::WATCHLIST_ADD_FAILURES),
            heap_allocated: registry.observable_gauge(names::HEAP_ALLOCATED),
            uptime: registry.observable_gauge(names::UPTIME),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::{ManualReader, MeterProvider};

    fn meter() -> (MeterProvider, Meter) {
        let provider = MeterProvider::builder()
            .with_reader(ManualReader::builder().build())
            .build();
        let meter = provider.meter("test");
        (provider, meter)
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut catalog = InstrumentCatalog::new();
        catalog.counter("db_query_count", "", "").unwrap();
        let err = catalog.counter("db_query_count", "again", "").unwrap_err();
        assert!(matches!(err, TelemetryError::DuplicateInstrument(ref n) if n == "db_query_count"));

        // Same name, different kind, still a collision.
        let err = catalog
            .histogram("db_query_count", "", "s", &[0.1, 1.0])
            .unwrap_err();
        assert!(matches!(err, TelemetryError::DuplicateInstrument(_)));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut catalog = InstrumentCatalog::new();
        for bad in ["", "1st", "has space", "emoji_📈"] {
            let err = catalog.counter(bad, "", "").unwrap_err();
            assert!(
                matches!(err, TelemetryError::InvalidInstrumentName(_)),
                "expected name rejection for {bad:?}"
            );
        }
        assert!(catalog.counter("app.http/request-count_v2", "", "").is_ok());
    }

    #[test]
    fn test_invalid_unit_rejected() {
        let mut catalog = InstrumentCatalog::new();
        let err = catalog.counter("bytes_out", "", "kilo bytes").unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidUnit { .. }));
        let long = "x".repeat(64);
        assert!(catalog.counter("bytes_in", "", &long).is_err());
    }

    #[test]
    fn test_invalid_buckets_rejected() {
        let mut catalog = InstrumentCatalog::new();
        assert!(catalog.histogram("a", "", "s", &[]).is_err());
        assert!(catalog.histogram("b", "", "s", &[1.0, 0.5]).is_err());
        assert!(catalog.histogram("c", "", "s", &[0.1, 0.1]).is_err());
        assert!(catalog.histogram("d", "", "s", &[0.1, f64::INFINITY]).is_err());
        assert!(catalog.histogram("e", "", "s", &[0.1, 0.2]).is_ok());
    }

    #[test]
    fn test_views_one_per_histogram() {
        let mut catalog = InstrumentCatalog::new();
        catalog
            .counter("c", "", "")
            .unwrap()
            .histogram("h1", "", "s", &[0.1, 1.0])
            .unwrap()
            .histogram("h2", "", "s", &[1.0, 2.0])
            .unwrap();
        assert_eq!(catalog.views().unwrap().len(), 2);
    }

    #[test]
    fn test_lookup_returns_live_handles() {
        let (_provider, meter) = meter();
        let mut catalog = InstrumentCatalog::new();
        catalog
            .counter("requests", "", "")
            .unwrap()
            .histogram("latency", "", "s", &[0.1, 1.0])
            .unwrap()
            .observable_gauge("answer", "", "", || 42.0)
            .unwrap();
        let registry = MetricRegistry::register(&catalog, &meter, true).unwrap();

        assert!(registry.counter("requests").is_live());
        assert!(registry.histogram("latency", &[0.1, 1.0]).is_live());
        assert_eq!(registry.observable_gauge("answer").sample(), Some(42.0));
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn test_strict_unregistered_panics() {
        let (_provider, meter) = meter();
        let registry = MetricRegistry::register(&InstrumentCatalog::new(), &meter, true).unwrap();
        registry.counter("ghost");
    }

    #[test]
    #[should_panic(expected = "registered with")]
    fn test_strict_bucket_mismatch_panics() {
        let (_provider, meter) = meter();
        let mut catalog = InstrumentCatalog::new();
        catalog.histogram("latency", "", "s", &[0.1, 1.0]).unwrap();
        let registry = MetricRegistry::register(&catalog, &meter, true).unwrap();
        registry.histogram("latency", &[0.5]);
    }

    #[test]
    fn test_lenient_unregistered_is_noop() {
        let (_provider, meter) = meter();
        let registry = MetricRegistry::register(&InstrumentCatalog::new(), &meter, false).unwrap();
        let counter = registry.counter("ghost");
        assert!(!counter.is_live());
        counter.inc(&[KeyValue::new(attributes::OUTCOME, "success")]);
        let histogram = registry.histogram("ghost_latency", &[1.0]);
        histogram.record(0.5, &[]);
        assert_eq!(registry.observable_gauge("ghost_gauge").sample(), None);
    }

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog =
            Instruments::catalog(&HistogramsConfig::default(), RuntimeSampler::new()).unwrap();
        assert_eq!(catalog.len(), 12);
        assert!(catalog.contains(names::DB_QUERY_DURATION));
        assert!(catalog.contains(names::HEAP_ALLOCATED));
    }
}
