use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use opentelemetry::metrics::Result as MetricsResult;
use opentelemetry_sdk::metrics::data::{self, ResourceMetrics, Temporality};
use opentelemetry_sdk::metrics::reader::{AggregationSelector, MetricReader, TemporalitySelector};
use opentelemetry_sdk::metrics::{Aggregation, InstrumentKind, ManualReader, Pipeline};
use opentelemetry_sdk::Resource;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Pull reader backing the `/metrics` scrape endpoint.
///
/// One clone is registered with the meter provider; the others collect on
/// demand for each scrape.
#[derive(Debug, Clone)]
pub struct PrometheusReader {
    reader: Arc<ManualReader>,
}

impl PrometheusReader {
    pub fn new() -> Self {
        Self {
            reader: Arc::new(ManualReader::builder().build()),
        }
    }

    /// Collect a fresh snapshot of every instrument.
    pub fn snapshot(&self) -> MetricsResult<MetricsSnapshot> {
        let mut rm = ResourceMetrics {
            resource: Resource::empty(),
            scope_metrics: Vec::new(),
        };
        self.reader.collect(&mut rm)?;
        Ok(MetricsSnapshot::from_resource_metrics(&rm))
    }

    /// Collect and encode in Prometheus text exposition format.
    pub fn render(&self) -> MetricsResult<String> {
        Ok(self.snapshot()?.export_prometheus())
    }
}

impl Default for PrometheusReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalitySelector for PrometheusReader {
    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

impl AggregationSelector for PrometheusReader {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self.reader.aggregation(kind)
    }
}

impl MetricReader for PrometheusReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline)
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> MetricsResult<()> {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> MetricsResult<()> {
        self.reader.force_flush()
    }

    fn shutdown(&self) -> MetricsResult<()> {
        self.reader.shutdown()
    }
}

// ---------------------------------------------------------------------------
// Label key
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// series within one metric family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (sanitize_name(k), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    fn from_attributes<'a, I>(attrs: I) -> Self
    where
        I: Iterator<Item = (&'a opentelemetry::Key, &'a opentelemetry::Value)>,
    {
        let mut v: Vec<(String, String)> = attrs
            .map(|(k, v)| (sanitize_name(k.as_str()), v.as_str().into_owned()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// Format labels as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        self.prometheus_str_with(None)
    }

    fn prometheus_str_with(&self, extra: Option<(&str, &str)>) -> String {
        if self.0.is_empty() && extra.is_none() {
            return String::new();
        }
        let mut inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        if let Some((k, v)) = extra {
            inner.push(format!("{}=\"{}\"", k, escape_label(v)));
        }
        format!("{{{}}}", inner.join(","))
    }
}

/// Prometheus names allow `[a-zA-Z0-9_:]`; everything else becomes `_`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One cumulative histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSeries {
    pub bounds: Vec<f64>,
    /// Per-bucket counts; one longer than `bounds` (the `+Inf` bucket).
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum Series {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramSeries),
}

#[derive(Debug, Clone)]
struct Family {
    kind: &'static str,
    help: String,
    series: Vec<(Labels, Series)>,
}

/// Collected metric values keyed by family name, with lookups used by the
/// encoder and by tests.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    resource: Labels,
    families: AHashMap<String, Family>,
}

impl MetricsSnapshot {
    fn from_resource_metrics(rm: &ResourceMetrics) -> Self {
        let resource = Labels::from_attributes(rm.resource.iter());
        let mut families: AHashMap<String, Family> = AHashMap::new();

        for scope in &rm.scope_metrics {
            for metric in &scope.metrics {
                let any = metric.data.as_any();
                let (kind, series): (&'static str, Vec<(Labels, Series)>) =
                    if let Some(sum) = any.downcast_ref::<data::Sum<u64>>() {
                        let points = sum
                            .data_points
                            .iter()
                            .map(|dp| (Labels::from_attributes(dp.attributes.iter()), Series::Counter(dp.value)))
                            .collect();
                        ("counter", points)
                    } else if let Some(gauge) = any.downcast_ref::<data::Gauge<f64>>() {
                        let points = gauge
                            .data_points
                            .iter()
                            .map(|dp| (Labels::from_attributes(dp.attributes.iter()), Series::Gauge(dp.value)))
                            .collect();
                        ("gauge", points)
                    } else if let Some(hist) = any.downcast_ref::<data::Histogram<f64>>() {
                        let points = hist
                            .data_points
                            .iter()
                            .map(|dp| {
                                (
                                    Labels::from_attributes(dp.attributes.iter()),
                                    Series::Histogram(HistogramSeries {
                                        bounds: dp.bounds.clone(),
                                        bucket_counts: dp.bucket_counts.clone(),
                                        sum: dp.sum,
                                        count: dp.count,
                                    }),
                                )
                            })
                            .collect();
                        ("histogram", points)
                    } else {
                        tracing::debug!(metric = %metric.name, "skipping unsupported aggregation");
                        continue;
                    };

                let family = families
                    .entry(sanitize_name(&metric.name))
                    .or_insert_with(|| Family {
                        kind,
                        help: metric.description.to_string(),
                        series: Vec::new(),
                    });
                family.series.extend(series);
            }
        }

        Self { resource, families }
    }

    pub fn family_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.families.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    fn series(&self, name: &str, labels: &[(&str, &str)]) -> Option<&Series> {
        let want = Labels::new(labels);
        self.families
            .get(name)?
            .series
            .iter()
            .find(|(l, _)| *l == want)
            .map(|(_, s)| s)
    }

    /// Counter value for an exact label set; 0 when absent.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series(name, labels) {
            Some(Series::Counter(v)) => *v,
            _ => 0,
        }
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.families.get(name).map_or(0, |f| {
            f.series
                .iter()
                .map(|(_, s)| match s {
                    Series::Counter(v) => *v,
                    _ => 0,
                })
                .sum()
        })
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match self.series(name, labels) {
            Some(Series::Gauge(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<&HistogramSeries> {
        match self.series(name, labels) {
            Some(Series::Histogram(h)) => Some(h),
            _ => None,
        }
    }

    /// Observation count of a histogram across every label set.
    pub fn histogram_count_total(&self, name: &str) -> u64 {
        self.families.get(name).map_or(0, |f| {
            f.series
                .iter()
                .map(|(_, s)| match s {
                    Series::Histogram(h) => h.count,
                    _ => 0,
                })
                .sum()
        })
    }

    /// Encode in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        if !self.resource.0.is_empty() {
            out.push_str("# HELP target_info Target metadata\n");
            out.push_str("# TYPE target_info gauge\n");
            let _ = writeln!(out, "target_info{} 1", self.resource.prometheus_str());
        }

        let mut names: Vec<&String> = self.families.keys().collect();
        names.sort();
        for name in names {
            let family = &self.families[name];
            if !family.help.is_empty() {
                let _ = writeln!(out, "# HELP {} {}", name, family.help.replace('\n', " "));
            }
            let _ = writeln!(out, "# TYPE {} {}", name, family.kind);

            let mut series: Vec<&(Labels, Series)> = family.series.iter().collect();
            series.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in series {
                match value {
                    Series::Counter(v) => {
                        let _ = writeln!(out, "{}{} {}", name, labels.prometheus_str(), v);
                    }
                    Series::Gauge(v) => {
                        let _ = writeln!(out, "{}{} {}", name, labels.prometheus_str(), v);
                    }
                    Series::Histogram(h) => {
                        let mut cumulative = 0u64;
                        for (i, boundary) in h.bounds.iter().enumerate() {
                            cumulative += h.bucket_counts.get(i).copied().unwrap_or(0);
                            let le = boundary.to_string();
                            let _ = writeln!(
                                out,
                                "{}_bucket{} {}",
                                name,
                                labels.prometheus_str_with(Some(("le", &le))),
                                cumulative
                            );
                        }
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            name,
                            labels.prometheus_str_with(Some(("le", "+Inf"))),
                            h.count
                        );
                        let _ = writeln!(out, "{}_sum{} {}", name, labels.prometheus_str(), h.sum);
                        let _ = writeln!(out, "{}_count{} {}", name, labels.prometheus_str(), h.count);
                    }
                }
            }
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
