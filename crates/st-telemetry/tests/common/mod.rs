#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use opentelemetry::trace::Status;
use opentelemetry::Value;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use st_telemetry::error::LogError;
use st_telemetry::logging::{LogLevel, LogRecord, LogSink};
use st_telemetry::{Telemetry, TelemetryConfig};

// ---------------------------------------------------------------------------
// Exporters
// ---------------------------------------------------------------------------

/// Captures every exported span.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    pub fn span(&self, name: &str) -> SpanData {
        self.spans()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no span named {name:?} in {:?}", self.names()))
    }

    pub fn names(&self) -> Vec<String> {
        self.spans().iter().map(|s| s.name.to_string()).collect()
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.spans.lock().unwrap().extend(batch);
        Box::pin(async { Ok(()) })
    }
}

/// Blocks the export thread for `delay` on every batch, so flushes stall.
#[derive(Debug, Clone)]
pub struct SlowExporter {
    pub delay: Duration,
}

impl SpanExporter for SlowExporter {
    fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        std::thread::sleep(self.delay);
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message == message)
            .collect()
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn handle(&self, record: &LogRecord) -> Result<(), LogError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn test_config() -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.service.name = "stock-tracker-test".to_string();
    config.service.environment = "test".to_string();
    config.strict = true;
    config
}

/// Telemetry exporting spans to `exporter`, logging to `sink`, with no
/// globals and no scrape server.
pub async fn telemetry_with<E: SpanExporter + 'static>(
    exporter: E,
    sink: Arc<MemorySink>,
) -> Telemetry {
    Telemetry::builder(test_config())
        .with_span_exporter(exporter)
        .with_log_sink(sink)
        .install_global(false)
        .serve_metrics(false)
        .build()
        .await
        .expect("telemetry should build")
}

pub async fn telemetry() -> (Telemetry, InMemoryExporter, Arc<MemorySink>) {
    let exporter = InMemoryExporter::default();
    let sink = Arc::new(MemorySink::default());
    let telemetry = telemetry_with(exporter.clone(), Arc::clone(&sink)).await;
    (telemetry, exporter, sink)
}

pub fn is_error(status: &Status) -> bool {
    matches!(status, Status::Error { .. })
}

pub fn attr(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}
