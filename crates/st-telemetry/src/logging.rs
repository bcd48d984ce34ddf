use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::LogError;
use crate::span::recording_span_ids;

// ---------------------------------------------------------------------------
// Process log subscriber
// ---------------------------------------------------------------------------

/// Install the process `tracing` subscriber in the configured format.
///
/// `RUST_LOG` overrides `cfg.level`. Only the first call installs anything,
/// so tests may call it freely.
pub fn init_from_config(service_name: &str, cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let installed = match cfg.format {
        LogFormat::Json => fmt()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .try_init(),
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(
            service = service_name,
            format = ?cfg.format,
            level = %cfg.level,
            "process logging installed"
        );
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured application log entry.
///
/// Serializes as `{timestamp, level, message, ...fields, trace_id?, span_id?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub span_id: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields: Map::new(),
            trace_id: None,
            span_id: None,
        }
    }

    /// Attach a field. `trace_id`/`span_id` are reserved and ignored here.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "trace_id" && key != "span_id" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn to_json_line(&self) -> Result<String, LogError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for structured records.
pub trait LogSink: Send + Sync {
    fn handle(&self, record: &LogRecord) -> Result<(), LogError>;
}

/// Writes one JSON object per line to any writer.
pub struct JsonLinesSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Append to `path`, creating it and its parent directory if needed.
    pub fn file(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl LogSink for JsonLinesSink {
    fn handle(&self, record: &LogRecord) -> Result<(), LogError> {
        let mut line = record.to_json_line()?;
        line.push('\n');
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// Forwards records to the process `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn handle(&self, record: &LogRecord) -> Result<(), LogError> {
        let fields = Value::Object(record.fields.clone());
        let trace_id = record.trace_id.as_deref();
        let span_id = record.span_id.as_deref();
        match record.level {
            LogLevel::Debug => {
                tracing::debug!(trace_id, span_id, %fields, "{}", record.message)
            }
            LogLevel::Info => tracing::info!(trace_id, span_id, %fields, "{}", record.message),
            LogLevel::Warn => tracing::warn!(trace_id, span_id, %fields, "{}", record.message),
            LogLevel::Error => {
                tracing::error!(trace_id, span_id, %fields, "{}", record.message)
            }
        }
        Ok(())
    }
}

/// Delivers every record to each inner sink; reports the first failure.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanoutSink {
    fn handle(&self, record: &LogRecord) -> Result<(), LogError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.handle(record) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// CorrelatedLogger
// ---------------------------------------------------------------------------

/// Stamps records with the ids of the span active in the caller's context
/// before handing them to the wrapped sink.
///
/// Only reads the context. A record passed with no recording span goes
/// through unchanged.
#[derive(Clone)]
pub struct CorrelatedLogger {
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for CorrelatedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatedLogger").finish_non_exhaustive()
    }
}

impl CorrelatedLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn handle(&self, cx: &Context, mut record: LogRecord) -> Result<(), LogError> {
        if let Some(ids) = recording_span_ids(cx) {
            record.trace_id = Some(ids.trace_id);
            record.span_id = Some(ids.span_id);
        }
        self.sink.handle(&record)
    }

    /// Emit a record; sink failures are reported through `tracing` instead
    /// of the caller.
    pub fn log(&self, cx: &Context, record: LogRecord) {
        if let Err(e) = self.handle(cx, record) {
            tracing::warn!(error = %e, "correlated log sink failed");
        }
    }

    pub fn info(&self, cx: &Context, message: impl Into<String>, fields: Map<String, Value>) {
        self.log(cx, with_fields(LogRecord::new(LogLevel::Info, message), fields));
    }

    pub fn warn(&self, cx: &Context, message: impl Into<String>, fields: Map<String, Value>) {
        self.log(cx, with_fields(LogRecord::new(LogLevel::Warn, message), fields));
    }

    pub fn error(&self, cx: &Context, message: impl Into<String>, fields: Map<String, Value>) {
        self.log(cx, with_fields(LogRecord::new(LogLevel::Error, message), fields));
    }
}

fn with_fields(mut record: LogRecord, fields: Map<String, Value>) -> LogRecord {
    for (k, v) in fields {
        record = record.with_field(k, v);
    }
    record
}

/// Sink chosen by config.
///
/// With `file` set, records go to the JSON-lines file and are mirrored to the
/// process subscriber. Otherwise they are written as JSON lines to stdout.
pub fn sink_from_config(cfg: &LoggingConfig) -> Result<Arc<dyn LogSink>, LogError> {
    Ok(match &cfg.file {
        Some(path) => Arc::new(FanoutSink::new(vec![
            Arc::new(JsonLinesSink::file(path)?),
            Arc::new(TracingSink),
        ])),
        None => Arc::new(JsonLinesSink::stdout()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanFactory;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::TracerProvider;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_record_shape_without_ids() {
        let rec = LogRecord::new(LogLevel::Info, "hello").with_field("symbol", "AAPL");
        let v: Value = serde_json::from_str(&rec.to_json_line().unwrap()).unwrap();
        assert_eq!(v["level"], "info");
        assert_eq!(v["message"], "hello");
        assert_eq!(v["symbol"], "AAPL");
        assert!(v.get("timestamp").is_some());
        assert!(v.get("trace_id").is_none());
        assert!(v.get("span_id").is_none());
    }

    #[test]
    fn test_reserved_fields_ignored() {
        let rec = LogRecord::new(LogLevel::Warn, "x").with_field("trace_id", "forged");
        assert!(rec.fields.is_empty());
        assert_eq!(rec.trace_id, None);
    }

    #[test]
    fn test_logger_passthrough_without_span() {
        let buf = SharedBuf::default();
        let logger = CorrelatedLogger::new(Arc::new(JsonLinesSink::new(buf.clone())));
        logger.info(&Context::new(), "background sweep", Map::new());
        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].get("trace_id").is_none());
    }

    #[test]
    fn test_logger_stamps_active_span() {
        let provider = TracerProvider::builder().build();
        let factory = SpanFactory::new(provider.tracer("test"));
        let span = factory.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);

        let buf = SharedBuf::default();
        let logger = CorrelatedLogger::new(Arc::new(JsonLinesSink::new(buf.clone())));
        let mut fields = Map::new();
        fields.insert("user_id".into(), json!(7));
        logger.error(span.context(), "lookup failed", fields);

        let lines = buf.lines();
        assert_eq!(lines[0]["trace_id"], span.trace_id());
        assert_eq!(lines[0]["span_id"], span.span_id());
        assert_eq!(lines[0]["level"], "error");
        assert_eq!(lines[0]["user_id"], 7);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.log");
        let sink = JsonLinesSink::file(&path).unwrap();
        sink.handle(&LogRecord::new(LogLevel::Info, "one")).unwrap();
        sink.handle(&LogRecord::new(LogLevel::Info, "two")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_fanout_reports_failure_but_delivers() {
        struct Broken;
        impl LogSink for Broken {
            fn handle(&self, _: &LogRecord) -> Result<(), LogError> {
                Err(LogError::Io(std::io::Error::other("disk full")))
            }
        }
        let buf = SharedBuf::default();
        let fanout = FanoutSink::new(vec![
            Arc::new(Broken),
            Arc::new(JsonLinesSink::new(buf.clone())),
        ]);
        assert!(fanout.handle(&LogRecord::new(LogLevel::Info, "x")).is_err());
        assert_eq!(buf.lines().len(), 1);
    }

    fn capture_tracing(buf: &SharedBuf) -> impl tracing::Subscriber + Send + Sync {
        let buf = buf.clone();
        fmt()
            .json()
            .flatten_event(true)
            .with_writer(move || buf.clone())
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    #[test]
    fn test_tracing_sink_forwards_level_and_ids() {
        let buf = SharedBuf::default();
        let mut rec = LogRecord::new(LogLevel::Warn, "quote feed lagging").with_field("lag_ms", 900);
        rec.trace_id = Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string());
        rec.span_id = Some("00f067aa0ba902b7".to_string());

        tracing::subscriber::with_default(capture_tracing(&buf), || {
            TracingSink.handle(&rec).unwrap();
        });

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "WARN");
        assert_eq!(lines[0]["message"], "quote feed lagging");
        assert_eq!(lines[0]["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(lines[0]["span_id"], "00f067aa0ba902b7");
        assert!(buf.text().contains("lag_ms"));
    }

    #[test]
    fn test_file_config_mirrors_to_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let cfg = LoggingConfig {
            file: Some(path.clone()),
            ..LoggingConfig::default()
        };
        let sink = sink_from_config(&cfg).unwrap();

        let buf = SharedBuf::default();
        tracing::subscriber::with_default(capture_tracing(&buf), || {
            sink.handle(&LogRecord::new(LogLevel::Info, "watchlist served")).unwrap();
        });

        let file = std::fs::read_to_string(&path).unwrap();
        assert_eq!(file.lines().count(), 1);
        assert!(file.contains("watchlist served"));
        let mirrored = buf.lines();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0]["message"], "watchlist served");
        assert!(mirrored[0].get("trace_id").is_none());
    }
}
