mod common;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::Context;
use serde_json::{json, Map, Value};
use st_telemetry::config::{LogFormat, LoggingConfig};
use st_telemetry::logging::{self, sink_from_config, CorrelatedLogger, JsonLinesSink};

use common::telemetry;

#[test]
fn test_init_pretty_twice_is_noop() {
    let cfg = LoggingConfig {
        format: LogFormat::Pretty,
        level: "debug".to_string(),
        ..LoggingConfig::default()
    };
    logging::init_from_config("test-service", &cfg);
    logging::init_from_config("test-service", &cfg);

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_from_config_json() {
    // The global subscriber may already be set by another test; this is a no-op then.
    let cfg = LoggingConfig {
        format: LogFormat::Json,
        ..LoggingConfig::default()
    };
    logging::init_from_config("test-service-json", &cfg);

    tracing::info!(key = "value", "json log line");
}

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_file_sink_from_config_creates_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fluentd").join("log").join("app.log");
    let cfg = LoggingConfig {
        file: Some(path.clone()),
        ..LoggingConfig::default()
    };
    let logger = CorrelatedLogger::new(sink_from_config(&cfg).unwrap());

    let mut fields = Map::new();
    fields.insert("symbol".into(), json!("AAPL"));
    logger.info(&Context::new(), "quote served", fields);

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["level"], "info");
    assert_eq!(lines[0]["message"], "quote served");
    assert_eq!(lines[0]["symbol"], "AAPL");
    assert!(lines[0].get("trace_id").is_none(), "ids are never fabricated");
    assert!(lines[0].get("timestamp").is_some());
}

#[tokio::test]
async fn test_json_lines_carry_active_span_ids() {
    let (t, _exporter, _sink) = telemetry().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let logger = CorrelatedLogger::new(Arc::new(JsonLinesSink::file(&path).unwrap()));

    let span = t
        .spans()
        .start_root_span(&HashMap::<String, String>::new(), "POST /logs/frontend", vec![]);
    let child = t.spans().start_child_span(span.context(), "relay", vec![]);
    logger.error(child.context(), "frontend error", Map::new());
    logger.warn(span.context(), "frontend warning", Map::new());

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["level"], "error");
    assert_eq!(lines[0]["trace_id"], span.trace_id());
    assert_eq!(lines[0]["span_id"], child.span_id());
    assert_eq!(lines[1]["span_id"], span.span_id());
    assert_eq!(lines[0]["trace_id"], lines[1]["trace_id"]);
}
