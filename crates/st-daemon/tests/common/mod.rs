#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use serde_json::{json, Value};
use st_daemon::api::{self, AppState};
use st_daemon::market::{CoinSymbol, MarketData, MarketError, ALPHAVANTAGE, COINGECKO};
use st_telemetry::error::LogError;
use st_telemetry::logging::{LogRecord, LogSink};
use st_telemetry::{Telemetry, TelemetryConfig};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    pub fn span(&self, name: &str) -> SpanData {
        let spans = self.spans();
        let names: Vec<String> = spans.iter().map(|s| s.name.to_string()).collect();
        spans
            .into_iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no span named {name:?} in {names:?}"))
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.spans.lock().unwrap().extend(batch);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn with_message(&self, message: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.message == message)
            .cloned()
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

pub struct Harness {
    pub telemetry: Telemetry,
    pub spans: InMemoryExporter,
    pub logs: Arc<MemorySink>,
}

impl Harness {
    pub async fn new() -> Self {
        let mut config = TelemetryConfig::default();
        config.service.name = "stock-tracker-test".to_string();
        config.strict = true;

        let spans = InMemoryExporter::default();
        let logs = Arc::new(MemorySink::default());
        let telemetry = Telemetry::builder(config)
            .with_span_exporter(spans.clone())
            .with_log_sink(logs.clone())
            .install_global(false)
            .serve_metrics(false)
            .build()
            .await
            .expect("telemetry should build");
        Self {
            telemetry,
            spans,
            logs,
        }
    }

    pub fn app(&self, market: Arc<dyn MarketData>) -> Router {
        let state = AppState::new(&self.telemetry, market);
        api::router(state, self.telemetry.http(), &[])
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.telemetry
            .prometheus()
            .unwrap()
            .snapshot()
            .unwrap()
            .counter(name, labels)
    }

    pub fn flush(&self) {
        self.telemetry.force_flush().unwrap();
    }
}

pub fn attr(span: &SpanData, key: &str) -> Option<opentelemetry::Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

/// Send one request and decode the JSON body.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Market doubles
// ---------------------------------------------------------------------------

/// Canned quotes. `SLOW` times out, `DOWN` fails upstream, and the crypto
/// listing is unreadable.
#[derive(Debug, Default)]
pub struct FakeMarket;

#[async_trait::async_trait]
impl MarketData for FakeMarket {
    async fn stock_quote(&self, _cx: &Context, symbol: &str) -> Result<Value, MarketError> {
        match symbol {
            "SLOW" => Err(MarketError::Timeout {
                api: ALPHAVANTAGE,
                after: Duration::from_millis(20),
            }),
            "DOWN" => Err(MarketError::Status {
                api: ALPHAVANTAGE,
                status: 503,
            }),
            _ => Ok(json!({"Meta Data": {"2. Symbol": symbol}})),
        }
    }

    async fn crypto_quote(&self, _cx: &Context, id: &str) -> Result<Value, MarketError> {
        Ok(json!([{"id": id, "current_price": 1.0}]))
    }

    async fn stock_symbols(&self, _cx: &Context) -> Result<Vec<String>, MarketError> {
        Ok(vec!["AAPL".to_string(), "MSFT".to_string()])
    }

    async fn crypto_symbols(&self, _cx: &Context) -> Result<Vec<CoinSymbol>, MarketError> {
        Err(MarketError::Decode {
            api: COINGECKO,
            reason: "expected value at line 1 column 1".to_string(),
        })
    }
}

pub const LISTING_CSV: &str = "symbol,name,exchange,assetType,ipoDate,delistingDate,status\n\
    IBM,International Business Machines Corp,NYSE,Stock,1962-01-02,null,Active\n\
    OLD,Old Holdings,NYSE,Stock,1990-01-02,2019-06-30,Delisted\n\
    SPY,SPDR S&P 500 ETF Trust,NYSE ARCA,ETF,1993-01-29,null,Active\n";

/// Local stand-in for the Alpha Vantage and CoinGecko HTTP APIs.
///
/// Echoes the `traceparent` it received. Symbol `SLOW` answers after
/// `slow_for`; symbol `MISSING` answers 404. `function=LISTING_STATUS`
/// answers [`LISTING_CSV`]; `/coins/markets` without `ids` lists two coins.
pub async fn spawn_upstream(slow_for: Duration) -> SocketAddr {
    async fn query(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
        slow_for: Duration,
    ) -> Response {
        if params.get("function").map(String::as_str) == Some("LISTING_STATUS") {
            return ([("content-type", "application/x-download")], LISTING_CSV).into_response();
        }
        let symbol = params.get("symbol").cloned().unwrap_or_default();
        if symbol == "SLOW" {
            tokio::time::sleep(slow_for).await;
        }
        if symbol == "MISSING" {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown symbol"}))).into_response();
        }
        let traceparent = headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            StatusCode::OK,
            Json(json!({
                "symbol": symbol,
                "function": params.get("function"),
                "traceparent": traceparent,
            })),
        )
            .into_response()
    }

    async fn markets(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if !params.contains_key("ids") {
            return Json(json!([
                {"id": "bitcoin", "symbol": "btc", "current_price": 64000.5},
                {"id": "ethereum", "symbol": "eth", "current_price": 3100.25},
            ]));
        }
        Json(json!([{
            "id": params.get("ids"),
            "vs_currency": params.get("vs_currency"),
            "current_price": 64000.5,
        }]))
    }

    let app = Router::new()
        .route(
            "/query",
            get(
                move |headers: HeaderMap, params: Query<HashMap<String, String>>| {
                    query(headers, params, slow_for)
                },
            ),
        )
        .route("/coins/markets", get(markets));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
