//! HTTP surface of the stock tracker.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use st_telemetry::{
    trace_layer, CorrelatedLogger, HttpTelemetry, Instruments, RequestContext, Telemetry,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::market::{MarketData, MarketError};
use crate::store::{NewUserSymbol, StoreError, WatchlistStore};

#[derive(Clone)]
pub struct AppState {
    pub store: WatchlistStore,
    pub market: Arc<dyn MarketData>,
    pub logger: CorrelatedLogger,
    pub instruments: Instruments,
}

impl AppState {
    /// State backed by a fresh store instrumented through `telemetry`.
    pub fn new(telemetry: &Telemetry, market: Arc<dyn MarketData>) -> Self {
        Self {
            store: WatchlistStore::new(telemetry.db().clone()),
            market,
            logger: telemetry.logger().clone(),
            instruments: telemetry.instruments().clone(),
        }
    }
}

/// All routes, each wrapped in a server span by [`trace_layer`].
pub fn router(state: AppState, http: HttpTelemetry, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stocks/symbols", get(stock_symbols))
        .route("/stocks/{symbol}", get(stock_quote))
        .route("/crypto/symbols", get(crypto_symbols))
        .route("/crypto/{symbol}", get(crypto_quote))
        .route("/watchlist/add", post(add_to_watchlist))
        .route("/watchlist/{user_id}", get(get_watchlist))
        .route("/watchlist/remove/{user_id}/{symbol}", delete(remove_from_watchlist))
        .route("/logs/frontend", post(frontend_log))
        .route_layer(from_fn_with_state(http, trace_layer))
        .layer(cors(allowed_origins))
        .with_state(state)
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::very_permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("traceparent"),
            HeaderName::from_static("tracestate"),
            HeaderName::from_static("baggage"),
        ])
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// Market data proxies
// ---------------------------------------------------------------------------

fn market_response<T: Serialize>(result: Result<T, MarketError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e @ MarketError::Timeout { .. }) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn stock_symbols(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
) -> impl IntoResponse {
    let result = state.market.stock_symbols(&cx).await;
    if let Ok(symbols) = &result {
        cx.span()
            .set_attribute(KeyValue::new("response.symbols", symbols.len() as i64));
    }
    market_response(result)
}

async fn crypto_symbols(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
) -> impl IntoResponse {
    let result = state.market.crypto_symbols(&cx).await;
    if let Ok(symbols) = &result {
        cx.span()
            .set_attribute(KeyValue::new("response.symbols", symbols.len() as i64));
    }
    market_response(result)
}

async fn stock_quote(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    cx.span()
        .set_attribute(KeyValue::new("stock.symbol", symbol.clone()));
    market_response(state.market.stock_quote(&cx, &symbol).await)
}

async fn crypto_quote(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    cx.span()
        .set_attribute(KeyValue::new("crypto.symbol", symbol.clone()));
    market_response(state.market.crypto_quote(&cx, &symbol).await)
}

// ---------------------------------------------------------------------------
// Watchlist
// ---------------------------------------------------------------------------

/// POST /watchlist/add
async fn add_to_watchlist(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    payload: Result<Json<NewUserSymbol>, JsonRejection>,
) -> impl IntoResponse {
    state.instruments.watchlist_add_attempts.inc(&[]);
    let fail = |reason: &'static str| {
        state
            .instruments
            .watchlist_add_failures
            .inc(&[KeyValue::new("reason", reason)]);
    };

    let Json(new) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            fail("decode");
            let mut fields = Map::new();
            fields.insert("error".into(), json!(rejection.body_text()));
            state.logger.warn(&cx, "watchlist add payload rejected", fields);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to decode JSON"})),
            );
        }
    };
    cx.span().set_attributes([
        KeyValue::new("symbol", new.symbol.clone()),
        KeyValue::new("userId", new.user_id.clone()),
    ]);

    match state.store.add(&cx, new).await {
        Ok(row) => (StatusCode::CREATED, Json(json!(row))),
        Err(e @ StoreError::Invalid(_)) => {
            fail("invalid");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
        }
        Err(e @ StoreError::Duplicate { .. }) => {
            fail("duplicate");
            (StatusCode::CONFLICT, Json(json!({"error": e.to_string()})))
        }
        Err(e) => {
            fail("store");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// GET /watchlist/{user_id}. A user without rows has an empty watchlist.
async fn get_watchlist(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list(&cx, &user_id).await {
        Ok(rows) => (StatusCode::OK, Json(json!(rows))),
        Err(StoreError::NotFound { .. }) => (StatusCode::OK, Json(json!([]))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

/// DELETE /watchlist/remove/{user_id}/{symbol}
async fn remove_from_watchlist(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    Path((user_id, symbol)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.remove(&cx, &user_id, &symbol).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"message": "Symbol removed from watchlist"})),
        ),
        Err(StoreError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "symbol not on watchlist"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

// ---------------------------------------------------------------------------
// Frontend log relay
// ---------------------------------------------------------------------------

/// One event reported by the browser client.
#[derive(Debug, Deserialize)]
pub struct FrontendLog {
    #[serde(default, rename = "type", alias = "Type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// POST /logs/frontend
///
/// The browser sends its `traceparent`, so the record lands in the same
/// trace as the frontend action that produced it.
async fn frontend_log(
    State(state): State<AppState>,
    RequestContext(cx): RequestContext,
    payload: Result<Json<FrontendLog>, JsonRejection>,
) -> impl IntoResponse {
    let Json(log) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            let mut fields = Map::new();
            fields.insert("error".into(), json!(rejection.body_text()));
            state.logger.error(&cx, "invalid frontend log payload", fields);
            return (StatusCode::BAD_REQUEST, Json(json!("Invalid payload")));
        }
    };

    let mut fields = Map::new();
    fields.insert("event".into(), json!(log.event));
    fields.insert("metadata".into(), Value::Object(log.metadata));
    fields.insert("frontend.timestamp".into(), json!(log.timestamp));
    if log.kind == "Error" {
        state.logger.error(&cx, "frontend log error", fields);
    } else {
        state.logger.info(&cx, "frontend log info", fields);
    }
    (StatusCode::OK, Json(json!("Log written to file")))
}
