use std::convert::Infallible;
use std::time::Instant;

use axum::body::{Body, HttpBody};
use axum::extract::{FromRequestParts, MatchedPath, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::{Context, KeyValue};

use crate::metrics::{attributes, Instruments};
use crate::span::{mark_failed, HeaderExtractor, SpanFactory};

const TRACE_ID_HEADER: &str = "x-trace-id";

/// Shared state for [`trace_layer`].
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    spans: SpanFactory,
    instruments: Instruments,
}

impl HttpTelemetry {
    pub fn new(spans: SpanFactory, instruments: Instruments) -> Self {
        Self { spans, instruments }
    }
}

/// Context of the request's server span, available to handlers.
///
/// Extracting it outside [`trace_layer`] yields an empty context, so child
/// spans started from it become roots.
#[derive(Debug, Clone, Default)]
pub struct RequestContext(pub Context);

impl RequestContext {
    pub fn context(&self) -> &Context {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Axum middleware wrapping each request in a server span.
///
/// Install with `axum::middleware::from_fn_with_state` via `route_layer` so
/// the matched route template is known. Records `http_requests_total`,
/// latency and body sizes tagged with method, route and status code, and
/// marks the span failed on 5xx. Empty bodies are not observed as sizes. A
/// request dropped before the handler answers closes its span as cancelled.
pub async fn trace_layer(
    State(http): State<HttpTelemetry>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let request_size = body_size(request.body());

    let span = http.spans.start_root_span(
        &HeaderExtractor(request.headers()),
        format!("{method} {route}"),
        vec![
            KeyValue::new(attributes::HTTP_METHOD, method.clone()),
            KeyValue::new(attributes::HTTP_ROUTE, route.clone()),
        ],
    );
    request
        .extensions_mut()
        .insert(RequestContext(span.context().clone()));

    span.watch_cancellation();
    let start = Instant::now();
    let mut response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();
    span.complete();

    let status = response.status();
    span.set_attribute(KeyValue::new(
        attributes::HTTP_STATUS_CODE,
        i64::from(status.as_u16()),
    ));
    if status.is_server_error() {
        mark_failed(
            span.context(),
            format!("HTTP {}", status.as_u16()),
            "http.server_error",
            vec![KeyValue::new(attributes::HTTP_STATUS_CODE, i64::from(status.as_u16()))],
        );
    }

    let attrs = [
        KeyValue::new(attributes::HTTP_METHOD, method),
        KeyValue::new(attributes::HTTP_ROUTE, route),
        KeyValue::new(attributes::HTTP_STATUS_CODE, status.as_u16().to_string()),
    ];
    let m = &http.instruments;
    m.http_requests.inc(&attrs);
    m.http_duration.record(duration, &attrs);
    if request_size > 0.0 {
        m.http_request_size.record(request_size, &attrs);
    }
    let response_size = body_size(response.body());
    if response_size > 0.0 {
        m.http_response_size.record(response_size, &attrs);
    }

    if let Ok(val) = HeaderValue::from_str(&span.trace_id()) {
        response.headers_mut().insert(TRACE_ID_HEADER, val);
    }
    response
}

fn body_size(body: &Body) -> f64 {
    let hint = body.size_hint();
    hint.exact().unwrap_or_else(|| hint.lower()) as f64
}
