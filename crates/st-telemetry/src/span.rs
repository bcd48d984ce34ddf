//! Span creation conventions and trace-context propagation.
//!
//! Every span handed out by [`SpanFactory`] is wrapped in a [`TracedSpan`]
//! guard that owns the span's [`Context`]. The guard closes the span exactly
//! once when it is dropped or explicitly ended, so early returns and `?`
//! paths cannot leak open spans. Terminal status is `Ok` unless an error was
//! marked on that span, in which case it stays `Error`. A span watched with
//! [`TracedSpan::watch_cancellation`] that is dropped before
//! [`TracedSpan::complete`] closes as `Error("cancelled")` with an
//! [`CANCELLED_EVENT`] event.

use std::borrow::Cow;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{
    BaggagePropagator, TextMapCompositePropagator, TraceContextPropagator,
};
use opentelemetry_sdk::trace::Tracer;
use tracing::debug;

/// Event recorded on spans whose operation was dropped before finishing.
pub const CANCELLED_EVENT: &str = "operation.cancelled";

/// W3C trace-context plus baggage, applied together.
pub fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

// ---------------------------------------------------------------------------
// Span bookkeeping
// ---------------------------------------------------------------------------

/// Open/close counters across all spans from one factory.
#[derive(Debug, Default)]
pub struct SpanStats {
    started: AtomicU64,
    ended: AtomicU64,
    orphan_roots: AtomicU64,
}

impl SpanStats {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn ended(&self) -> u64 {
        self.ended.load(Ordering::Relaxed)
    }

    /// Spans currently open.
    pub fn open(&self) -> u64 {
        self.started().saturating_sub(self.ended())
    }

    /// Child spans that fell back to a new root for lack of a parent.
    pub fn orphan_roots(&self) -> u64 {
        self.orphan_roots.load(Ordering::Relaxed)
    }
}

/// Per-span state stored in the span's context next to the span itself.
#[derive(Debug)]
struct SpanState {
    errored: AtomicBool,
    ended: AtomicBool,
    watched: AtomicBool,
    completed: AtomicBool,
    stats: Arc<SpanStats>,
}

// ---------------------------------------------------------------------------
// SpanFactory
// ---------------------------------------------------------------------------

/// Creates root and child spans following the service's conventions.
///
/// Roots are `Server` spans parented on whatever upstream context the
/// propagator extracts from the inbound carrier. Children are `Internal`
/// (or `Client` for outbound calls) spans parented on the span active in
/// the given context.
#[derive(Clone)]
pub struct SpanFactory {
    tracer: Tracer,
    propagator: Arc<TextMapCompositePropagator>,
    stats: Arc<SpanStats>,
}

impl std::fmt::Debug for SpanFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanFactory")
            .field("started", &self.stats.started())
            .field("ended", &self.stats.ended())
            .finish()
    }
}

impl SpanFactory {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer,
            propagator: Arc::new(composite_propagator()),
            stats: Arc::new(SpanStats::default()),
        }
    }

    pub fn stats(&self) -> &SpanStats {
        &self.stats
    }

    /// Decode upstream trace context and baggage from an inbound carrier.
    pub fn extract(&self, carrier: &dyn Extractor) -> Context {
        self.propagator.extract(carrier)
    }

    /// Encode the context's span and baggage onto an outbound carrier.
    pub fn inject(&self, cx: &Context, carrier: &mut dyn Injector) {
        self.propagator.inject_context(cx, carrier);
    }

    /// Start a server span for an inbound request.
    ///
    /// Continues the upstream trace when the carrier holds a valid
    /// `traceparent`, otherwise starts a new trace.
    pub fn start_root_span(
        &self,
        carrier: &dyn Extractor,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) -> TracedSpan {
        let parent = self.extract(carrier);
        self.start(&parent, name.into(), SpanKind::Server, attributes)
    }

    /// Start an internal span under the span active in `cx`.
    ///
    /// With no active span this starts a fresh root (no extraction) and
    /// counts it in [`SpanStats::orphan_roots`].
    pub fn start_child_span(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) -> TracedSpan {
        self.start_under(cx, name.into(), SpanKind::Internal, attributes)
    }

    /// Like [`start_child_span`](Self::start_child_span) for outbound calls.
    pub fn start_client_span(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) -> TracedSpan {
        self.start_under(cx, name.into(), SpanKind::Client, attributes)
    }

    fn start_under(
        &self,
        cx: &Context,
        name: Cow<'static, str>,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
    ) -> TracedSpan {
        if !cx.has_active_span() {
            debug!(span = %name, "no active span in context, starting new root");
            self.stats.orphan_roots.fetch_add(1, Ordering::Relaxed);
        }
        // A context without a span yields a root while keeping its other values.
        self.start(cx, name, kind, attributes)
    }

    fn start(
        &self,
        parent: &Context,
        name: Cow<'static, str>,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
    ) -> TracedSpan {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, parent);
        let state = Arc::new(SpanState {
            errored: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            watched: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        });
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        let cx = parent.with_span(span).with_value(Arc::clone(&state));
        TracedSpan { cx, state }
    }
}

// ---------------------------------------------------------------------------
// Error marking
// ---------------------------------------------------------------------------

/// Flag the span active in `cx` as failed.
///
/// Sets `Error` status with the error's message and records it as an
/// `exception` event. A no-op when the context has no span.
pub fn mark_error(cx: &Context, err: &dyn Error) {
    if !cx.has_active_span() {
        return;
    }
    flag_errored(cx);
    let span = cx.span();
    span.set_status(Status::error(err.to_string()));
    span.record_error(err);
}

/// Flag the span active in `cx` as failed without an underlying error value.
pub fn mark_failed(
    cx: &Context,
    description: impl Into<Cow<'static, str>>,
    event: &'static str,
    attributes: Vec<KeyValue>,
) {
    if !cx.has_active_span() {
        return;
    }
    flag_errored(cx);
    let span = cx.span();
    span.set_status(Status::Error {
        description: description.into(),
    });
    span.add_event(event, attributes);
}

fn flag_errored(cx: &Context) {
    if let Some(state) = cx.get::<Arc<SpanState>>() {
        state.errored.store(true, Ordering::SeqCst);
    }
}

/// Hex trace and span ids of a live, recording span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanIds {
    pub trace_id: String,
    pub span_id: String,
}

/// Ids of the span active in `cx`, if it is valid and still recording.
///
/// Read-only: never starts a span or touches the context.
pub fn recording_span_ids(cx: &Context) -> Option<SpanIds> {
    if !cx.has_active_span() {
        return None;
    }
    let span = cx.span();
    let sc = span.span_context();
    if !sc.is_valid() || !span.is_recording() {
        return None;
    }
    Some(SpanIds {
        trace_id: sc.trace_id().to_string(),
        span_id: sc.span_id().to_string(),
    })
}

// ---------------------------------------------------------------------------
// TracedSpan
// ---------------------------------------------------------------------------

/// Owning guard for one span. Closing happens exactly once, on drop or
/// [`end`](Self::end).
#[derive(Debug)]
pub struct TracedSpan {
    cx: Context,
    state: Arc<SpanState>,
}

impl TracedSpan {
    /// Context carrying this span; pass it to anything that should nest
    /// under it.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn trace_id(&self) -> String {
        self.cx.span().span_context().trace_id().to_string()
    }

    pub fn span_id(&self) -> String {
        self.cx.span().span_context().span_id().to_string()
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        self.cx.span().add_event(name, attributes);
    }

    pub fn record_error(&self, err: &dyn Error) {
        mark_error(&self.cx, err);
    }

    pub fn is_errored(&self) -> bool {
        self.state.errored.load(Ordering::SeqCst)
    }

    /// Close as cancelled if dropped before [`complete`](Self::complete).
    pub fn watch_cancellation(&self) {
        self.state.watched.store(true, Ordering::SeqCst);
    }

    /// The traced operation produced a result.
    pub fn complete(&self) {
        self.state.completed.store(true, Ordering::SeqCst);
    }

    /// Watched and not yet completed.
    pub fn is_pending(&self) -> bool {
        self.state.watched.load(Ordering::SeqCst) && !self.state.completed.load(Ordering::SeqCst)
    }

    pub fn end(self) {
        self.complete();
        drop(self);
    }

    fn finish(&self) {
        if self.state.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_pending() {
            debug!(span_id = %self.span_id(), "span dropped before its operation finished");
            mark_failed(&self.cx, "cancelled", CANCELLED_EVENT, vec![]);
        }
        let span = self.cx.span();
        if !self.state.errored.load(Ordering::SeqCst) {
            span.set_status(Status::Ok);
        }
        span.end();
        self.state.stats.ended.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for TracedSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// HTTP header carriers
// ---------------------------------------------------------------------------

/// Read-only carrier over inbound HTTP headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Write carrier over outbound HTTP headers. Invalid header values are skipped.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, val);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::TracerProvider;
    use std::collections::HashMap;

    fn factory() -> (TracerProvider, SpanFactory) {
        let provider = TracerProvider::builder().build();
        let factory = SpanFactory::new(provider.tracer("test"));
        (provider, factory)
    }

    #[test]
    fn test_root_span_ids_format() {
        let (_p, f) = factory();
        let span = f.start_root_span(&HashMap::<String, String>::new(), "GET /health", vec![]);
        assert_eq!(span.trace_id().len(), 32);
        assert_eq!(span.span_id().len(), 16);
        assert!(span.trace_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_root_continues_upstream_trace() {
        let (_p, f) = factory();
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        let span = f.start_root_span(&carrier, "POST /watchlist/add", vec![]);
        assert_eq!(span.trace_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_ne!(span.span_id(), "00f067aa0ba902b7");
    }

    #[test]
    fn test_child_shares_trace_with_parent() {
        let (_p, f) = factory();
        let root = f.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);
        let child = f.start_child_span(root.context(), "child", vec![]);
        assert_eq!(child.trace_id(), root.trace_id());
        assert_ne!(child.span_id(), root.span_id());
        assert_eq!(f.stats().orphan_roots(), 0);
    }

    #[test]
    fn test_child_without_parent_is_new_root() {
        let (_p, f) = factory();
        let orphan = f.start_child_span(&Context::new(), "maintenance", vec![]);
        assert_eq!(orphan.trace_id().len(), 32);
        assert_eq!(f.stats().orphan_roots(), 1);
    }

    #[test]
    fn test_close_count_matches_start_count() {
        let (_p, f) = factory();
        {
            let root = f.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);
            let child = f.start_child_span(root.context(), "child", vec![]);
            assert_eq!(f.stats().open(), 2);
            child.end();
            assert_eq!(f.stats().open(), 1);
        }
        assert_eq!(f.stats().started(), 2);
        assert_eq!(f.stats().ended(), 2);
    }

    #[test]
    fn test_watched_span_dropped_early_is_cancelled() {
        let (_p, f) = factory();
        let span = f.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);
        span.watch_cancellation();
        assert!(span.is_pending());
        let cx = span.context().clone();
        drop(span);
        assert!(state(&cx).errored.load(Ordering::SeqCst));
    }

    #[test]
    fn test_completed_or_unwatched_span_is_not_cancelled() {
        let (_p, f) = factory();
        let watched = f.start_root_span(&HashMap::<String, String>::new(), "a", vec![]);
        watched.watch_cancellation();
        watched.complete();
        assert!(!watched.is_pending());
        let cx = watched.context().clone();
        drop(watched);
        assert!(!state(&cx).errored.load(Ordering::SeqCst));

        let plain = f.start_root_span(&HashMap::<String, String>::new(), "b", vec![]);
        assert!(!plain.is_pending());
        let cx = plain.context().clone();
        drop(plain);
        assert!(!state(&cx).errored.load(Ordering::SeqCst));
    }

    fn state(cx: &Context) -> &Arc<SpanState> {
        cx.get::<Arc<SpanState>>().unwrap()
    }

    #[test]
    fn test_mark_error_flags_guard() {
        let (_p, f) = factory();
        let span = f.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);
        assert!(!span.is_errored());
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        mark_error(span.context(), &err);
        assert!(span.is_errored());
    }

    #[test]
    fn test_mark_error_without_span_is_noop() {
        let err = std::io::Error::other("boom");
        mark_error(&Context::new(), &err);
        assert!(recording_span_ids(&Context::new()).is_none());
    }

    #[test]
    fn test_recording_ids_match_span() {
        let (_p, f) = factory();
        let span = f.start_root_span(&HashMap::<String, String>::new(), "root", vec![]);
        let ids = recording_span_ids(span.context()).unwrap();
        assert_eq!(ids.trace_id, span.trace_id());
        assert_eq!(ids.span_id, span.span_id());
    }

    #[test]
    fn test_remote_parent_is_not_recording() {
        let (_p, f) = factory();
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        let upstream = f.extract(&carrier);
        assert!(recording_span_ids(&upstream).is_none());
    }

    #[test]
    fn test_inject_writes_traceparent_and_baggage() {
        let (_p, f) = factory();
        let mut inbound = HashMap::new();
        inbound.insert("baggage".to_string(), "user_id=42".to_string());
        let span = f.start_root_span(&inbound, "root", vec![]);

        let mut headers = HeaderMap::new();
        f.inject(span.context(), &mut HeaderInjector(&mut headers));
        let traceparent = headers.get("traceparent").unwrap().to_str().unwrap();
        assert!(traceparent.contains(&span.trace_id()));
        assert_eq!(headers.get("baggage").unwrap(), "user_id=42");

        let extracted = f.extract(&HeaderExtractor(&headers));
        assert_eq!(
            extracted.span().span_context().trace_id().to_string(),
            span.trace_id()
        );
    }
}
