use std::error::Error;
use std::future::Future;
use std::time::Instant;

use opentelemetry::{Context, KeyValue};
use serde_json::{json, Map};

use crate::db::{classify, CancelGuard, Classify, Outcome};
use crate::logging::CorrelatedLogger;
use crate::metrics::{attributes, CounterHandle, HistogramHandle};
use crate::span::{mark_error, SpanFactory};

impl Classify for tokio::time::error::Elapsed {}

impl Classify for std::io::Error {}

/// Times outbound API calls as opaque operations under a client span.
#[derive(Debug, Clone)]
pub struct ExternalCalls {
    spans: SpanFactory,
    calls: CounterHandle,
    duration: HistogramHandle,
    logger: CorrelatedLogger,
}

impl ExternalCalls {
    pub fn new(
        spans: SpanFactory,
        calls: CounterHandle,
        duration: HistogramHandle,
        logger: CorrelatedLogger,
    ) -> Self {
        Self {
            spans,
            calls,
            duration,
            logger,
        }
    }

    /// Run one call to `api` at `endpoint`.
    ///
    /// `call` receives the client span's context so it can inject trace
    /// headers. The result is returned unchanged; failures mark the span,
    /// log at error level, and are counted with `outcome="error"`. So is a
    /// call whose future is dropped before it finishes; its span closes as
    /// cancelled.
    pub async fn call<F, Fut, T, E>(
        &self,
        cx: &Context,
        api: &str,
        endpoint: &str,
        call: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Classify,
    {
        let span = self.spans.start_client_span(
            cx,
            format!("{api} {endpoint}"),
            vec![
                KeyValue::new(attributes::API_NAME, api.to_string()),
                KeyValue::new(attributes::ENDPOINT, endpoint.to_string()),
            ],
        );
        span.watch_cancellation();
        let cancelled = CancelGuard::new(
            &self.calls,
            [
                KeyValue::new(attributes::API_NAME, api.to_string()),
                KeyValue::new(attributes::ENDPOINT, endpoint.to_string()),
                KeyValue::new(attributes::OUTCOME, Outcome::Error.as_str()),
            ],
        );
        let started = Instant::now();
        let result = call(span.context().clone()).await;
        let elapsed = started.elapsed();
        cancelled.disarm();
        span.complete();

        let outcome = classify(&result);
        let attrs = [
            KeyValue::new(attributes::API_NAME, api.to_string()),
            KeyValue::new(attributes::ENDPOINT, endpoint.to_string()),
            KeyValue::new(attributes::OUTCOME, outcome.as_str()),
        ];
        self.calls.inc(&attrs);
        self.duration.record(elapsed.as_secs_f64(), &attrs);
        span.set_attribute(KeyValue::new(attributes::OUTCOME, outcome.as_str()));

        let mut fields = Map::new();
        fields.insert("api.name".into(), json!(api));
        fields.insert("endpoint".into(), json!(endpoint));
        fields.insert("outcome".into(), json!(outcome.as_str()));
        fields.insert("duration_ms".into(), json!(elapsed.as_secs_f64() * 1000.0));

        match (&result, outcome) {
            (Err(err), Outcome::Error) => {
                mark_error(span.context(), err);
                fields.insert("error".into(), json!(err.to_string()));
                self.logger.error(span.context(), "external api call failed", fields);
            }
            _ => self.logger.info(span.context(), "external api call completed", fields),
        }
        result
    }
}
