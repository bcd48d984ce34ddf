//! Before/after interception around database operations.
//!
//! `before` stamps an [`OperationTiming`] into the operation's context;
//! `after` reads it back, classifies the result, records
//! `db_query_count` and `db_query_duration_seconds` tagged with
//! `{db.operation, db.table, outcome}`, and reports failures on the active
//! span and the correlated log.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use opentelemetry::{Context, KeyValue};
use serde_json::{json, Map};
use tracing::warn;

use crate::logging::CorrelatedLogger;
use crate::metrics::{attributes, CounterHandle, HistogramHandle};
use crate::span::{mark_error, SpanFactory};

// ---------------------------------------------------------------------------
// Operation kinds and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbOperation {
    Query,
    Create,
    Update,
    Delete,
    Raw,
}

impl DbOperation {
    /// Tag value used in metrics and span names.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbOperation::Query => "select",
            DbOperation::Create => "insert",
            DbOperation::Update => "update",
            DbOperation::Delete => "delete",
            DbOperation::Raw => "raw",
        }
    }
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of results an instrumented operation can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// Expected empty result of a lookup. Never counted as a failure.
    NotFound,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NotFound => "not_found",
            Outcome::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error value onto an [`Outcome`]. Benign conditions such as
/// "no rows" return [`Outcome::NotFound`]; the default is a failure.
pub trait Classify {
    fn classify(&self) -> Outcome {
        Outcome::Error
    }
}

/// Outcome of a finished operation.
pub fn classify<T, E: Classify>(result: &Result<T, E>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(e) => match e.classify() {
            // An error value can only be benign or a failure.
            Outcome::Success => Outcome::Error,
            other => other,
        },
    }
}

// ---------------------------------------------------------------------------
// OperationTiming
// ---------------------------------------------------------------------------

/// Start time of one in-flight database operation, carried in its context.
#[derive(Debug, Clone, Copy)]
pub struct OperationTiming {
    started: Instant,
}

impl OperationTiming {
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Counts an operation with `outcome="error"` if it is dropped before
/// [`disarm`](Self::disarm) is called.
pub(crate) struct CancelGuard<'a> {
    counter: &'a CounterHandle,
    attributes: [KeyValue; 3],
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    pub(crate) fn new(counter: &'a CounterHandle, attributes: [KeyValue; 3]) -> Self {
        Self {
            counter,
            attributes,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(counter = self.counter.name(), "operation cancelled before completion");
            self.counter.inc(&self.attributes);
        }
    }
}

// ---------------------------------------------------------------------------
// DbHooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DbHooks {
    spans: SpanFactory,
    count: CounterHandle,
    duration: HistogramHandle,
    logger: CorrelatedLogger,
}

impl DbHooks {
    pub fn new(
        spans: SpanFactory,
        count: CounterHandle,
        duration: HistogramHandle,
        logger: CorrelatedLogger,
    ) -> Self {
        Self {
            spans,
            count,
            duration,
            logger,
        }
    }

    /// Context for the operation, stamped with a start time unless one is
    /// already present (nested hook invocations keep the outer timing).
    pub fn before(&self, cx: &Context, _op: DbOperation) -> Context {
        if cx.get::<OperationTiming>().is_some() {
            return cx.clone();
        }
        cx.with_value(OperationTiming {
            started: Instant::now(),
        })
    }

    /// Consume the operation context, record metrics and report the outcome.
    ///
    /// A context without timing is recorded as unmeasured: the counter still
    /// increments, no duration is observed.
    pub fn after<T, E>(
        &self,
        cx: Context,
        op: DbOperation,
        table: &str,
        result: &Result<T, E>,
    ) -> Outcome
    where
        E: Error + Classify,
    {
        let outcome = classify(result);
        let attrs = [
            KeyValue::new(attributes::DB_OPERATION, op.as_str()),
            KeyValue::new(attributes::DB_TABLE, table.to_string()),
            KeyValue::new(attributes::OUTCOME, outcome.as_str()),
        ];

        self.count.inc(&attrs);
        let duration = cx.get::<OperationTiming>().map(OperationTiming::elapsed);
        match duration {
            Some(d) => self.duration.record(d.as_secs_f64(), &attrs),
            None => warn!(operation = %op, table, "db operation finished without timing, duration unmeasured"),
        }

        let mut fields = Map::new();
        fields.insert("db.operation".into(), json!(op.as_str()));
        fields.insert("db.table".into(), json!(table));
        fields.insert("outcome".into(), json!(outcome.as_str()));
        if let Some(d) = duration {
            fields.insert("duration_ms".into(), json!(d.as_secs_f64() * 1000.0));
        }

        match (outcome, result) {
            (Outcome::Error, Err(err)) => {
                mark_error(&cx, err);
                fields.insert("error".into(), json!(err.to_string()));
                self.logger.error(&cx, "db operation failed", fields);
            }
            (Outcome::NotFound, _) => {
                self.logger.info(&cx, "db lookup returned no rows", fields);
            }
            _ => {
                self.logger.info(&cx, "db operation completed", fields);
            }
        }
        outcome
    }

    /// Run `fut` as one database operation under a `"{op} {table}"` child
    /// span. The result is returned unchanged.
    ///
    /// Dropping the returned future before `fut` finishes closes the span as
    /// cancelled and counts the operation with `outcome="error"`.
    pub async fn instrument<F, T, E>(
        &self,
        cx: &Context,
        op: DbOperation,
        table: &str,
        fut: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Error + Classify,
    {
        let span = self.spans.start_child_span(
            cx,
            format!("{} {}", op.as_str(), table),
            vec![
                KeyValue::new(attributes::DB_OPERATION, op.as_str()),
                KeyValue::new(attributes::DB_TABLE, table.to_string()),
            ],
        );
        span.watch_cancellation();
        let cancelled = CancelGuard::new(
            &self.count,
            [
                KeyValue::new(attributes::DB_OPERATION, op.as_str()),
                KeyValue::new(attributes::DB_TABLE, table.to_string()),
                KeyValue::new(attributes::OUTCOME, Outcome::Error.as_str()),
            ],
        );
        let op_cx = self.before(span.context(), op);
        let result = fut.await;
        cancelled.disarm();
        span.complete();
        let outcome = self.after(op_cx, op, table, &result);
        span.set_attribute(KeyValue::new(attributes::OUTCOME, outcome.as_str()));
        result
    }
}
