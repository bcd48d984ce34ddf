use std::fmt;

use thiserror::Error;

/// Failures that abort telemetry bootstrap.
///
/// Every variant is fatal: a process that cannot wire its providers
/// correctly should not start serving.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid resource: {0}")]
    Resource(String),

    #[error("trace exporter: {0}")]
    TraceExporter(String),

    #[error("metric exporter: {0}")]
    MetricExporter(String),

    #[error("instrument `{0}` is already registered")]
    DuplicateInstrument(String),

    #[error("invalid instrument name `{0}`")]
    InvalidInstrumentName(String),

    #[error("invalid unit `{unit}` for instrument `{name}`")]
    InvalidUnit { name: String, unit: String },

    #[error("invalid bucket boundaries for `{name}`: {reason}")]
    InvalidBuckets { name: String, reason: String },

    #[error("metric view for `{name}`: {reason}")]
    View { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log sink: {0}")]
    LogSink(#[from] LogError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Errors produced while writing a correlated log record.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One failed step of the ordered telemetry teardown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("telemetry already shut down")]
    AlreadyShutDown,

    #[error("{step}: deadline exceeded before completion")]
    Timeout { step: &'static str },

    #[error("{step}: {message}")]
    Step { step: &'static str, message: String },
}

impl ShutdownError {
    pub fn step(&self) -> Option<&'static str> {
        match self {
            ShutdownError::AlreadyShutDown => None,
            ShutdownError::Timeout { step } | ShutdownError::Step { step, .. } => Some(step),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ShutdownError::Timeout { .. })
    }
}

/// Aggregate outcome of a shutdown run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Steps that finished before the deadline without error, in order.
    pub completed: Vec<&'static str>,
    pub errors: Vec<ShutdownError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// True when any step was cut off by the shared deadline.
    pub fn timed_out(&self) -> bool {
        self.errors.iter().any(ShutdownError::is_timeout)
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "clean shutdown ({} steps)", self.completed.len());
        }
        let msgs: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(
            f,
            "{} of {} steps failed: {}",
            self.errors.len(),
            self.errors.len() + self.completed.len(),
            msgs.join("; ")
        )
    }
}
