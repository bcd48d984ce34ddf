use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::Uri;
use serde::{Deserialize, Serialize};

/// Everything the telemetry bootstrap needs, loadable from a `[telemetry]`
/// TOML table or a standalone file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub traces: TracesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub histograms: HistogramsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Panic on lookups of unregistered instruments instead of warning.
    #[serde(default = "default_strict")]
    pub strict: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            traces: TracesConfig::default(),
            metrics: MetricsConfig::default(),
            histograms: HistogramsConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
            strict: default_strict(),
        }
    }
}

impl TelemetryConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: TelemetryConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the standard OTel environment overrides from the process env.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(endpoint) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.traces.endpoint = endpoint.clone();
            self.metrics.otlp_endpoint = endpoint;
        }
        if let Some(name) = get("OTEL_SERVICE_NAME") {
            self.service.name = name;
        }
        if let Some(env) = get("DEPLOYMENT_ENVIRONMENT") {
            self.service.environment = env;
        }
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint("traces.endpoint", &self.traces.endpoint)?;
        if self.metrics.exporter == MetricsExporterKind::Otlp {
            validate_endpoint("metrics.otlp_endpoint", &self.metrics.otlp_endpoint)?;
            if self.metrics.interval_secs == 0 {
                return Err(ConfigError::Validation(
                    "metrics.interval_secs must be greater than zero".to_string(),
                ));
            }
        }
        if self.traces.max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "traces.max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.shutdown.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "shutdown.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_endpoint(field: &str, endpoint: &str) -> Result<(), ConfigError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| ConfigError::Validation(format!("{field} `{endpoint}` is not a valid uri: {e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ConfigError::Validation(format!(
                "{field} `{endpoint}` must use http or https"
            )))
        }
    }
    if uri.authority().is_none() {
        return Err(ConfigError::Validation(format!(
            "{field} `{endpoint}` has no host"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_service_version")]
    pub version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Operator-supplied resource tags.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            version: default_service_version(),
            environment: default_environment(),
            attributes: BTreeMap::new(),
        }
    }
}

fn default_service_name() -> String {
    "stock-tracker-service".to_string()
}
fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TracesConfig {
    /// OTLP/HTTP collector base URL; `/v1/traces` is appended.
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_export_timeout_secs")]
    pub export_timeout_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_scheduled_delay_ms")]
    pub scheduled_delay_ms: u64,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            export_timeout_secs: default_export_timeout_secs(),
            max_queue_size: default_max_queue_size(),
            scheduled_delay_ms: default_scheduled_delay_ms(),
        }
    }
}

impl TracesConfig {
    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn scheduled_delay(&self) -> Duration {
        Duration::from_millis(self.scheduled_delay_ms)
    }
}

fn default_otlp_endpoint() -> String {
    "http://otel-collector:4318".to_string()
}
fn default_export_timeout_secs() -> u64 {
    10
}
fn default_max_queue_size() -> usize {
    2048
}
fn default_scheduled_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricsExporterKind {
    /// Pull: text exposition served on `prometheus_addr`.
    #[default]
    Prometheus,
    /// Push: periodic OTLP/HTTP export.
    Otlp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub exporter: MetricsExporterKind,
    #[serde(default = "default_prometheus_addr")]
    pub prometheus_addr: SocketAddr,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            exporter: MetricsExporterKind::default(),
            prometheus_addr: default_prometheus_addr(),
            otlp_endpoint: default_otlp_endpoint(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_prometheus_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2222))
}
fn default_interval_secs() -> u64 {
    30
}

/// Explicit bucket boundaries per metric family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistogramsConfig {
    #[serde(default = "default_db_buckets")]
    pub db: Vec<f64>,
    #[serde(default = "default_http_buckets")]
    pub http: Vec<f64>,
    #[serde(default = "default_external_api_buckets")]
    pub external_api: Vec<f64>,
    #[serde(default = "default_size_buckets")]
    pub size_bytes: Vec<f64>,
}

impl Default for HistogramsConfig {
    fn default() -> Self {
        Self {
            db: default_db_buckets(),
            http: default_http_buckets(),
            external_api: default_external_api_buckets(),
            size_bytes: default_size_buckets(),
        }
    }
}

fn default_db_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}
fn default_http_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}
fn default_external_api_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
}
fn default_size_buckets() -> Vec<f64> {
    vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Correlated JSON-lines output; stdout when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_strict() -> bool {
    cfg!(debug_assertions)
}
