use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use st_telemetry::config::ConfigError;
use st_telemetry::TelemetryConfig;

/// Top-level daemon settings. The `[telemetry]` table is handed to the
/// telemetry bootstrap as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Browser origins allowed by CORS. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_origins: Vec::new(),
            market: MarketConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

impl DaemonConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: DaemonConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply process environment overrides on top of the file.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = get("ALPHAVANTAGE_API_KEY") {
            self.market.api_key = key;
        }
        if let Some(addr) = get("LISTEN_ADDR").and_then(|a| a.parse().ok()) {
            self.listen_addr = addr;
        }
        self.telemetry.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.market.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "market.timeout_secs must be greater than zero".to_string(),
            ));
        }
        for (field, url) in [
            ("market.stocks_base_url", &self.market.stocks_base_url),
            ("market.crypto_base_url", &self.market.crypto_base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "{field} `{url}` must be an http(s) url"
                )));
            }
        }
        self.telemetry.validate()
    }
}

/// Upstream market-data APIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketConfig {
    #[serde(default = "default_stocks_base_url")]
    pub stocks_base_url: String,
    #[serde(default = "default_crypto_base_url")]
    pub crypto_base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_market_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            stocks_base_url: default_stocks_base_url(),
            crypto_base_url: default_crypto_base_url(),
            api_key: default_api_key(),
            timeout_secs: default_market_timeout_secs(),
        }
    }
}

impl MarketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_stocks_base_url() -> String {
    "https://www.alphavantage.co".to_string()
}
fn default_crypto_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_api_key() -> String {
    "demo".to_string()
}
fn default_market_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        DaemonConfig::default().validate().unwrap();
    }

    #[test]
    fn test_nested_telemetry_table() {
        let cfg = DaemonConfig::from_toml_str(
            r#"
listen_addr = "127.0.0.1:9000"

[market]
timeout_secs = 3

[telemetry.service]
name = "stock-tracker-eu"

[telemetry.metrics]
exporter = "otlp"
"#,
        )
        .unwrap();
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(cfg.market.timeout(), Duration::from_secs(3));
        assert_eq!(cfg.market.stocks_base_url, default_stocks_base_url());
        assert_eq!(cfg.telemetry.service.name, "stock-tracker-eu");
        assert_eq!(
            cfg.telemetry.metrics.exporter,
            st_telemetry::config::MetricsExporterKind::Otlp
        );
    }

    #[test]
    fn test_zero_market_timeout_rejected() {
        let err = DaemonConfig::from_toml_str("[market]\ntimeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_env_overrides_reach_telemetry() {
        let mut cfg = DaemonConfig::default();
        cfg.apply_overrides(|key| match key {
            "ALPHAVANTAGE_API_KEY" => Some("secret".to_string()),
            "OTEL_SERVICE_NAME" => Some("from-env".to_string()),
            "LISTEN_ADDR" => Some("not-an-addr".to_string()),
            _ => None,
        });
        assert_eq!(cfg.market.api_key, "secret");
        assert_eq!(cfg.telemetry.service.name, "from-env");
        assert_eq!(cfg.listen_addr, default_listen_addr());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, DaemonConfig::default());
    }
}
