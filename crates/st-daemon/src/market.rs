use std::time::Duration;

use opentelemetry::{Context, KeyValue};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use st_telemetry::span::{mark_error, HeaderInjector};
use st_telemetry::{Classify, ExternalCalls, SpanFactory};

use crate::config::MarketConfig;

pub const ALPHAVANTAGE: &str = "alphavantage";
pub const COINGECKO: &str = "coingecko";

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("{api} did not answer within {after:?}")]
    Timeout { api: &'static str, after: Duration },
    #[error("{api} answered with HTTP {status}")]
    Status { api: &'static str, status: u16 },
    #[error("{api} sent an unreadable body: {reason}")]
    Decode { api: &'static str, reason: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Classify for MarketError {}

/// Upstream quote lookups. Implementations run under the caller's context.
#[async_trait::async_trait]
pub trait MarketData: Send + Sync {
    async fn stock_quote(&self, cx: &Context, symbol: &str) -> Result<Value, MarketError>;

    async fn crypto_quote(&self, cx: &Context, id: &str) -> Result<Value, MarketError>;

    /// Tickers Alpha Vantage lists as active.
    async fn stock_symbols(&self, cx: &Context) -> Result<Vec<String>, MarketError>;

    /// Top coins by market cap.
    async fn crypto_symbols(&self, cx: &Context) -> Result<Vec<CoinSymbol>, MarketError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinSymbol {
    pub symbol: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct Listing {
    symbol: String,
    status: String,
}

/// Active tickers from an Alpha Vantage `LISTING_STATUS` CSV body.
pub fn active_symbols(csv_body: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::Reader::from_reader(csv_body.as_bytes());
    let mut symbols = Vec::new();
    for row in reader.deserialize::<Listing>() {
        let row = row?;
        if row.status.trim() == "Active" {
            symbols.push(row.symbol);
        }
    }
    Ok(symbols)
}

/// `{symbol, id}` pairs from a CoinGecko `/coins/markets` body. Entries
/// missing either field are skipped.
pub fn coin_symbols(markets: &Value) -> Vec<CoinSymbol> {
    markets
        .as_array()
        .map(|coins| {
            coins
                .iter()
                .filter_map(|coin| {
                    Some(CoinSymbol {
                        symbol: coin.get("symbol")?.as_str()?.to_string(),
                        id: coin.get("id")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// [`MarketData`] over the public Alpha Vantage and CoinGecko HTTP APIs.
#[derive(Debug, Clone)]
pub struct HttpMarketClient {
    client: reqwest::Client,
    config: MarketConfig,
    spans: SpanFactory,
    external: ExternalCalls,
}

impl HttpMarketClient {
    pub fn new(
        config: MarketConfig,
        spans: SpanFactory,
        external: ExternalCalls,
    ) -> Result<Self, MarketError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("st-daemon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            spans,
            external,
        })
    }

    async fn get_json(
        &self,
        cx: &Context,
        api: &'static str,
        endpoint: &'static str,
        url: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<Value, MarketError> {
        let body = self.get_text(cx, api, endpoint, url, query).await?;
        serde_json::from_str(&body).map_err(|e| MarketError::Decode {
            api,
            reason: e.to_string(),
        })
    }

    async fn get_text(
        &self,
        cx: &Context,
        api: &'static str,
        endpoint: &'static str,
        url: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<String, MarketError> {
        let client = self.client.clone();
        let spans = self.spans.clone();
        let timeout = self.config.timeout();
        self.external
            .call(cx, api, endpoint, |call_cx| async move {
                let mut headers = HeaderMap::new();
                spans.inject(&call_cx, &mut HeaderInjector(&mut headers));
                let fetch = async {
                    let resp = client.get(&url).query(&query).headers(headers).send().await?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(MarketError::Status {
                            api,
                            status: status.as_u16(),
                        });
                    }
                    Ok::<_, MarketError>(resp.text().await?)
                };
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(MarketError::Timeout { api, after: timeout }),
                }
            })
            .await
    }
}

#[async_trait::async_trait]
impl MarketData for HttpMarketClient {
    async fn stock_quote(&self, cx: &Context, symbol: &str) -> Result<Value, MarketError> {
        let url = format!("{}/query", self.config.stocks_base_url.trim_end_matches('/'));
        let query = vec![
            ("function", "TIME_SERIES_DAILY".to_string()),
            ("symbol", symbol.to_string()),
            ("outputsize", "compact".to_string()),
            ("apikey", self.config.api_key.clone()),
        ];
        self.get_json(cx, ALPHAVANTAGE, "/query", url, query).await
    }

    async fn crypto_quote(&self, cx: &Context, id: &str) -> Result<Value, MarketError> {
        let url = format!(
            "{}/coins/markets",
            self.config.crypto_base_url.trim_end_matches('/')
        );
        let query = vec![
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", "100".to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
            ("ids", id.to_string()),
        ];
        self.get_json(cx, COINGECKO, "/coins/markets", url, query).await
    }

    async fn stock_symbols(&self, cx: &Context) -> Result<Vec<String>, MarketError> {
        let url = format!("{}/query", self.config.stocks_base_url.trim_end_matches('/'));
        let query = vec![
            ("function", "LISTING_STATUS".to_string()),
            ("apikey", self.config.api_key.clone()),
        ];
        let body = self.get_text(cx, ALPHAVANTAGE, "/query", url, query).await?;

        let span = self.spans.start_child_span(cx, "process_csv_response", vec![]);
        match active_symbols(&body) {
            Ok(symbols) => {
                span.set_attribute(KeyValue::new("symbols.count", symbols.len() as i64));
                Ok(symbols)
            }
            Err(e) => {
                mark_error(span.context(), &e);
                Err(MarketError::Decode {
                    api: ALPHAVANTAGE,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn crypto_symbols(&self, cx: &Context) -> Result<Vec<CoinSymbol>, MarketError> {
        let url = format!(
            "{}/coins/markets",
            self.config.crypto_base_url.trim_end_matches('/')
        );
        let query = vec![
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", "100".to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
        ];
        let markets = self
            .get_json(cx, COINGECKO, "/coins/markets", url, query)
            .await?;
        Ok(coin_symbols(&markets))
    }
}
