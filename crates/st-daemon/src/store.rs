//! In-memory watchlist store.
//!
//! Every operation runs through [`DbHooks`] against the `user_symbols`
//! table, so each call yields a child span, a query counter increment and a
//! duration observation the same way a SQL-backed store would.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use st_telemetry::db::Outcome;
use st_telemetry::{Classify, DbHooks, DbOperation};
use uuid::Uuid;

pub const TABLE: &str = "user_symbols";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SymbolKind {
    Stock,
    Crypto,
}

/// One row of a user's watchlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSymbol {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: SymbolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /watchlist/add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUserSymbol {
    pub symbol: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: SymbolKind,
    #[serde(default)]
    pub crypto_id: Option<String>,
}

impl NewUserSymbol {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.symbol.trim().is_empty() {
            return Err(StoreError::Invalid("symbol must not be empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(StoreError::Invalid("userId must not be empty".to_string()));
        }
        if self.kind == SymbolKind::Crypto
            && self.crypto_id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            return Err(StoreError::Invalid(
                "cryptoId is required for CRYPTO symbols".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no rows for user {user_id}")]
    NotFound { user_id: String },
    #[error("{symbol} is already on the watchlist of {user_id}")]
    Duplicate { user_id: String, symbol: String },
    #[error("invalid row: {0}")]
    Invalid(String),
}

impl Classify for StoreError {
    fn classify(&self) -> Outcome {
        match self {
            StoreError::NotFound { .. } => Outcome::NotFound,
            _ => Outcome::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchlistStore {
    rows: Arc<DashMap<String, Vec<UserSymbol>>>,
    hooks: DbHooks,
}

impl WatchlistStore {
    pub fn new(hooks: DbHooks) -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            hooks,
        }
    }

    /// Insert a row. A symbol appears at most once per user.
    pub async fn add(&self, cx: &Context, new: NewUserSymbol) -> Result<UserSymbol, StoreError> {
        let rows = Arc::clone(&self.rows);
        self.hooks
            .instrument(cx, DbOperation::Create, TABLE, async move {
                new.validate()?;
                let mut entry = rows.entry(new.user_id.clone()).or_default();
                if entry.iter().any(|r| r.symbol == new.symbol) {
                    return Err(StoreError::Duplicate {
                        user_id: new.user_id,
                        symbol: new.symbol,
                    });
                }
                let crypto_id = match new.kind {
                    SymbolKind::Crypto => new.crypto_id,
                    SymbolKind::Stock => None,
                };
                let row = UserSymbol {
                    id: Uuid::new_v4(),
                    user_id: new.user_id,
                    symbol: new.symbol,
                    kind: new.kind,
                    crypto_id,
                    created_at: Utc::now(),
                };
                entry.push(row.clone());
                Ok(row)
            })
            .await
    }

    /// All rows of `user_id`, oldest first.
    pub async fn list(&self, cx: &Context, user_id: &str) -> Result<Vec<UserSymbol>, StoreError> {
        let rows = Arc::clone(&self.rows);
        self.hooks
            .instrument(cx, DbOperation::Query, TABLE, async move {
                match rows.get(user_id) {
                    Some(list) if !list.is_empty() => Ok(list.clone()),
                    _ => Err(StoreError::NotFound {
                        user_id: user_id.to_string(),
                    }),
                }
            })
            .await
    }

    pub async fn remove(&self, cx: &Context, user_id: &str, symbol: &str) -> Result<(), StoreError> {
        let rows = Arc::clone(&self.rows);
        self.hooks
            .instrument(cx, DbOperation::Delete, TABLE, async move {
                let removed = match rows.get_mut(user_id) {
                    Some(mut list) => {
                        let before = list.len();
                        list.retain(|r| r.symbol != symbol);
                        before != list.len()
                    }
                    None => false,
                };
                if removed {
                    rows.remove_if(user_id, |_, list| list.is_empty());
                    Ok(())
                } else {
                    Err(StoreError::NotFound {
                        user_id: user_id.to_string(),
                    })
                }
            })
            .await
    }
}
