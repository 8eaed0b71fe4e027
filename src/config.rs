//! Environment knobs and the trading-pair catalog.
//!
//! Each service owns a `Settings` struct built via [`env_parse`]/[`env_flag`];
//! the catalog is the config collaborator's view of enabled pairs, backed by
//! the `trading_pairs` table with seeded defaults and a short read cache.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::Database;
use crate::util::now_ms;

/// Parse an env var, falling back to `default` when unset, empty, or invalid.
pub fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Truthy env flag: `1`, `true`, `yes`, `y` (case-insensitive).
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y"))
        .unwrap_or(false)
}

/// Process-wide gate for live order mutation. Checked together with the
/// per-call `confirm_live` flag on every live path.
pub fn live_oms_enabled() -> bool {
    env_flag("INARBIT_ENABLE_LIVE_OMS")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub is_active: bool,
    pub supported_exchanges: Vec<String>,
}

impl TradingPair {
    pub fn new(symbol: &str, base: &str, quote: &str, exchanges: &[&str]) -> Self {
        Self {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            is_active: true,
            supported_exchanges: exchanges.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub fn default_pairs() -> Vec<TradingPair> {
    [
        ("BTC/USDT", "BTC", "USDT"),
        ("ETH/USDT", "ETH", "USDT"),
        ("BNB/USDT", "BNB", "USDT"),
        ("SOL/USDT", "SOL", "USDT"),
        ("XRP/USDT", "XRP", "USDT"),
    ]
    .into_iter()
    .map(|(s, b, q)| TradingPair::new(s, b, q, &["binance"]))
    .collect()
}

/// Cross pairs seeded for the triangle scanner's base-currency cycles.
pub fn cross_pairs() -> Vec<TradingPair> {
    [
        ("ETH/BTC", "ETH", "BTC"),
        ("SOL/BTC", "SOL", "BTC"),
        ("BNB/BTC", "BNB", "BTC"),
        ("XRP/BTC", "XRP", "BTC"),
        ("DOGE/BTC", "DOGE", "BTC"),
        ("ADA/BTC", "ADA", "BTC"),
    ]
    .into_iter()
    .map(|(s, b, q)| TradingPair::new(s, b, q, &["binance"]))
    .collect()
}

struct CatalogCache {
    loaded_at: i64,
    exchange_id: String,
    pairs: Vec<TradingPair>,
}

/// DB-backed pair catalog with a short in-process cache.
pub struct PairCatalog {
    db: Database,
    cache: RwLock<Option<CatalogCache>>,
    cache_ttl_ms: i64,
}

impl PairCatalog {
    pub async fn new(db: Database) -> Result<Arc<Self>> {
        let catalog = Arc::new(Self {
            db,
            cache: RwLock::new(None),
            cache_ttl_ms: env_parse("CONFIG_PAIRS_CACHE_TTL_MS", 10_000i64),
        });
        catalog.seed_defaults().await?;
        Ok(catalog)
    }

    async fn seed_defaults(&self) -> Result<()> {
        let existing = self.db.get_pairs_for_exchange("binance", false).await?;
        if existing.is_empty() {
            for pair in default_pairs() {
                self.db.upsert_pair(&pair).await?;
            }
        }
        Ok(())
    }

    /// Make sure every pair exists and is active; invalidates the cache.
    pub async fn ensure_pairs(&self, pairs: &[TradingPair]) -> Result<()> {
        for pair in pairs {
            self.db.upsert_pair(pair).await?;
        }
        *self.cache.write() = None;
        Ok(())
    }

    pub async fn pairs_for_exchange(
        &self,
        exchange_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<TradingPair>> {
        let now = now_ms();
        {
            let cache = self.cache.read();
            if let Some(c) = cache.as_ref() {
                if c.exchange_id == exchange_id && now - c.loaded_at < self.cache_ttl_ms {
                    return Ok(filter_pairs(&c.pairs, enabled_only));
                }
            }
        }

        let pairs = self.db.get_pairs_for_exchange(exchange_id, false).await?;
        *self.cache.write() = Some(CatalogCache {
            loaded_at: now,
            exchange_id: exchange_id.to_string(),
            pairs: pairs.clone(),
        });
        Ok(filter_pairs(&pairs, enabled_only))
    }

    /// Symbols the OMS may execute against.
    pub async fn enabled_symbols(&self, exchange_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .pairs_for_exchange(exchange_id, true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect())
    }
}

fn filter_pairs(pairs: &[TradingPair], enabled_only: bool) -> Vec<TradingPair> {
    pairs
        .iter()
        .filter(|p| !enabled_only || p.is_active)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_seeds_defaults_and_serves_them() {
        let db = Database::open_in_memory().unwrap();
        let catalog = PairCatalog::new(db).await.unwrap();
        let pairs = catalog.pairs_for_exchange("binance", true).await.unwrap();
        assert!(pairs.iter().any(|p| p.symbol == "BTC/USDT"));

        let symbols = catalog.enabled_symbols("binance").await.unwrap();
        assert!(symbols.contains("ETH/USDT"));
    }

    #[tokio::test]
    async fn ensure_pairs_adds_cross_pairs() {
        let db = Database::open_in_memory().unwrap();
        let catalog = PairCatalog::new(db).await.unwrap();
        catalog.ensure_pairs(&cross_pairs()).await.unwrap();
        let pairs = catalog.pairs_for_exchange("binance", true).await.unwrap();
        assert!(pairs.iter().any(|p| p.symbol == "ETH/BTC"));
    }
}
