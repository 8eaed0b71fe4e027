//! Market regime classification from rolling mid-price samples.
//!
//! Keeps a bounded price history per symbol and classifies the market into
//! RANGE / UPTREND / DOWNTREND / STRESS from average return, volatility of
//! consecutive returns, average spread, and data age. Refreshes inside the
//! minimum sample interval reuse the cached snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::config::{env_parse, PairCatalog};
use crate::marketdata::MarketDataRepository;
use crate::models::{AccountType, MarketRegime};
use crate::store::{keys, KvStore};
use crate::util::now_ms;

#[derive(Debug, Clone)]
pub struct RegimeSettings {
    pub exchange_id: String,
    pub window_size: usize,
    pub min_interval_ms: i64,
    pub min_points: usize,
    pub trend_threshold: f64,
    pub vol_high: f64,
    pub vol_stress: f64,
    pub spread_stress: f64,
    pub max_data_age_ms: i64,
    pub max_symbols: usize,
    pub concurrency: usize,
}

impl RegimeSettings {
    pub fn from_env() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            window_size: env_parse("MARKET_REGIME_WINDOW", 60usize).max(2),
            min_interval_ms: env_parse("MARKET_REGIME_SAMPLE_INTERVAL_MS", 2000i64),
            min_points: env_parse("MARKET_REGIME_MIN_POINTS", 5usize).max(2),
            trend_threshold: env_parse("MARKET_REGIME_TREND_THRESHOLD", 0.01f64),
            vol_high: env_parse("MARKET_REGIME_VOL_HIGH", 0.008f64),
            vol_stress: env_parse("MARKET_REGIME_VOL_STRESS", 0.02f64),
            spread_stress: env_parse("MARKET_REGIME_SPREAD_STRESS", 0.004f64),
            max_data_age_ms: env_parse("MARKET_REGIME_MAX_DATA_AGE_MS", 15000i64),
            max_symbols: env_parse("MARKET_REGIME_SYMBOL_LIMIT", 8usize).max(1),
            concurrency: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegimeSnapshot {
    pub regime: MarketRegime,
    pub timestamp_ms: i64,
    pub avg_return: f64,
    pub volatility: f64,
    pub avg_spread_rate: f64,
    pub avg_volume: f64,
    pub avg_data_age_ms: i64,
    pub sample_count: usize,
    pub symbols: Vec<String>,
}

impl MarketRegimeSnapshot {
    fn empty(now: i64) -> Self {
        Self {
            regime: MarketRegime::Unknown,
            timestamp_ms: now,
            avg_return: 0.0,
            volatility: 0.0,
            avg_spread_rate: 0.0,
            avg_volume: 0.0,
            avg_data_age_ms: 0,
            sample_count: 0,
            symbols: Vec::new(),
        }
    }
}

pub struct MarketRegimeService {
    repo: Arc<MarketDataRepository>,
    kv: Arc<dyn KvStore>,
    catalog: Arc<PairCatalog>,
    settings: RegimeSettings,
    history: HashMap<String, VecDeque<f64>>,
    last_refresh_ms: i64,
    last_snapshot: Option<MarketRegimeSnapshot>,
}

impl MarketRegimeService {
    pub fn new(
        repo: Arc<MarketDataRepository>,
        kv: Arc<dyn KvStore>,
        catalog: Arc<PairCatalog>,
        settings: RegimeSettings,
    ) -> Self {
        Self {
            repo,
            kv,
            catalog,
            settings,
            history: HashMap::new(),
            last_refresh_ms: 0,
            last_snapshot: None,
        }
    }

    pub async fn refresh(&mut self, symbols: Option<&[String]>) -> Result<MarketRegimeSnapshot> {
        let now = now_ms();
        if let Some(snapshot) = &self.last_snapshot {
            if now - self.last_refresh_ms < self.settings.min_interval_ms {
                return Ok(snapshot.clone());
            }
        }

        let resolved = self.resolve_symbols(symbols).await;
        if resolved.is_empty() {
            let snapshot = MarketRegimeSnapshot::empty(now);
            self.last_snapshot = Some(snapshot.clone());
            self.last_refresh_ms = now;
            return Ok(snapshot);
        }

        let repo = self.repo.clone();
        let exchange_id = self.settings.exchange_id.clone();
        let samples: Vec<(String, Option<f64>, Option<i64>, Option<f64>, Option<f64>)> =
            stream::iter(resolved.iter().cloned())
                .map(|symbol| {
                    let repo = repo.clone();
                    let exchange_id = exchange_id.clone();
                    async move {
                        let bba = repo
                            .get_best_bid_ask(&exchange_id, &symbol, AccountType::Spot)
                            .await
                            .unwrap_or_default();
                        let mid = bba.mid().and_then(|d| d.to_f64());
                        let spread = bba.spread_rate();
                        let volume = bba.volume.and_then(|d| d.to_f64());
                        (symbol, mid, bba.timestamp, spread, volume)
                    }
                })
                .buffer_unordered(self.settings.concurrency)
                .collect()
                .await;

        let mut spreads = Vec::new();
        let mut volumes = Vec::new();
        let mut ages = Vec::new();
        let sample_count = samples.len();
        for (symbol, mid, ts, spread, volume) in samples {
            let Some(mid) = mid.filter(|m| *m > 0.0) else {
                continue;
            };
            self.push_history(&symbol, mid);
            if let Some(s) = spread {
                spreads.push(s);
            }
            if let Some(v) = volume {
                volumes.push(v);
            }
            if let Some(ts) = ts {
                ages.push((now - ts).max(0));
            }
        }

        let avg_spread = mean(&spreads);
        let avg_volume = mean(&volumes);
        let avg_age = if ages.is_empty() {
            0
        } else {
            ages.iter().sum::<i64>() / ages.len() as i64
        };

        let (avg_return, volatility) = self.return_and_volatility();
        let regime = self.classify(avg_return, volatility, avg_spread, avg_age);

        let snapshot = MarketRegimeSnapshot {
            regime,
            timestamp_ms: now,
            avg_return,
            volatility,
            avg_spread_rate: avg_spread,
            avg_volume,
            avg_data_age_ms: avg_age,
            sample_count,
            symbols: resolved,
        };
        self.last_snapshot = Some(snapshot.clone());
        self.last_refresh_ms = now;

        let metrics = [
            ("regime".to_string(), snapshot.regime.as_str().to_string()),
            ("avg_return".to_string(), snapshot.avg_return.to_string()),
            ("volatility".to_string(), snapshot.volatility.to_string()),
            (
                "avg_spread_rate".to_string(),
                snapshot.avg_spread_rate.to_string(),
            ),
            ("avg_volume".to_string(), snapshot.avg_volume.to_string()),
            (
                "avg_data_age_ms".to_string(),
                snapshot.avg_data_age_ms.to_string(),
            ),
            (
                "sample_count".to_string(),
                snapshot.sample_count.to_string(),
            ),
            ("timestamp_ms".to_string(), snapshot.timestamp_ms.to_string()),
        ];
        if let Err(e) = self
            .kv
            .hset(
                &keys::metrics("market_regime"),
                &metrics,
                Some(Duration::from_secs(120)),
            )
            .await
        {
            tracing::debug!(error = %e, "failed to publish regime metrics");
        }

        Ok(snapshot)
    }

    async fn resolve_symbols(&self, symbols: Option<&[String]>) -> Vec<String> {
        let mut resolved: Vec<String> = symbols
            .map(|s| s.iter().filter(|s| !s.is_empty()).cloned().collect())
            .unwrap_or_default();
        if resolved.is_empty() {
            if let Ok(env_symbols) = std::env::var("MARKET_REGIME_SYMBOLS") {
                resolved = env_symbols
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
        }
        if resolved.is_empty() {
            resolved = self
                .catalog
                .pairs_for_exchange(&self.settings.exchange_id, true)
                .await
                .map(|pairs| {
                    pairs
                        .into_iter()
                        .filter(|p| p.symbol.ends_with("/USDT"))
                        .map(|p| p.symbol)
                        .collect()
                })
                .unwrap_or_default();
        }
        if resolved.is_empty() {
            resolved = vec![
                "BTC/USDT".to_string(),
                "ETH/USDT".to_string(),
                "BNB/USDT".to_string(),
            ];
        }
        resolved.truncate(self.settings.max_symbols);
        resolved
    }

    fn push_history(&mut self, symbol: &str, price: f64) {
        let history = self
            .history
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.settings.window_size));
        if history.len() == self.settings.window_size {
            history.pop_front();
        }
        history.push_back(price);
    }

    /// Average full-window return per symbol, and the standard deviation of
    /// consecutive returns pooled across all symbols.
    fn return_and_volatility(&self) -> (f64, f64) {
        let mut returns = Vec::new();
        let mut vol_samples = Vec::new();
        for prices in self.history.values() {
            if prices.len() < self.settings.min_points {
                continue;
            }
            let first = prices.front().copied().unwrap_or(0.0);
            let last = prices.back().copied().unwrap_or(0.0);
            if first > 0.0 {
                returns.push((last - first) / first);
            }
            let mut prev = first;
            for price in prices.iter().skip(1) {
                if prev > 0.0 && *price > 0.0 {
                    vol_samples.push((price - prev) / prev);
                }
                prev = *price;
            }
        }
        (mean(&returns), std_dev(&vol_samples))
    }

    fn classify(
        &self,
        avg_return: f64,
        volatility: f64,
        avg_spread: f64,
        avg_age: i64,
    ) -> MarketRegime {
        let s = &self.settings;
        if avg_age > s.max_data_age_ms || avg_spread > s.spread_stress {
            return MarketRegime::Stress;
        }
        if volatility >= s.vol_stress {
            return MarketRegime::Stress;
        }
        if avg_return.abs() >= s.trend_threshold && volatility >= s.vol_high {
            return if avg_return > 0.0 {
                MarketRegime::Uptrend
            } else {
                MarketRegime::Downtrend
            };
        }
        MarketRegime::Range
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
