//! Triangular arbitrage scanner.
//!
//! Builds a directed currency graph from top-of-book each scan: selling the
//! base of `BASE/QUOTE` traverses `BASE -> QUOTE` at the bid, buying traverses
//! `QUOTE -> BASE` at `1/ask`. Cycles of length three through the base
//! currency are ranked by profit net of three taker fees and the whole ranked
//! set replaces `opportunities:triangular` atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::config::{cross_pairs, env_parse, PairCatalog, TradingPair};
use crate::marketdata::MarketDataRepository;
use crate::models::Opportunity;
use crate::store::{keys, KvStore};
use crate::util::{now_ms, StopSignal};

#[derive(Debug, Clone)]
pub struct TriangularSettings {
    pub exchange_id: String,
    pub base_currency: String,
    pub min_profit_rate: f64,
    pub fee_rate: f64,
    pub refresh_interval: Duration,
    pub ttl: Duration,
    pub max_opportunities: usize,
    pub concurrency: usize,
}

impl TriangularSettings {
    pub fn from_env() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            base_currency: "USDT".to_string(),
            min_profit_rate: env_parse("TRIANGULAR_MIN_PROFIT_RATE", 0.001f64),
            fee_rate: env_parse("TRIANGULAR_FEE_RATE", 0.0004f64),
            refresh_interval: Duration::from_secs_f64(
                env_parse("TRIANGULAR_REFRESH_INTERVAL", 2.0f64).max(0.1),
            ),
            ttl: Duration::from_secs(10),
            max_opportunities: 50,
            concurrency: env_parse("TRIANGULAR_CONCURRENCY", 50usize).max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Edge {
    symbol: String,
    rate: f64,
}

pub struct TriangularScanner {
    repo: Arc<MarketDataRepository>,
    kv: Arc<dyn KvStore>,
    catalog: Arc<PairCatalog>,
    settings: TriangularSettings,
    last_log_ms: i64,
    last_count: Option<usize>,
}

impl TriangularScanner {
    pub fn new(
        repo: Arc<MarketDataRepository>,
        kv: Arc<dyn KvStore>,
        catalog: Arc<PairCatalog>,
        settings: TriangularSettings,
    ) -> Self {
        Self {
            repo,
            kv,
            catalog,
            settings,
            last_log_ms: 0,
            last_count: None,
        }
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        if let Err(e) = self.catalog.ensure_pairs(&cross_pairs()).await {
            warn!(error = %e, "seeding cross pairs failed");
        }
        info!(exchange = %self.settings.exchange_id, "triangular scanner starting");
        while !stop.is_stopped() {
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "triangular scan error");
            }
            if stop.sleep(self.settings.refresh_interval).await {
                return;
            }
        }
    }

    pub async fn scan_once(&mut self) -> Result<()> {
        let start = now_ms();
        let pairs = self
            .catalog
            .pairs_for_exchange(&self.settings.exchange_id, true)
            .await?;

        let edges = self.build_edges(&pairs).await;
        let opportunities = self.find_triangles(&edges);

        let mut members = Vec::new();
        for opp in &opportunities {
            if opp.profit_rate() < self.settings.min_profit_rate {
                continue;
            }
            members.push((serde_json::to_string(opp)?, opp.profit_rate()));
            if members.len() >= self.settings.max_opportunities {
                break;
            }
        }
        self.kv
            .replace_zset(
                keys::OPPORTUNITIES_TRIANGULAR,
                &members,
                Some(self.settings.ttl),
            )
            .await?;

        let elapsed = now_ms() - start;
        let count = opportunities.len();
        if now_ms() - self.last_log_ms >= 10_000 || self.last_count != Some(count) {
            info!(
                pairs = pairs.len(),
                opportunities = count,
                elapsed_ms = elapsed,
                "triangular scan complete"
            );
            self.last_log_ms = now_ms();
            self.last_count = Some(count);
        }

        self.kv
            .hset(
                &keys::metrics("triangular_service"),
                &[
                    ("last_scan_ms".to_string(), elapsed.to_string()),
                    ("pairs".to_string(), pairs.len().to_string()),
                    ("opportunities".to_string(), count.to_string()),
                    ("timestamp_ms".to_string(), now_ms().to_string()),
                ],
                Some(Duration::from_secs(120)),
            )
            .await?;
        Ok(())
    }

    /// `edges[u][v]` converts one unit of `u` into `rate` units of `v`,
    /// fees excluded. Missing book sides simply omit the edge.
    async fn build_edges(
        &self,
        pairs: &[TradingPair],
    ) -> HashMap<String, HashMap<String, Edge>> {
        let repo = self.repo.clone();
        let exchange_id = self.settings.exchange_id.clone();
        let tobs: Vec<(TradingPair, crate::models::OrderBookTob)> =
            stream::iter(pairs.iter().cloned())
                .map(|pair| {
                    let repo = repo.clone();
                    let exchange_id = exchange_id.clone();
                    async move {
                        match repo.get_orderbook_tob(&exchange_id, &pair.symbol).await {
                            Ok(tob) => Some((pair, tob)),
                            Err(_) => None,
                        }
                    }
                })
                .buffer_unordered(self.settings.concurrency)
                .filter_map(|item| async move { item })
                .collect()
                .await;

        let mut edges: HashMap<String, HashMap<String, Edge>> = HashMap::new();
        for (pair, tob) in tobs {
            if let Some(bid) = tob.best_bid_price.and_then(|d| d.to_f64()) {
                if bid > 0.0 {
                    edges.entry(pair.base.clone()).or_default().insert(
                        pair.quote.clone(),
                        Edge {
                            symbol: pair.symbol.clone(),
                            rate: bid,
                        },
                    );
                }
            }
            if let Some(ask) = tob.best_ask_price.and_then(|d| d.to_f64()) {
                if ask > 0.0 {
                    edges.entry(pair.quote.clone()).or_default().insert(
                        pair.base.clone(),
                        Edge {
                            symbol: pair.symbol.clone(),
                            rate: 1.0 / ask,
                        },
                    );
                }
            }
        }
        edges
    }

    fn find_triangles(&self, edges: &HashMap<String, HashMap<String, Edge>>) -> Vec<Opportunity> {
        let base = &self.settings.base_currency;
        let Some(first_hops) = edges.get(base) else {
            return Vec::new();
        };

        let now = now_ms();
        let fee_mul = (1.0 - self.settings.fee_rate).powi(3);
        let mut opportunities = Vec::new();

        for (c1, e1) in first_hops {
            let Some(second_hops) = edges.get(c1) else {
                continue;
            };
            for (c2, e2) in second_hops {
                if c2 == base {
                    continue;
                }
                let Some(e3) = edges.get(c2).and_then(|m| m.get(base)) else {
                    continue;
                };

                let rate = e1.rate * e2.rate * e3.rate * fee_mul;
                opportunities.push(Opportunity::Triangular {
                    exchange: self.settings.exchange_id.clone(),
                    path: format!("{base} -> {c1} -> {c2} -> {base}"),
                    symbols: vec![e1.symbol.clone(), e2.symbol.clone(), e3.symbol.clone()],
                    profit_rate: rate - 1.0,
                    timestamp: now,
                });
            }
        }

        opportunities.sort_by(|a, b| b.profit_rate().total_cmp(&a.profit_rate()));
        opportunities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, MemoryKv};

    async fn seed_tob(kv: &Arc<dyn KvStore>, symbol: &str, bid: f64, ask: f64) {
        kv.replace_zset(
            &keys::orderbook_bids("binance", symbol),
            &[(format!("{bid}:1"), bid)],
            None,
        )
        .await
        .unwrap();
        kv.replace_zset(
            &keys::orderbook_asks("binance", symbol),
            &[(format!("{ask}:1"), ask)],
            None,
        )
        .await
        .unwrap();
        kv.set(
            &keys::orderbook_ts("binance", symbol),
            &now_ms().to_string(),
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn finds_the_seeded_cycle_with_expected_profit() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let db = Database::open_in_memory().unwrap();
        let catalog = PairCatalog::new(db).await.unwrap();
        catalog
            .ensure_pairs(&[TradingPair::new("ETH/BTC", "ETH", "BTC", &["binance"])])
            .await
            .unwrap();

        seed_tob(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        seed_tob(&kv, "ETH/USDT", 3000.0, 3001.0).await;
        seed_tob(&kv, "ETH/BTC", 0.0501, 0.0502).await;

        let repo = MarketDataRepository::new(kv.clone());
        let mut settings = TriangularSettings::from_env();
        settings.min_profit_rate = 0.0005;
        settings.fee_rate = 0.0004;
        let mut scanner = TriangularScanner::new(repo, kv.clone(), catalog, settings);
        scanner.scan_once().await.unwrap();

        let members = kv
            .zrevrange_withscores(keys::OPPORTUNITIES_TRIANGULAR, 0, -1)
            .await
            .unwrap();
        assert!(!members.is_empty());

        let best: Opportunity = serde_json::from_str(&members[0].0).unwrap();
        let Opportunity::Triangular {
            path,
            symbols,
            profit_rate,
            ..
        } = &best
        else {
            panic!("expected triangular opportunity");
        };
        // Profitable direction: buy ETH with USDT at the ask, sell ETH into
        // BTC at the bid, sell BTC back to USDT at the bid.
        assert_eq!(path, "USDT -> ETH -> BTC -> USDT");
        assert_eq!(
            symbols,
            &vec![
                "ETH/USDT".to_string(),
                "ETH/BTC".to_string(),
                "BTC/USDT".to_string()
            ]
        );
        let expected = (1.0 / 3001.0) * 0.0501 * 60000.0 * (1.0f64 - 0.0004).powi(3) - 1.0;
        assert!((profit_rate - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn below_threshold_cycles_are_not_published() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let db = Database::open_in_memory().unwrap();
        let catalog = PairCatalog::new(db).await.unwrap();
        catalog
            .ensure_pairs(&[TradingPair::new("ETH/BTC", "ETH", "BTC", &["binance"])])
            .await
            .unwrap();

        // Flat prices: every cycle loses the fee.
        seed_tob(&kv, "BTC/USDT", 60000.0, 60000.0).await;
        seed_tob(&kv, "ETH/USDT", 3000.0, 3000.0).await;
        seed_tob(&kv, "ETH/BTC", 0.05, 0.05).await;

        let repo = MarketDataRepository::new(kv.clone());
        let mut settings = TriangularSettings::from_env();
        settings.min_profit_rate = 0.0005;
        let mut scanner = TriangularScanner::new(repo, kv.clone(), catalog, settings);
        scanner.scan_once().await.unwrap();

        let members = kv
            .zrevrange_withscores(keys::OPPORTUNITIES_TRIANGULAR, 0, -1)
            .await
            .unwrap();
        assert!(members.is_empty());
    }
}
