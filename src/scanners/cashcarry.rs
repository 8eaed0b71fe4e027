//! Cash-and-carry (spot/perp basis) scanner.
//!
//! For every USDT-quoted symbol with both legs priced, the scan computes the
//! basis in each direction plus the funding carry over the configured horizon
//! and emits directions whose net profit clears the threshold. Basis outliers
//! beyond 10% are rejected as bad data.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::config::{env_parse, PairCatalog};
use crate::marketdata::MarketDataRepository;
use crate::models::{AccountType, BestBidAsk, CashCarryDirection, FundingInfo, Opportunity, OrderBookTob};
use crate::store::{keys, KvStore};
use crate::util::{now_ms, StopSignal};

const MAX_ABS_BASIS: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct CashCarrySettings {
    pub exchange_id: String,
    pub quote_currency: String,
    pub min_profit_rate: f64,
    pub spot_fee_rate: f64,
    pub perp_fee_rate: f64,
    pub funding_horizon_intervals: u32,
    pub refresh_interval: Duration,
    pub ttl: Duration,
    pub max_opportunities: usize,
    pub max_symbols: usize,
    pub concurrency: usize,
}

impl CashCarrySettings {
    pub fn from_env() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            quote_currency: "USDT".to_string(),
            min_profit_rate: env_parse("CASHCARRY_MIN_PROFIT_RATE", 0.001f64),
            spot_fee_rate: env_parse("CASHCARRY_SPOT_FEE_RATE", 0.0004f64),
            perp_fee_rate: env_parse("CASHCARRY_PERP_FEE_RATE", 0.0004f64),
            funding_horizon_intervals: env_parse("CASHCARRY_FUNDING_HORIZON", 3u32),
            refresh_interval: Duration::from_secs_f64(
                env_parse("CASHCARRY_REFRESH_INTERVAL", 2.0f64).max(0.1),
            ),
            ttl: Duration::from_secs(10),
            max_opportunities: 50,
            max_symbols: 200,
            concurrency: env_parse("CASHCARRY_CONCURRENCY", 50usize).max(1),
        }
    }
}

struct SymbolLegs {
    symbol: String,
    spot: BestBidAsk,
    perp: BestBidAsk,
    funding: FundingInfo,
    tob: OrderBookTob,
}

pub struct CashCarryScanner {
    repo: Arc<MarketDataRepository>,
    kv: Arc<dyn KvStore>,
    catalog: Arc<PairCatalog>,
    settings: CashCarrySettings,
    last_log_ms: i64,
    last_count: Option<usize>,
}

impl CashCarryScanner {
    pub fn new(
        repo: Arc<MarketDataRepository>,
        kv: Arc<dyn KvStore>,
        catalog: Arc<PairCatalog>,
        settings: CashCarrySettings,
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
        info!(exchange = %self.settings.exchange_id, "cash-and-carry scanner starting");
        while !stop.is_stopped() {
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "cash-and-carry scan error");
            }
            if stop.sleep(self.settings.refresh_interval).await {
                return;
            }
        }
    }

    pub async fn scan_once(&mut self) -> Result<()> {
        let start = now_ms();
        let symbols = self.select_symbols().await?;

        let repo = self.repo.clone();
        let exchange_id = self.settings.exchange_id.clone();
        let legs: Vec<SymbolLegs> = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let repo = repo.clone();
                let exchange_id = exchange_id.clone();
                async move {
                    let spot = repo
                        .get_best_bid_ask(&exchange_id, &symbol, AccountType::Spot)
                        .await
                        .ok()?;
                    let perp = repo
                        .get_best_bid_ask(&exchange_id, &symbol, AccountType::Perp)
                        .await
                        .ok()?;
                    let funding = repo.get_funding(&exchange_id, &symbol).await.ok()?;
                    let tob = repo.get_orderbook_tob(&exchange_id, &symbol).await.ok()?;
                    Some(SymbolLegs {
                        symbol,
                        spot,
                        perp,
                        funding,
                        tob,
                    })
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .filter_map(|item| async move { item })
            .collect()
            .await;

        let now = now_ms();
        let mut opportunities: Vec<Opportunity> = Vec::new();
        for leg in &legs {
            self.evaluate_symbol(leg, now, &mut opportunities);
        }
        opportunities.sort_by(|a, b| b.profit_rate().total_cmp(&a.profit_rate()));

        let mut members = Vec::new();
        for opp in opportunities.iter().take(self.settings.max_opportunities) {
            members.push((serde_json::to_string(opp)?, opp.profit_rate()));
        }
        self.kv
            .replace_zset(
                keys::OPPORTUNITIES_CASHCARRY,
                &members,
                Some(self.settings.ttl),
            )
            .await?;

        let elapsed = now_ms() - start;
        let count = opportunities.len();
        if now_ms() - self.last_log_ms >= 10_000 || self.last_count != Some(count) {
            info!(
                symbols = symbols.len(),
                opportunities = count,
                elapsed_ms = elapsed,
                "cash-and-carry scan complete"
            );
            self.last_log_ms = now_ms();
            self.last_count = Some(count);
        }

        self.kv
            .hset(
                &keys::metrics("cashcarry_service"),
                &[
                    ("last_scan_ms".to_string(), elapsed.to_string()),
                    ("symbols".to_string(), symbols.len().to_string()),
                    ("opportunities".to_string(), count.to_string()),
                    ("timestamp_ms".to_string(), now_ms().to_string()),
                ],
                Some(Duration::from_secs(120)),
            )
            .await?;
        Ok(())
    }

    /// Configured pairs first, padded from the ingestor's funding and futures
    /// index sets when too few are quoted against the target currency.
    async fn select_symbols(&self) -> Result<Vec<String>> {
        let suffix = format!("/{}", self.settings.quote_currency);
        let pairs = self
            .catalog
            .pairs_for_exchange(&self.settings.exchange_id, true)
            .await?;
        let mut symbols: Vec<String> = pairs
            .into_iter()
            .filter(|p| p.quote == self.settings.quote_currency)
            .map(|p| p.symbol)
            .collect();
        let mut seen: HashSet<String> = symbols.iter().cloned().collect();

        for namespace in ["funding", "ticker_futures"] {
            if symbols.len() >= 50 {
                break;
            }
            let indexed = self
                .kv
                .smembers(&keys::symbol_index(namespace, &self.settings.exchange_id))
                .await?;
            for sym in indexed {
                if symbols.len() >= self.settings.max_symbols {
                    break;
                }
                if !sym.ends_with(&suffix) || seen.contains(&sym) {
                    continue;
                }
                seen.insert(sym.clone());
                symbols.push(sym);
            }
        }
        Ok(symbols)
    }

    fn evaluate_symbol(&self, leg: &SymbolLegs, now: i64, out: &mut Vec<Opportunity>) {
        let dec = |d: Option<rust_decimal::Decimal>| d.and_then(|v| v.to_f64());

        let spot_bid = dec(leg.tob.best_bid_price)
            .or(dec(leg.spot.bid))
            .or(dec(leg.spot.last));
        let spot_ask = dec(leg.tob.best_ask_price)
            .or(dec(leg.spot.ask))
            .or(dec(leg.spot.last));
        let perp_bid = dec(leg.perp.bid).or(dec(leg.perp.last));
        let perp_ask = dec(leg.perp.ask).or(dec(leg.perp.last));

        let funding_rate = dec(leg.funding.rate).unwrap_or(0.0)
            * f64::from(self.settings.funding_horizon_intervals);
        let fee_cost = self.settings.spot_fee_rate + self.settings.perp_fee_rate;

        // Long basis: buy spot at the ask, short perp at the bid. Positive
        // funding pays the short leg over the horizon.
        if let (Some(spot_ask), Some(perp_bid)) = (spot_ask, perp_bid) {
            if spot_ask != 0.0 {
                let basis_rate = (perp_bid - spot_ask) / spot_ask;
                if basis_rate.abs() <= MAX_ABS_BASIS {
                    let profit_rate = basis_rate + funding_rate - fee_cost;
                    if profit_rate >= self.settings.min_profit_rate {
                        out.push(Opportunity::CashCarry {
                            exchange: self.settings.exchange_id.clone(),
                            symbol: leg.symbol.clone(),
                            direction: CashCarryDirection::LongSpotShortPerp,
                            spot_ask: Some(spot_ask),
                            perp_bid: Some(perp_bid),
                            spot_bid: None,
                            perp_ask: None,
                            spot_price: spot_ask,
                            perp_price: perp_bid,
                            basis_rate,
                            funding_rate,
                            profit_rate,
                            timestamp: now,
                        });
                    }
                }
            }
        }

        // Reverse basis: sell spot at the bid, long perp at the ask. Negative
        // funding pays the long leg.
        if let (Some(spot_bid), Some(perp_ask)) = (spot_bid, perp_ask) {
            if spot_bid != 0.0 {
                let basis_rate = (perp_ask - spot_bid) / spot_bid;
                if basis_rate.abs() <= MAX_ABS_BASIS {
                    let profit_rate = -basis_rate - funding_rate - fee_cost;
                    if profit_rate >= self.settings.min_profit_rate {
                        out.push(Opportunity::CashCarry {
                            exchange: self.settings.exchange_id.clone(),
                            symbol: leg.symbol.clone(),
                            direction: CashCarryDirection::ShortSpotLongPerp,
                            spot_ask: None,
                            perp_bid: None,
                            spot_bid: Some(spot_bid),
                            perp_ask: Some(perp_ask),
                            spot_price: spot_bid,
                            perp_price: perp_ask,
                            basis_rate,
                            funding_rate,
                            profit_rate,
                            timestamp: now,
                        });
                    }
                }
            }
        }
    }
}
