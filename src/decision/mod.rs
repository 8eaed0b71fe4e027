//! Decision service: consumes both opportunity streams, applies human
//! constraints plus the regime-aware auto overlay and per-strategy routing,
//! deduplicates per base currency, and publishes the ranked decision set.

pub mod constraints;
pub mod routing;

pub use constraints::{AutoOverlay, ConstraintsHandle, EffectiveConstraints, RiskConstraints};
pub use routing::{RoutingTable, StrategyRouting};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::env_parse;
use crate::marketdata::MarketDataRepository;
use crate::models::{AccountType, Decision, MarketRegime, Opportunity, StrategyType};
use crate::regime::MarketRegimeService;
use crate::store::{keys, Database, KvStore};
use crate::util::{base_currency, now_ms, StopSignal};

#[derive(Debug, Clone)]
pub struct DecisionSettings {
    pub exchange_id: String,
    pub refresh_interval: Duration,
    pub ttl: Duration,
    pub max_decisions: usize,
    pub concurrency: usize,
    pub auto_overlay_interval_ms: i64,
    pub routing_cache_ttl_ms: i64,
}

impl DecisionSettings {
    pub fn from_env() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            refresh_interval: Duration::from_secs_f64(
                env_parse("DECISION_REFRESH_INTERVAL", 2.0f64).max(0.1),
            ),
            ttl: Duration::from_secs(10),
            max_decisions: 10,
            concurrency: env_parse("DECISION_CONCURRENCY", 20usize).max(1),
            auto_overlay_interval_ms: env_parse("DECISION_AUTO_OVERLAY_INTERVAL_MS", 2000i64),
            routing_cache_ttl_ms: env_parse("DECISION_ROUTING_CACHE_TTL_MS", 10_000i64),
        }
    }
}

pub struct DecisionService {
    kv: Arc<dyn KvStore>,
    repo: Arc<MarketDataRepository>,
    regime: MarketRegimeService,
    constraints: ConstraintsHandle,
    routing: RoutingTable,
    settings: DecisionSettings,
    auto_overlay: AutoOverlay,
    last_log_ms: i64,
    last_count: Option<usize>,
}

impl DecisionService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        repo: Arc<MarketDataRepository>,
        db: Database,
        regime: MarketRegimeService,
        constraints: ConstraintsHandle,
        settings: DecisionSettings,
    ) -> Self {
        let routing = RoutingTable::new(db, settings.routing_cache_ttl_ms);
        Self {
            kv,
            repo,
            regime,
            constraints,
            routing,
            settings,
            auto_overlay: AutoOverlay::default(),
            last_log_ms: 0,
            last_count: None,
        }
    }

    pub fn constraints_handle(&self) -> ConstraintsHandle {
        self.constraints.clone()
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        info!(exchange = %self.settings.exchange_id, "decision service starting");
        while !stop.is_stopped() {
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "decision scan error");
            }
            if stop.sleep(self.settings.refresh_interval).await {
                return;
            }
        }
    }

    pub async fn scan_once(&mut self) -> Result<()> {
        let start = now_ms();
        let tri_raw = self
            .kv
            .zrevrange_withscores(keys::OPPORTUNITIES_TRIANGULAR, 0, -1)
            .await?;
        let cc_raw = self
            .kv
            .zrevrange_withscores(keys::OPPORTUNITIES_CASHCARRY, 0, -1)
            .await?;

        let parse = |raw: &[(String, f64)]| -> Vec<Opportunity> {
            raw.iter()
                .filter_map(|(member, _)| serde_json::from_str(member).ok())
                .collect()
        };
        let tri = parse(&tri_raw);
        let cc = parse(&cc_raw);

        self.refresh_auto_overlay(&tri, &cc).await;
        self.routing.refresh().await;

        let constraints = self.constraints.get();
        let mut candidates = Vec::new();
        for opp in tri.iter().chain(cc.iter()) {
            if let Some(decision) = self.evaluate(opp, &constraints).await {
                candidates.push(decision);
            }
        }

        let decisions = self.apply_global_constraints(candidates, &constraints);

        let mut members = Vec::new();
        for d in decisions.iter().take(self.settings.max_decisions) {
            members.push((serde_json::to_string(d)?, d.risk_score));
        }
        self.kv
            .replace_zset(keys::DECISIONS_LATEST, &members, Some(self.settings.ttl))
            .await?;
        self.kv
            .set(
                keys::CONSTRAINTS_AUTO,
                &serde_json::to_string(&self.auto_overlay)?,
                None,
            )
            .await?;
        let effective = constraints::effective_snapshot(&constraints, &self.auto_overlay);
        self.kv
            .set(
                keys::CONSTRAINTS_EFFECTIVE,
                &serde_json::to_string(&effective)?,
                None,
            )
            .await?;

        let elapsed = now_ms() - start;
        let count = decisions.len();
        if now_ms() - self.last_log_ms >= 10_000 || self.last_count != Some(count) {
            info!(decisions = count, elapsed_ms = elapsed, "decision scan complete");
            self.last_log_ms = now_ms();
            self.last_count = Some(count);
        }
        self.kv
            .hset(
                &keys::metrics("decision_service"),
                &[
                    ("last_scan_ms".to_string(), elapsed.to_string()),
                    ("decision_count".to_string(), count.to_string()),
                    ("timestamp_ms".to_string(), now_ms().to_string()),
                ],
                Some(Duration::from_secs(120)),
            )
            .await?;
        Ok(())
    }

    /// Bounded to one refresh per overlay interval; measures data quality over
    /// the first ~30 symbols across both streams and folds in the regime.
    async fn refresh_auto_overlay(&mut self, tri: &[Opportunity], cc: &[Opportunity]) {
        let now = now_ms();
        if self.auto_overlay.timestamp_ms != 0
            && now - self.auto_overlay.timestamp_ms < self.settings.auto_overlay_interval_ms
        {
            return;
        }

        let mut symbols: Vec<String> = Vec::new();
        for opp in tri.iter().take(20) {
            for s in opp.symbols().into_iter().take(3) {
                if s.ends_with("/USDT") && !symbols.contains(&s) {
                    symbols.push(s);
                }
            }
        }
        for opp in cc.iter().take(20) {
            if let Opportunity::CashCarry { symbol, .. } = opp {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                }
            }
        }
        symbols.truncate(30);

        if symbols.is_empty() {
            self.auto_overlay = AutoOverlay {
                timestamp_ms: now,
                ..AutoOverlay::default()
            };
            return;
        }

        let repo = self.repo.clone();
        let exchange_id = self.settings.exchange_id.clone();
        let metrics: Vec<(String, Option<i64>, Option<f64>, bool)> =
            stream::iter(symbols.iter().cloned())
                .map(|symbol| {
                    let repo = repo.clone();
                    let exchange_id = exchange_id.clone();
                    async move {
                        let base = base_currency(&symbol);
                        let tob = repo
                            .get_orderbook_tob(&exchange_id, &symbol)
                            .await
                            .unwrap_or_default();
                        let mut age_ms = tob.timestamp_ms.map(|ts| (now - ts).max(0));
                        let bba = repo
                            .get_best_bid_ask(&exchange_id, &symbol, AccountType::Spot)
                            .await
                            .unwrap_or_default();
                        if age_ms.is_none_or(|a| a > 60_000) {
                            if let Some(ts) = bba.timestamp {
                                age_ms = Some((now - ts).max(0));
                            }
                        }
                        let spread = bba.spread_rate();
                        let liquidity_low = bba
                            .volume
                            .and_then(|v| v.to_f64())
                            .map(|v| (v / 1.0e8).clamp(0.0, 1.0) < 0.05)
                            .unwrap_or(false);
                        (base, age_ms, spread, liquidity_low)
                    }
                })
                .buffer_unordered(self.settings.concurrency)
                .collect()
                .await;

        let mut ages = Vec::new();
        let mut spreads = Vec::new();
        let mut low_liq = BTreeSet::new();
        for (base, age, spread, liquidity_low) in metrics {
            if let Some(age) = age.filter(|a| *a <= 60_000) {
                ages.push(age);
            }
            if let Some(spread) = spread {
                spreads.push(spread);
            }
            if liquidity_low {
                low_liq.insert(base);
            }
        }
        let avg_age = if ages.is_empty() {
            0
        } else {
            ages.iter().sum::<i64>() / ages.len() as i64
        };
        let avg_spread = if spreads.is_empty() {
            0.0
        } else {
            spreads.iter().sum::<f64>() / spreads.len() as f64
        };

        let regime_snapshot = match self.regime.refresh(Some(symbols.as_slice())).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "regime refresh failed");
                return;
            }
        };

        let constraints = self.constraints.get();
        self.auto_overlay = compute_overlay(
            &constraints,
            now,
            avg_age,
            avg_spread,
            low_liq,
            regime_snapshot,
        );
    }

    async fn evaluate(
        &self,
        opp: &Opportunity,
        constraints: &RiskConstraints,
    ) -> Option<Decision> {
        let main_symbol = opp.main_symbol()?;
        let base = base_currency(&main_symbol);

        if !self.check_symbol_constraints(&base, constraints) {
            return None;
        }

        let profit_rate = opp.profit_rate();
        let effective_min =
            constraints::effective_min_profit_rate(constraints, &self.auto_overlay)
                .to_f64()
                .unwrap_or(0.0);
        if profit_rate < effective_min {
            return None;
        }

        // Nominal sizing until a funding model lands; the overlay multiplier
        // still shrinks the ceiling it is checked against.
        let estimated_exposure = Decimal::from(1000);
        let effective_max =
            constraints::effective_max_exposure(constraints, &self.auto_overlay);
        if estimated_exposure > effective_max {
            return None;
        }

        let symbols = opp.symbols();
        let confidence = self.calculate_confidence(&symbols, profit_rate).await;
        if confidence < constraints.min_confidence.to_f64().unwrap_or(0.5) {
            return None;
        }

        if !self.check_market_safety(&base, constraints).await {
            return None;
        }

        let (strategy_type, direction) = match opp {
            Opportunity::Triangular { .. } => (StrategyType::Triangular, "triangular".to_string()),
            Opportunity::CashCarry {
                symbol, direction, ..
            } => {
                if !self.check_funding_safety(symbol, constraints).await {
                    return None;
                }
                (StrategyType::CashCarry, direction.as_str().to_string())
            }
        };

        let risk_score = self
            .calculate_risk_score(&base, estimated_exposure, profit_rate, constraints)
            .await;

        Some(Decision {
            strategy_type,
            exchange: opp.exchange().to_string(),
            symbol: main_symbol,
            direction,
            expected_profit_rate: Decimal::from_f64(profit_rate)
                .unwrap_or_default()
                .round_dp(8),
            estimated_exposure,
            risk_score,
            confidence,
            timestamp: now_ms(),
            raw_opportunity: opp.clone(),
            regime: None,
            routing_weight: None,
        })
    }

    fn check_symbol_constraints(&self, base: &str, constraints: &RiskConstraints) -> bool {
        if constraints.blacklist_symbols.contains(base) {
            return false;
        }
        if self.auto_overlay.blacklist_symbols.contains(base) {
            return false;
        }
        if !constraints.whitelist_symbols.is_empty()
            && !constraints.whitelist_symbols.contains(base)
        {
            return false;
        }
        true
    }

    /// Freshness-weighted confidence: 70% data age (fresh within 30 s),
    /// 30% profit magnitude.
    async fn calculate_confidence(&self, symbols: &[String], profit_rate: f64) -> f64 {
        let now = now_ms();
        let repo = self.repo.clone();
        let exchange_id = self.settings.exchange_id.clone();
        let ages: Vec<i64> = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let repo = repo.clone();
                let exchange_id = exchange_id.clone();
                async move {
                    let tob = repo
                        .get_orderbook_tob(&exchange_id, &symbol)
                        .await
                        .unwrap_or_default();
                    let mut age = tob.timestamp_ms.map(|ts| now - ts);
                    if age.is_none_or(|a| a > 60_000) {
                        let bba = repo
                            .get_best_bid_ask(&exchange_id, &symbol, AccountType::Spot)
                            .await
                            .unwrap_or_default();
                        if let Some(ts) = bba.timestamp {
                            age = Some(now - ts);
                        }
                    }
                    age.filter(|a| (0..=60_000).contains(a))
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .filter_map(|a| async move { a })
            .collect()
            .await;

        if ages.is_empty() {
            return 0.5;
        }
        let avg_age = ages.iter().sum::<i64>() as f64 / ages.len() as f64;
        let freshness = (1.0 - avg_age / 30_000.0).max(0.0);
        let profit_confidence = (profit_rate * 100.0).min(1.0);
        let confidence = freshness * 0.7 + profit_confidence * 0.3;
        (confidence * 100.0).round() / 100.0
    }

    async fn check_market_safety(&self, base: &str, constraints: &RiskConstraints) -> bool {
        let symbol = format!("{base}/USDT");
        let exchange_id = &self.settings.exchange_id;
        let now = now_ms();

        let Ok(tob) = self.repo.get_orderbook_tob(exchange_id, &symbol).await else {
            return false;
        };
        let Ok(bba) = self
            .repo
            .get_best_bid_ask(exchange_id, &symbol, AccountType::Spot)
            .await
        else {
            return false;
        };

        if let Some(ts) = tob.timestamp_ms {
            if now - ts > constraints.max_data_age_ms {
                let fresh_enough = bba
                    .timestamp
                    .is_some_and(|bts| now - bts <= constraints.max_data_age_ms);
                if !fresh_enough {
                    return false;
                }
            }
        }

        if let Some(spread) = bba.spread_rate() {
            if spread > constraints.max_spread_rate.to_f64().unwrap_or(1.0) {
                return false;
            }
        }

        if let Some(volume) = bba.volume.and_then(|v| v.to_f64()) {
            let liquidity_score = (volume / 1.0e8).clamp(0.0, 1.0);
            if liquidity_score < constraints.liquidity_score_min.to_f64().unwrap_or(0.0) {
                return false;
            }
        }

        true
    }

    async fn check_funding_safety(&self, symbol: &str, constraints: &RiskConstraints) -> bool {
        let Ok(funding) = self
            .repo
            .get_funding(&self.settings.exchange_id, symbol)
            .await
        else {
            return true;
        };
        match funding.rate {
            // No published rate is not a spike.
            None => true,
            Some(rate) => rate.abs() <= constraints.max_abs_funding_rate,
        }
    }

    /// Risk score in [0,1], lower better. Volatility proxy is spread/mid.
    async fn calculate_risk_score(
        &self,
        base: &str,
        exposure: Decimal,
        profit_rate: f64,
        constraints: &RiskConstraints,
    ) -> f64 {
        let symbol = format!("{base}/USDT");
        let Ok(ticker) = self
            .repo
            .get_best_bid_ask(&self.settings.exchange_id, &symbol, AccountType::Spot)
            .await
        else {
            return 1.0;
        };

        let mid = ticker
            .bid
            .or(ticker.ask)
            .or(ticker.last)
            .and_then(|d| d.to_f64());
        let Some(mid) = mid.filter(|m| *m > 0.0) else {
            return 1.0;
        };

        let bid = ticker.bid.and_then(|d| d.to_f64()).unwrap_or(0.0);
        let ask = ticker.ask.and_then(|d| d.to_f64()).unwrap_or(0.0);
        let volatility = (ask - bid) / mid;

        let liquidity_score = ticker
            .volume
            .and_then(|v| v.to_f64())
            .map(|v| (v / 1.0e8).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let exposure_factor = (exposure / constraints.max_exposure_per_symbol)
            .to_f64()
            .unwrap_or(1.0);
        let profit_factor = 1.0 - profit_rate;

        let risk = volatility * 0.4
            + (1.0 - liquidity_score) * 0.3
            + exposure_factor * 0.2
            + profit_factor * 0.1;
        risk.clamp(0.0, 1.0)
    }

    /// Routing, per-base dedupe, and the max-positions cap.
    fn apply_global_constraints(
        &self,
        candidates: Vec<Decision>,
        constraints: &RiskConstraints,
    ) -> Vec<Decision> {
        let regime = self.auto_overlay.regime;
        let mut routed = Vec::new();
        for mut d in candidates {
            let routing = self.routing.for_strategy(d.strategy_type.routing_key());
            if !routing.allow_short && d.direction.contains("short") {
                continue;
            }
            let weight = routing.regime_weights.get(&regime).copied().unwrap_or(1.0);
            if weight <= 0.0 {
                continue;
            }
            d.risk_score = ((d.risk_score / weight) * 10_000.0).round() / 10_000.0;
            d.regime = Some(regime);
            d.routing_weight = Some(weight);
            routed.push(d);
        }

        let mut best_by_base: std::collections::HashMap<String, Decision> =
            std::collections::HashMap::new();
        for d in routed {
            let base = d.base();
            match best_by_base.get(&base) {
                Some(existing) if existing.risk_score <= d.risk_score => {}
                _ => {
                    best_by_base.insert(base, d);
                }
            }
        }

        let mut filtered: Vec<Decision> = best_by_base.into_values().collect();
        filtered.sort_by(|a, b| {
            a.risk_score.total_cmp(&b.risk_score).then_with(|| {
                b.expected_profit_rate.cmp(&a.expected_profit_rate)
            })
        });
        // Inclusive cap: exactly max_positions decisions may remain.
        filtered.truncate(constraints.max_positions);
        filtered
    }
}

/// Pure overlay derivation from measured data quality and regime.
fn compute_overlay(
    constraints: &RiskConstraints,
    now: i64,
    avg_age_ms: i64,
    avg_spread: f64,
    low_liquidity_bases: BTreeSet<String>,
    regime: crate::regime::MarketRegimeSnapshot,
) -> AutoOverlay {
    let min_pr = constraints.min_profit_rate;
    let half = Decimal::new(5, 1);
    let mut boost = Decimal::ZERO;
    let mut mult = Decimal::ONE;

    if avg_age_ms > constraints.max_data_age_ms {
        boost += min_pr;
        mult = Decimal::new(5, 1);
    } else if avg_age_ms > (constraints.max_data_age_ms as f64 * 0.7) as i64 {
        boost += min_pr * half;
    }

    let max_spread = constraints.max_spread_rate.to_f64().unwrap_or(f64::MAX);
    if avg_spread > max_spread {
        boost += min_pr;
        mult = mult.min(Decimal::new(5, 1));
    } else if avg_spread > max_spread * 0.7 {
        boost += min_pr * half;
    }

    match regime.regime {
        MarketRegime::Stress => {
            boost += min_pr;
            mult = mult.min(Decimal::new(3, 1));
        }
        MarketRegime::Downtrend => {
            boost += min_pr * half;
            mult = mult.min(Decimal::new(6, 1));
        }
        MarketRegime::Uptrend => {
            boost += min_pr * Decimal::new(2, 1);
            mult = mult.min(Decimal::new(8, 1));
        }
        MarketRegime::Range | MarketRegime::Unknown => {}
    }

    AutoOverlay {
        timestamp_ms: now,
        min_profit_rate_boost: boost,
        exposure_multiplier: mult,
        blacklist_symbols: low_liquidity_bases,
        avg_data_age_ms: avg_age_ms,
        avg_spread_rate: avg_spread,
        regime: regime.regime,
        regime_metrics: Some(regime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{MarketRegimeSnapshot, RegimeSettings};
    use crate::store::MemoryKv;
    use crate::config::PairCatalog;

    fn snapshot(regime: MarketRegime) -> MarketRegimeSnapshot {
        MarketRegimeSnapshot {
            regime,
            timestamp_ms: now_ms(),
            avg_return: 0.0,
            volatility: 0.0,
            avg_spread_rate: 0.0,
            avg_volume: 0.0,
            avg_data_age_ms: 0,
            sample_count: 0,
            symbols: Vec::new(),
        }
    }

    #[test]
    fn overlay_stress_rules() {
        let constraints = RiskConstraints::default();
        let overlay = compute_overlay(
            &constraints,
            now_ms(),
            0,
            0.0,
            BTreeSet::new(),
            snapshot(MarketRegime::Stress),
        );
        assert_eq!(overlay.min_profit_rate_boost, constraints.min_profit_rate);
        assert_eq!(overlay.exposure_multiplier, Decimal::new(3, 1));
    }

    #[test]
    fn overlay_effects_accumulate() {
        let constraints = RiskConstraints::default();
        // Stale data AND wide spreads AND downtrend.
        let overlay = compute_overlay(
            &constraints,
            now_ms(),
            constraints.max_data_age_ms + 1,
            constraints.max_spread_rate.to_f64().unwrap() * 2.0,
            BTreeSet::new(),
            snapshot(MarketRegime::Downtrend),
        );
        // boost = min + min + 0.5*min = 2.5 * min_profit_rate
        assert_eq!(
            overlay.min_profit_rate_boost,
            constraints.min_profit_rate * Decimal::new(25, 1)
        );
        assert_eq!(overlay.exposure_multiplier, Decimal::new(5, 1));
    }

    #[test]
    fn overlay_partial_degradation_boosts_half() {
        let constraints = RiskConstraints::default();
        let overlay = compute_overlay(
            &constraints,
            now_ms(),
            (constraints.max_data_age_ms as f64 * 0.8) as i64,
            0.0,
            BTreeSet::new(),
            snapshot(MarketRegime::Range),
        );
        assert_eq!(
            overlay.min_profit_rate_boost,
            constraints.min_profit_rate * Decimal::new(5, 1)
        );
        assert_eq!(overlay.exposure_multiplier, Decimal::ONE);
    }

    async fn service_with(
        kv: Arc<dyn KvStore>,
        overlay: AutoOverlay,
    ) -> DecisionService {
        let db = Database::open_in_memory().unwrap();
        let catalog = PairCatalog::new(db.clone()).await.unwrap();
        let repo = MarketDataRepository::new(kv.clone());
        let regime = MarketRegimeService::new(
            repo.clone(),
            kv.clone(),
            catalog,
            RegimeSettings::from_env(),
        );
        let constraints = ConstraintsHandle::load(kv.clone()).await;
        let mut settings = DecisionSettings::from_env();
        settings.auto_overlay_interval_ms = i64::MAX;
        let mut svc = DecisionService::new(kv, repo, db, regime, constraints, settings);
        svc.auto_overlay = AutoOverlay {
            timestamp_ms: now_ms(),
            ..overlay
        };
        svc
    }

    async fn seed_healthy_ticker(kv: &Arc<dyn KvStore>, symbol: &str, bid: f64, ask: f64) {
        kv.hset(
            &keys::ticker("binance", symbol),
            &[
                ("bid".to_string(), bid.to_string()),
                ("ask".to_string(), ask.to_string()),
                ("last".to_string(), bid.to_string()),
                ("volume".to_string(), "90000000".to_string()),
                ("timestamp".to_string(), now_ms().to_string()),
            ],
            None,
        )
        .await
        .unwrap();
    }

    fn cashcarry_member(symbol: &str, profit_rate: f64) -> (String, f64) {
        let opp = Opportunity::CashCarry {
            exchange: "binance".into(),
            symbol: symbol.to_string(),
            direction: crate::models::CashCarryDirection::LongSpotShortPerp,
            spot_ask: Some(100.0),
            perp_bid: Some(100.5),
            spot_bid: None,
            perp_ask: None,
            spot_price: 100.0,
            perp_price: 100.5,
            basis_rate: 0.005,
            funding_rate: 0.0015,
            profit_rate,
            timestamp: now_ms(),
        };
        (serde_json::to_string(&opp).unwrap(), profit_rate)
    }

    #[tokio::test]
    async fn stress_overlay_gates_profit_and_exposure() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        seed_healthy_ticker(&kv, "ETH/USDT", 3000.0, 3001.0).await;
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[
                cashcarry_member("BTC/USDT", 0.0015),
                cashcarry_member("ETH/USDT", 0.0025),
            ],
            None,
        )
        .await
        .unwrap();

        let stress_overlay = AutoOverlay {
            min_profit_rate_boost: Decimal::new(1, 3),
            exposure_multiplier: Decimal::new(3, 1),
            regime: MarketRegime::Stress,
            ..AutoOverlay::default()
        };
        let mut svc = service_with(kv.clone(), stress_overlay).await;
        // Raise the ceiling so the 0.3 multiplier still admits the nominal
        // 1000 exposure; the profit gate is what is under test.
        svc.constraints
            .update(|c| c.max_exposure_per_symbol = Decimal::from(5000))
            .await
            .unwrap();

        svc.scan_once().await.unwrap();

        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        // Effective min = 0.001 + 0.001 = 0.002: only the 0.0025 survives.
        assert_eq!(members.len(), 1);
        let d: Decision = serde_json::from_str(&members[0]).unwrap();
        assert_eq!(d.symbol, "ETH/USDT");
        assert_eq!(d.regime, Some(MarketRegime::Stress));
        assert!(
            d.estimated_exposure
                <= Decimal::from(5000) * Decimal::new(3, 1)
        );
    }

    #[tokio::test]
    async fn exposure_cap_drops_everything_when_multiplier_bites() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[cashcarry_member("BTC/USDT", 0.01)],
            None,
        )
        .await
        .unwrap();

        // Default 1000 ceiling * 0.3 = 300 < nominal 1000 exposure.
        let overlay = AutoOverlay {
            exposure_multiplier: Decimal::new(3, 1),
            regime: MarketRegime::Stress,
            min_profit_rate_boost: Decimal::new(1, 3),
            ..AutoOverlay::default()
        };
        let mut svc = service_with(kv.clone(), overlay).await;
        svc.scan_once().await.unwrap();

        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn dedupes_per_base_keeping_lowest_risk() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        // Same base twice with different profits; higher profit scores a
        // lower risk component, so it must win the dedupe.
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[
                cashcarry_member("BTC/USDT", 0.002),
                cashcarry_member("BTC/USDT", 0.009),
            ],
            None,
        )
        .await
        .unwrap();

        let mut svc = service_with(kv.clone(), AutoOverlay::default()).await;
        svc.scan_once().await.unwrap();

        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        assert_eq!(members.len(), 1);
        let d: Decision = serde_json::from_str(&members[0]).unwrap();
        assert_eq!(d.expected_profit_rate, Decimal::new(9, 3));
    }

    #[tokio::test]
    async fn blacklist_and_whitelist_gate_bases() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        seed_healthy_ticker(&kv, "ETH/USDT", 3000.0, 3001.0).await;
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[
                cashcarry_member("BTC/USDT", 0.005),
                cashcarry_member("ETH/USDT", 0.005),
            ],
            None,
        )
        .await
        .unwrap();

        let mut svc = service_with(kv.clone(), AutoOverlay::default()).await;
        svc.constraints
            .update(|c| {
                c.whitelist_symbols.insert("ETH".to_string());
            })
            .await
            .unwrap();
        svc.scan_once().await.unwrap();

        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        assert_eq!(members.len(), 1);
        let d: Decision = serde_json::from_str(&members[0]).unwrap();
        assert_eq!(d.symbol, "ETH/USDT");
    }

    #[tokio::test]
    async fn zero_regime_weight_drops_strategy() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[cashcarry_member("BTC/USDT", 0.005)],
            None,
        )
        .await
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        db.upsert_strategy_config(
            "funding_rate",
            &serde_json::json!({"regime_weights": {"RANGE": 0.0}}),
            true,
        )
        .await
        .unwrap();

        let catalog = PairCatalog::new(db.clone()).await.unwrap();
        let repo = MarketDataRepository::new(kv.clone());
        let regime = MarketRegimeService::new(
            repo.clone(),
            kv.clone(),
            catalog,
            RegimeSettings::from_env(),
        );
        let constraints = ConstraintsHandle::load(kv.clone()).await;
        let mut settings = DecisionSettings::from_env();
        settings.auto_overlay_interval_ms = i64::MAX;
        let mut svc =
            DecisionService::new(kv.clone(), repo, db, regime, constraints, settings);
        svc.auto_overlay = AutoOverlay {
            timestamp_ms: now_ms(),
            regime: MarketRegime::Range,
            ..AutoOverlay::default()
        };

        svc.scan_once().await.unwrap();
        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn routing_weight_scales_risk_score() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        seed_healthy_ticker(&kv, "BTC/USDT", 60000.0, 60010.0).await;
        kv.replace_zset(
            keys::OPPORTUNITIES_CASHCARRY,
            &[cashcarry_member("BTC/USDT", 0.005)],
            None,
        )
        .await
        .unwrap();

        let overlay = AutoOverlay {
            regime: MarketRegime::Downtrend,
            ..AutoOverlay::default()
        };
        let mut svc = service_with(kv.clone(), overlay).await;
        svc.scan_once().await.unwrap();

        let members = kv.zrange(keys::DECISIONS_LATEST, 0, -1).await.unwrap();
        assert_eq!(members.len(), 1);
        let d: Decision = serde_json::from_str(&members[0]).unwrap();
        // Default DOWNTREND weight is 0.6; a divided risk score is larger
        // than the unrouted one would be.
        assert_eq!(d.routing_weight, Some(0.6));
        assert!(d.risk_score > 0.0);
    }
}
