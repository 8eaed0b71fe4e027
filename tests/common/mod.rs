//! Shared harness for end-to-end tests: in-process KV, in-memory SQLite,
//! the simulated exchange, and seeding helpers for market snapshots.

#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use inarbit_backend::config::{cross_pairs, PairCatalog};
use inarbit_backend::exchange::{ExchangeAdapter, SimExchange, SimFillMode};
use inarbit_backend::marketdata::MarketDataRepository;
use inarbit_backend::models::{
    CashCarryDirection, Decision, MarketRegime, Opportunity, StrategyType,
};
use inarbit_backend::oms::{OmsService, OmsSettings};
use inarbit_backend::store::{keys, Database, KvStore, MemoryKv};
use inarbit_backend::util::now_ms;

pub struct TestCore {
    pub kv: Arc<dyn KvStore>,
    pub db: Database,
    pub catalog: Arc<PairCatalog>,
    pub repo: Arc<MarketDataRepository>,
    pub sim: Arc<SimExchange>,
    pub oms: OmsService,
    pub user: Uuid,
}

pub async fn core(fill_mode: SimFillMode) -> TestCore {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let db = Database::open_in_memory().expect("open db");
    let catalog = PairCatalog::new(db.clone()).await.expect("catalog");
    catalog
        .ensure_pairs(&cross_pairs())
        .await
        .expect("cross pairs");
    let repo = MarketDataRepository::new(kv.clone());
    let sim = Arc::new(SimExchange::new(fill_mode));
    let adapter: Arc<dyn ExchangeAdapter> = sim.clone();
    let oms = OmsService::new(
        db.clone(),
        kv.clone(),
        repo.clone(),
        adapter,
        catalog.clone(),
        OmsSettings::from_env(),
    );
    TestCore {
        kv,
        db,
        catalog,
        repo,
        sim,
        oms,
        user: Uuid::new_v4(),
    }
}

pub async fn seed_ticker(
    kv: &Arc<dyn KvStore>,
    namespace: &str,
    symbol: &str,
    bid: f64,
    ask: f64,
    volume: f64,
) {
    kv.hset(
        &format!("{namespace}:binance:{symbol}"),
        &[
            ("bid".to_string(), bid.to_string()),
            ("ask".to_string(), ask.to_string()),
            ("last".to_string(), bid.to_string()),
            ("volume".to_string(), volume.to_string()),
            ("timestamp".to_string(), now_ms().to_string()),
        ],
        None,
    )
    .await
    .expect("seed ticker");
}

pub async fn seed_tob(kv: &Arc<dyn KvStore>, symbol: &str, bid: f64, ask: f64) {
    kv.replace_zset(
        &keys::orderbook_bids("binance", symbol),
        &[(format!("{bid}:1"), bid)],
        None,
    )
    .await
    .expect("seed bids");
    kv.replace_zset(
        &keys::orderbook_asks("binance", symbol),
        &[(format!("{ask}:1"), ask)],
        None,
    )
    .await
    .expect("seed asks");
    kv.set(
        &keys::orderbook_ts("binance", symbol),
        &now_ms().to_string(),
        None,
    )
    .await
    .expect("seed ts");
}

pub async fn seed_funding(kv: &Arc<dyn KvStore>, symbol: &str, rate: f64) {
    kv.hset(
        &keys::funding("binance", symbol),
        &[
            ("rate".to_string(), rate.to_string()),
            ("timestamp".to_string(), now_ms().to_string()),
        ],
        None,
    )
    .await
    .expect("seed funding");
}

/// Put a hand-built cash-and-carry decision at the top of `decisions:latest`.
pub async fn seed_cashcarry_decision(
    kv: &Arc<dyn KvStore>,
    symbol: &str,
    direction: CashCarryDirection,
    spot_price: f64,
    perp_price: f64,
) -> Decision {
    let opportunity = Opportunity::CashCarry {
        exchange: "binance".into(),
        symbol: symbol.to_string(),
        direction,
        spot_ask: Some(spot_price),
        perp_bid: Some(perp_price),
        spot_bid: None,
        perp_ask: None,
        spot_price,
        perp_price,
        basis_rate: (perp_price - spot_price) / spot_price,
        funding_rate: 0.0015,
        profit_rate: 0.0057,
        timestamp: now_ms(),
    };
    let decision = Decision {
        strategy_type: StrategyType::CashCarry,
        exchange: "binance".into(),
        symbol: symbol.to_string(),
        direction: direction.as_str().to_string(),
        expected_profit_rate: Decimal::new(57, 4),
        estimated_exposure: Decimal::from(1000),
        risk_score: 0.2,
        confidence: 0.8,
        timestamp: now_ms(),
        raw_opportunity: opportunity,
        regime: Some(MarketRegime::Range),
        routing_weight: Some(1.0),
    };
    kv.replace_zset(
        keys::DECISIONS_LATEST,
        &[(serde_json::to_string(&decision).unwrap(), decision.risk_score)],
        None,
    )
    .await
    .expect("seed decision");
    decision
}
