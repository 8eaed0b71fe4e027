//! Paper-mode end-to-end flows: scanner -> decision -> execute_latest,
//! including idempotent replays.

mod common;

use std::str::FromStr;

use rust_decimal::Decimal;

use common::{core, seed_funding, seed_ticker, seed_tob};
use inarbit_backend::decision::{ConstraintsHandle, DecisionService, DecisionSettings};
use inarbit_backend::exchange::SimFillMode;
use inarbit_backend::models::{
    AccountType, OrderSide, OrderStatus, PlanKind, PlanLeg, PlanStatus, TradingMode,
};
use inarbit_backend::regime::{MarketRegimeService, RegimeSettings};
use inarbit_backend::scanners::{
    CashCarryScanner, CashCarrySettings, TriangularScanner, TriangularSettings,
};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn decision_service(core: &common::TestCore) -> DecisionService {
    let regime = MarketRegimeService::new(
        core.repo.clone(),
        core.kv.clone(),
        core.catalog.clone(),
        RegimeSettings::from_env(),
    );
    let constraints = ConstraintsHandle::load(core.kv.clone()).await;
    DecisionService::new(
        core.kv.clone(),
        core.repo.clone(),
        core.db.clone(),
        regime,
        constraints,
        DecisionSettings::from_env(),
    )
}

#[tokio::test]
async fn triangular_paper_flow_completes_plan_with_pnl() {
    let core = core(SimFillMode::Immediate).await;

    // Spot books forming a profitable USDT -> ETH -> BTC -> USDT cycle.
    seed_tob(&core.kv, "BTC/USDT", 60000.0, 60010.0).await;
    seed_tob(&core.kv, "ETH/USDT", 3000.0, 3001.0).await;
    seed_tob(&core.kv, "ETH/BTC", 0.0501, 0.0502).await;
    seed_ticker(&core.kv, "ticker", "BTC/USDT", 60000.0, 60010.0, 9.0e7).await;
    seed_ticker(&core.kv, "ticker", "ETH/USDT", 3000.0, 3001.0, 9.0e7).await;

    let mut settings = TriangularSettings::from_env();
    settings.min_profit_rate = 0.0004;
    let mut scanner = TriangularScanner::new(
        core.repo.clone(),
        core.kv.clone(),
        core.catalog.clone(),
        settings,
    );
    scanner.scan_once().await.unwrap();

    let mut decisions = decision_service(&core).await;
    decisions
        .constraints_handle()
        .update(|c| c.min_profit_rate = dec("0.0004"))
        .await
        .unwrap();
    decisions.scan_once().await.unwrap();

    let result = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, None, 1)
        .await
        .unwrap();
    assert_eq!(result.orders.len(), 3);

    let plan = core
        .oms
        .get_execution_plan(core.user, result.plan_id, TradingMode::Paper)
        .await
        .unwrap();
    assert_eq!(plan.kind, PlanKind::Triangle);
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan.finished_at.is_some());

    let orders = core
        .oms
        .get_plan_orders(core.user, result.plan_id, TradingMode::Paper, 20)
        .await
        .unwrap();
    assert_eq!(orders.len(), 3);
    let fee_rate = dec("0.0004");
    for order in &orders {
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.account_type, AccountType::Spot);
        // Per-leg fee is the quote-side notional times the taker rate.
        let avg = order.average_price.unwrap();
        let notional = order.quantity * avg;
        let expected = (notional * fee_rate).round_dp(8);
        let diff = (order.fee - expected).abs();
        // The buy leg charges on the pre-fee quote amount, so allow the
        // rounding-scale difference.
        assert!(diff < dec("0.001"), "fee {} vs {expected}", order.fee);
    }

    let fills = core
        .oms
        .get_plan_fills(core.user, result.plan_id, TradingMode::Paper)
        .await
        .unwrap();
    assert_eq!(fills.len(), 3);

    let pnl = core.db.get_pnl(TradingMode::Paper, core.user).await.unwrap();
    assert_eq!(pnl.len(), 1);

    // The pnl summary leg is appended once the plan completes.
    let has_pnl_leg = plan
        .legs
        .iter()
        .any(|leg| matches!(leg, PlanLeg::PnlSummary { .. }));
    assert!(has_pnl_leg);
}

#[tokio::test]
async fn cashcarry_paper_flow_projects_positions_and_balance() {
    let core = core(SimFillMode::Immediate).await;

    seed_ticker(&core.kv, "ticker", "BTC/USDT", 99.9, 100.0, 9.0e7).await;
    seed_ticker(&core.kv, "ticker_futures", "BTC/USDT", 100.5, 100.6, 9.0e7).await;
    seed_funding(&core.kv, "BTC/USDT", 0.0005).await;
    core.db
        .set_simulation_config(core.user, "USDT", dec("10000"))
        .await
        .unwrap();

    let mut scanner = CashCarryScanner::new(
        core.repo.clone(),
        core.kv.clone(),
        core.catalog.clone(),
        CashCarrySettings::from_env(),
    );
    scanner.scan_once().await.unwrap();

    let mut decisions = decision_service(&core).await;
    decisions.scan_once().await.unwrap();

    let result = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, None, 1)
        .await
        .unwrap();
    assert_eq!(result.orders.len(), 2);

    let plan = core
        .oms
        .get_execution_plan(core.user, result.plan_id, TradingMode::Paper)
        .await
        .unwrap();
    assert_eq!(plan.kind, PlanKind::Basis);
    assert_eq!(plan.status, PlanStatus::Completed);

    let orders = core
        .oms
        .get_plan_orders(core.user, result.plan_id, TradingMode::Paper, 20)
        .await
        .unwrap();
    assert_eq!(orders.len(), 2);
    let spot = orders.iter().find(|o| o.account_type == AccountType::Spot).unwrap();
    let perp = orders.iter().find(|o| o.account_type == AccountType::Perp).unwrap();
    assert_eq!(spot.side, OrderSide::Buy);
    assert_eq!(spot.quantity, dec("10"));
    assert_eq!(spot.average_price, Some(dec("100")));
    assert_eq!(spot.fee, dec("0.4"));
    assert_eq!(perp.side, OrderSide::Sell);
    assert_eq!(perp.quantity, dec("10"));
    assert_eq!(perp.average_price, Some(dec("100.5")));
    assert_eq!(perp.fee, dec("0.4"));

    // Position projection: +10 spot base, -10 perp instrument.
    let spot_pos = core
        .db
        .get_position(TradingMode::Paper, core.user, "binance", AccountType::Spot, "BTC")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(spot_pos.quantity, dec("10"));
    assert_eq!(spot_pos.avg_price, Some(dec("100")));

    let perp_pos = core
        .db
        .get_position(
            TradingMode::Paper,
            core.user,
            "binance",
            AccountType::Perp,
            "BTC/USDT",
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(perp_pos.quantity, dec("-10"));
    assert_eq!(perp_pos.avg_price, Some(dec("100.5")));

    // Simulation balance: -1000 notional -0.4 spot fee in the quote.
    let (_, balance) = core.db.get_simulation_balance(core.user).await.unwrap().unwrap();
    assert_eq!(balance, dec("8999.6"));

    // Plan PnL: 1005 sell - 1000 buy - 0.8 fees.
    let pnl = core.db.get_pnl(TradingMode::Paper, core.user).await.unwrap();
    assert_eq!(pnl.len(), 1);
    assert_eq!(pnl[0].profit, dec("4.2"));
    assert_eq!(pnl[0].symbol, "BTC/USDT");

    // Live family untouched.
    assert!(core
        .db
        .get_pnl(TradingMode::Live, core.user)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reconcile_of_completed_plan_converges_in_one_round() {
    let core = core(SimFillMode::Immediate).await;

    seed_ticker(&core.kv, "ticker", "BTC/USDT", 99.9, 100.0, 9.0e7).await;
    seed_ticker(&core.kv, "ticker_futures", "BTC/USDT", 100.5, 100.6, 9.0e7).await;
    seed_funding(&core.kv, "BTC/USDT", 0.0005).await;

    let mut scanner = CashCarryScanner::new(
        core.repo.clone(),
        core.kv.clone(),
        core.catalog.clone(),
        CashCarrySettings::from_env(),
    );
    scanner.scan_once().await.unwrap();
    let mut decisions = decision_service(&core).await;
    decisions.scan_once().await.unwrap();

    let result = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, None, 1)
        .await
        .unwrap();
    let before = core
        .oms
        .get_execution_plan(core.user, result.plan_id, TradingMode::Paper)
        .await
        .unwrap();
    assert_eq!(before.status, PlanStatus::Completed);

    let outcome = core
        .oms
        .reconcile_plan(
            core.user,
            result.plan_id,
            TradingMode::Paper,
            false,
            20,
            5,
            200,
            false,
            None,
        )
        .await
        .unwrap();
    // Converges on the first observation without sleeping through rounds.
    assert!(outcome.summary.terminal);
    assert_eq!(outcome.rounds.len(), 1);

    let after = core
        .oms
        .get_execution_plan(core.user, result.plan_id, TradingMode::Paper)
        .await
        .unwrap();
    assert_eq!(after.status, PlanStatus::Completed);
    assert_eq!(after.finished_at, before.finished_at);

    // PnL stays single-entry thanks to the plan marker.
    let pnl = core.db.get_pnl(TradingMode::Paper, core.user).await.unwrap();
    assert_eq!(pnl.len(), 1);
}

#[tokio::test]
async fn execute_latest_is_idempotent_within_ttl() {
    let core = core(SimFillMode::Immediate).await;

    seed_ticker(&core.kv, "ticker", "BTC/USDT", 99.9, 100.0, 9.0e7).await;
    seed_ticker(&core.kv, "ticker_futures", "BTC/USDT", 100.5, 100.6, 9.0e7).await;
    seed_funding(&core.kv, "BTC/USDT", 0.0005).await;

    let mut scanner = CashCarryScanner::new(
        core.repo.clone(),
        core.kv.clone(),
        core.catalog.clone(),
        CashCarrySettings::from_env(),
    );
    scanner.scan_once().await.unwrap();
    let mut decisions = decision_service(&core).await;
    decisions.scan_once().await.unwrap();

    let first = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, Some("K"), 1)
        .await
        .unwrap();
    let second = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, Some("K"), 1)
        .await
        .unwrap();

    assert_eq!(first.plan_id, second.plan_id);
    assert_eq!(first.orders, second.orders);

    // No duplicated side effects: the plan still owns exactly two orders and
    // the position was not doubled.
    let orders = core
        .oms
        .get_plan_orders(core.user, first.plan_id, TradingMode::Paper, 50)
        .await
        .unwrap();
    assert_eq!(orders.len(), 2);
    let pos = core
        .db
        .get_position(TradingMode::Paper, core.user, "binance", AccountType::Spot, "BTC")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pos.quantity, dec("10"));
    let pnl = core.db.get_pnl(TradingMode::Paper, core.user).await.unwrap();
    assert_eq!(pnl.len(), 1);

    // A different key executes a fresh plan.
    let third = core
        .oms
        .execute_latest(core.user, TradingMode::Paper, false, Some("K2"), 1)
        .await
        .unwrap();
    assert_ne!(third.plan_id, first.plan_id);
}
