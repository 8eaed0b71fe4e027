//! OMS operations: execute_latest, per-order and per-plan refresh/cancel,
//! and the read-only getters. One code path renders both trading modes; only
//! the order sink (synthetic fill vs exchange adapter) and the target table
//! family differ, and no operation ever crosses families.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{env_flag, env_parse, live_oms_enabled, PairCatalog};
use crate::error::{OmsError, OmsResult};
use crate::exchange::ExchangeAdapter;
use crate::marketdata::MarketDataRepository;
use crate::models::{
    AccountType, CompensationResult, CompensationSummary, Decision, ExecutionPlan, Fill,
    OpStats, Opportunity, Order, OrderSide, OrderStatus, OrderType, OrdersSummary, PlanKind,
    PlanLeg, PlanStatus, PollRound, PollSummary, ReconcileRequest, StatusCounts, StrategyType,
    TradingMode,
};
use crate::store::db::{NewOrder, OrderStatusUpdate};
use crate::store::{keys, Database, KvStore};
use crate::util::now_ms;

use super::extract::{extract_execution, safe_client_order_id, synthetic_trade_id};
use super::pnl::record_plan_pnl;
use super::projector::apply_fill;

/// Process-wide risk gate consulted before live placement when enabled.
/// The gate's configuration (risk YAML, equity monitors) lives outside the
/// core; this is only the hook.
#[async_trait]
pub trait RiskGate: Send + Sync {
    async fn check(&self, user_id: Uuid) -> bool;
}

#[derive(Debug, Clone)]
pub struct OmsSettings {
    pub exchange_id: String,
    pub spot_fee_rate: Decimal,
    pub perp_fee_rate: Decimal,
    pub dedupe_ttl: Duration,
    pub post_exec_poll_enabled: bool,
    pub post_exec_poll_max_rounds: u32,
    pub post_exec_poll_sleep_ms: u64,
    pub post_exec_poll_limit: usize,
    pub failure_compensate_cancel: bool,
    pub risk_check_enabled: bool,
    pub reconcile_default_limit: usize,
    pub reconcile_default_max_rounds: u32,
    pub reconcile_default_sleep_ms: u64,
    pub reconcile_default_auto_cancel: bool,
    pub reconcile_default_max_age_seconds: Option<i64>,
}

impl OmsSettings {
    pub fn from_env() -> Self {
        let max_age = std::env::var("OMS_RECONCILE_DEFAULT_MAX_AGE_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok());
        Self {
            exchange_id: "binance".to_string(),
            spot_fee_rate: Decimal::new(4, 4),
            perp_fee_rate: Decimal::new(4, 4),
            dedupe_ttl: Duration::from_secs(env_parse("OMS_DEDUPE_TTL", 60u64).max(10)),
            post_exec_poll_enabled: env_flag("OMS_POST_EXEC_POLL_ENABLED"),
            post_exec_poll_max_rounds: env_parse("OMS_POST_EXEC_POLL_MAX_ROUNDS", 5u32).max(1),
            post_exec_poll_sleep_ms: env_parse("OMS_POST_EXEC_POLL_SLEEP_MS", 500u64),
            post_exec_poll_limit: env_parse("OMS_POST_EXEC_POLL_LIMIT", 200usize).max(1),
            failure_compensate_cancel: env_flag("OMS_FAILURE_COMPENSATE_CANCEL_ENABLED"),
            risk_check_enabled: env_flag("INARBIT_ENABLE_RISK_CHECK"),
            reconcile_default_limit: env_parse("OMS_RECONCILE_DEFAULT_LIMIT", 20usize).max(1),
            reconcile_default_max_rounds: env_parse("OMS_RECONCILE_DEFAULT_MAX_ROUNDS", 5u32)
                .max(1),
            reconcile_default_sleep_ms: env_parse("OMS_RECONCILE_DEFAULT_SLEEP_MS", 500u64),
            reconcile_default_auto_cancel: env_flag("OMS_RECONCILE_DEFAULT_AUTO_CANCEL"),
            reconcile_default_max_age_seconds: max_age,
        }
    }
}

/// Leg descriptor returned from execute_latest and cached for idempotent
/// replays; also persisted as the plan's `placed_order` legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedLeg {
    pub order_id: Uuid,
    pub leg_id: String,
    pub account_type: AccountType,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: Uuid,
    pub decision: Decision,
    pub orders: Vec<PlacedLeg>,
}

/// Result of a plan-wide refresh or cancel sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSweep {
    pub orders: Vec<Order>,
    pub results: Vec<CompensationResult>,
    pub stats: OpStats,
}

pub struct OmsService {
    db: Database,
    kv: Arc<dyn KvStore>,
    repo: Arc<MarketDataRepository>,
    adapter: Arc<dyn ExchangeAdapter>,
    catalog: Arc<PairCatalog>,
    risk_gate: Option<Arc<dyn RiskGate>>,
    pub(crate) settings: OmsSettings,
}

impl OmsService {
    pub fn new(
        db: Database,
        kv: Arc<dyn KvStore>,
        repo: Arc<MarketDataRepository>,
        adapter: Arc<dyn ExchangeAdapter>,
        catalog: Arc<PairCatalog>,
        settings: OmsSettings,
    ) -> Self {
        Self {
            db,
            kv,
            repo,
            adapter,
            catalog,
            risk_gate: None,
            settings,
        }
    }

    pub fn with_risk_gate(mut self, gate: Arc<dyn RiskGate>) -> Self {
        self.risk_gate = Some(gate);
        self
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Live mutation requires both the per-call confirmation and the
    /// process-level enablement flag.
    pub(crate) fn require_live_enabled(&self, confirm_live: bool) -> OmsResult<()> {
        if !confirm_live {
            return Err(OmsError::denied("live mode requires confirm_live=true"));
        }
        if !live_oms_enabled() {
            return Err(OmsError::denied(
                "live mode requires INARBIT_ENABLE_LIVE_OMS=1",
            ));
        }
        Ok(())
    }

    fn check_mode(&self, mode: TradingMode, confirm_live: bool) -> OmsResult<()> {
        if mode == TradingMode::Live {
            self.require_live_enabled(confirm_live)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // execute_latest
    // ------------------------------------------------------------------

    pub async fn execute_latest(
        &self,
        user_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
        idempotency_key: Option<&str>,
        limit: usize,
    ) -> OmsResult<ExecutionResult> {
        self.check_mode(mode, confirm_live)?;

        if let Some(key) = idempotency_key {
            let dedupe_key = keys::oms_dedupe(&user_id.to_string(), key);
            if let Some(cached) = self.kv.get(&dedupe_key).await.map_err(OmsError::Storage)? {
                if let Ok(result) = serde_json::from_str::<ExecutionResult>(&cached) {
                    return Ok(result);
                }
            }
        }

        let decision = self.get_latest_decision(user_id, limit).await?;

        if self.settings.risk_check_enabled {
            if let Some(gate) = &self.risk_gate {
                if !gate.check(user_id).await {
                    return Err(OmsError::denied("risk check failed"));
                }
            }
        }

        let plan_kind = match decision.strategy_type {
            StrategyType::CashCarry => PlanKind::Basis,
            StrategyType::Triangular => PlanKind::Triangle,
        };
        let plan_id = self
            .db
            .create_plan(mode, user_id, &self.settings.exchange_id, plan_kind)
            .await
            .map_err(OmsError::Storage)?;

        match self
            .execute_plan_body(user_id, &decision, mode, confirm_live, plan_id, plan_kind)
            .await
        {
            Ok(placed) => {
                let result = ExecutionResult {
                    plan_id,
                    decision,
                    orders: placed,
                };
                if let Some(key) = idempotency_key {
                    let dedupe_key = keys::oms_dedupe(&user_id.to_string(), key);
                    if let Ok(payload) = serde_json::to_string(&result) {
                        let _ = self
                            .kv
                            .set(&dedupe_key, &payload, Some(self.settings.dedupe_ttl))
                            .await;
                    }
                }
                Ok(result)
            }
            Err(e) => {
                self.handle_execution_failure(user_id, mode, confirm_live, plan_id, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn execute_plan_body(
        &self,
        user_id: Uuid,
        decision: &Decision,
        mode: TradingMode,
        confirm_live: bool,
        plan_id: Uuid,
        plan_kind: PlanKind,
    ) -> OmsResult<Vec<PlacedLeg>> {
        let placed = match decision.strategy_type {
            StrategyType::CashCarry => {
                self.execute_cashcarry(user_id, decision, mode, plan_id).await?
            }
            StrategyType::Triangular => {
                self.execute_triangular(user_id, decision, mode, plan_id).await?
            }
        };

        let legs: Vec<PlanLeg> = placed
            .iter()
            .map(|p| PlanLeg::PlacedOrder {
                order_id: p.order_id,
                leg_id: p.leg_id.clone(),
                account_type: p.account_type,
                symbol: p.symbol.clone(),
                side: p.side,
                quantity: p.quantity,
                average_price: p.average_price,
            })
            .collect();
        self.db
            .set_plan_legs(mode, plan_id, &legs)
            .await
            .map_err(OmsError::Storage)?;

        let mut orders = self
            .db
            .get_orders_by_plan(mode, user_id, plan_id, self.settings.post_exec_poll_limit)
            .await
            .map_err(OmsError::Storage)?;
        let mut terminal = orders.iter().all(|o| o.status.is_terminal());
        let mut rejected = orders.iter().any(|o| o.status == OrderStatus::Rejected);

        if mode == TradingMode::Live
            && self.settings.post_exec_poll_enabled
            && !terminal
            && self.settings.post_exec_poll_max_rounds > 0
        {
            let (summary, last) = self
                .poll_plan_until_terminal(user_id, plan_id, mode, confirm_live)
                .await?;
            orders = last.orders;
            terminal = orders.iter().all(|o| o.status.is_terminal());
            rejected = orders.iter().any(|o| o.status == OrderStatus::Rejected);
            let _ = self
                .db
                .append_plan_leg(mode, plan_id, PlanLeg::PostExecPollSummary { summary })
                .await;
        }

        let (status, error_message) = if terminal {
            if rejected {
                (PlanStatus::Failed, Some("rejected".to_string()))
            } else {
                (PlanStatus::Completed, None)
            }
        } else if mode == TradingMode::Paper {
            (PlanStatus::Completed, None)
        } else {
            (PlanStatus::Running, None)
        };
        self.db
            .update_plan_status(mode, plan_id, status, error_message.as_deref())
            .await
            .map_err(OmsError::Storage)?;

        if status == PlanStatus::Completed {
            if let Err(e) = record_plan_pnl(
                &self.db,
                &self.kv,
                user_id,
                plan_id,
                mode,
                plan_kind,
                &self.settings.exchange_id,
            )
            .await
            {
                warn!(error = %e, %plan_id, "plan pnl recording failed");
            }
        }

        info!(%plan_id, mode = %mode, status = status.as_str(), "oms plan executed");
        let _ = self
            .kv
            .hset(
                &keys::metrics("oms_service"),
                &[
                    ("last_plan_id".to_string(), plan_id.to_string()),
                    ("last_trading_mode".to_string(), mode.as_str().to_string()),
                    ("last_status".to_string(), status.as_str().to_string()),
                    (
                        "last_error".to_string(),
                        error_message.clone().unwrap_or_default(),
                    ),
                    ("timestamp_ms".to_string(), now_ms().to_string()),
                ],
                Some(Duration::from_secs(300)),
            )
            .await;

        let status_counts = status_counts(&orders);
        let orders_summary = OrdersSummary::from_counts(&status_counts, false);
        let _ = self
            .db
            .append_plan_leg(
                mode,
                plan_id,
                PlanLeg::ExecutionSummary {
                    plan_id,
                    trading_mode: mode,
                    status_counts,
                    orders_summary,
                    reconcile_suggested_request: self.default_reconcile_request(
                        plan_id,
                        mode,
                        confirm_live,
                    ),
                },
            )
            .await;

        Ok(placed)
    }

    /// Failure path: best-effort compensation cancels (live, when enabled),
    /// a suggested-reconcile leg carrying the error, and a failed plan.
    async fn handle_execution_failure(
        &self,
        user_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
        plan_id: Uuid,
        error: &OmsError,
    ) {
        if mode == TradingMode::Live && self.settings.failure_compensate_cancel {
            let mut stats = OpStats::default();
            let mut results = Vec::new();
            let orders = self
                .db
                .get_orders_by_plan(mode, user_id, plan_id, 200)
                .await
                .unwrap_or_default();
            for order in orders {
                stats.total += 1;
                if order.status.is_terminal() {
                    stats.ok += 1;
                    stats.skipped += 1;
                    results.push(CompensationResult {
                        order_id: order.id,
                        ok: true,
                        skipped: Some(true),
                        error: None,
                    });
                    continue;
                }
                match self
                    .cancel_order(user_id, order.id, mode, confirm_live)
                    .await
                {
                    Ok(_) => {
                        stats.ok += 1;
                        results.push(CompensationResult {
                            order_id: order.id,
                            ok: true,
                            skipped: None,
                            error: None,
                        });
                    }
                    Err(e) => {
                        stats.failed += 1;
                        results.push(CompensationResult {
                            order_id: order.id,
                            ok: false,
                            skipped: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
            let _ = self
                .db
                .append_plan_leg(
                    mode,
                    plan_id,
                    PlanLeg::FailureCompensation {
                        summary: CompensationSummary {
                            action: "best_effort_cancel".to_string(),
                            stats,
                            results,
                        },
                    },
                )
                .await;
        }

        let _ = self
            .db
            .append_plan_leg(
                mode,
                plan_id,
                PlanLeg::ReconcileSuggestedRequest {
                    request: self.default_reconcile_request(plan_id, mode, confirm_live),
                    error: error.to_string(),
                },
            )
            .await;
        let _ = self
            .db
            .update_plan_status(mode, plan_id, PlanStatus::Failed, Some(&error.to_string()))
            .await;
    }

    async fn get_latest_decision(&self, _user_id: Uuid, limit: usize) -> OmsResult<Decision> {
        let fetch = std::cmp::max(50, limit);
        let members = self
            .kv
            .zrange(keys::DECISIONS_LATEST, 0, fetch as isize - 1)
            .await
            .map_err(OmsError::Storage)?;
        if members.is_empty() {
            return Err(OmsError::not_found("no decisions"));
        }

        let allowed = self
            .catalog
            .enabled_symbols(&self.settings.exchange_id)
            .await
            .map_err(OmsError::Storage)?;
        if allowed.is_empty() {
            return Err(OmsError::not_found("no enabled trading pairs for execution"));
        }

        for member in members {
            let Ok(decision) = serde_json::from_str::<Decision>(&member) else {
                continue;
            };
            if decision.exchange != self.settings.exchange_id {
                continue;
            }
            let symbols = decision.raw_opportunity.symbols();
            if !symbols.is_empty() && symbols.iter().all(|s| allowed.contains(s)) {
                return Ok(decision);
            }
        }
        Err(OmsError::not_found("no decisions for enabled trading pairs"))
    }

    // ------------------------------------------------------------------
    // Strategy leg construction
    // ------------------------------------------------------------------

    fn cashcarry_sides(direction: &str) -> OmsResult<(OrderSide, OrderSide)> {
        match direction {
            "long_spot_short_perp" => Ok((OrderSide::Buy, OrderSide::Sell)),
            "short_spot_long_perp" => Ok((OrderSide::Sell, OrderSide::Buy)),
            other => Err(OmsError::invalid(format!(
                "invalid cashcarry direction: {other}"
            ))),
        }
    }

    async fn execute_cashcarry(
        &self,
        user_id: Uuid,
        decision: &Decision,
        mode: TradingMode,
        plan_id: Uuid,
    ) -> OmsResult<Vec<PlacedLeg>> {
        let symbol = decision.symbol.clone();
        if symbol.is_empty() {
            return Err(OmsError::invalid("decision missing symbol"));
        }
        let (spot_side, perp_side) = Self::cashcarry_sides(&decision.direction)?;
        let exposure = decision.estimated_exposure;

        let ex = &self.settings.exchange_id;
        let spot_tob = self
            .repo
            .get_orderbook_tob(ex, &symbol)
            .await
            .map_err(OmsError::Storage)?;
        let spot_bba = self
            .repo
            .get_best_bid_ask(ex, &symbol, AccountType::Spot)
            .await
            .map_err(OmsError::Storage)?;
        let perp_bba = self
            .repo
            .get_best_bid_ask(ex, &symbol, AccountType::Perp)
            .await
            .map_err(OmsError::Storage)?;

        let mut spot_bid = spot_tob.best_bid_price.or(spot_bba.bid).or(spot_bba.last);
        let mut spot_ask = spot_tob.best_ask_price.or(spot_bba.ask).or(spot_bba.last);
        let mut perp_bid = perp_bba.bid.or(perp_bba.last);
        let mut perp_ask = perp_bba.ask.or(perp_bba.last);

        // Snapshots can expire between decision and execution; the raw
        // opportunity carries the prices the decision was made from.
        if let Opportunity::CashCarry {
            spot_ask: raw_spot_ask,
            perp_bid: raw_perp_bid,
            spot_bid: raw_spot_bid,
            perp_ask: raw_perp_ask,
            spot_price,
            perp_price,
            ..
        } = &decision.raw_opportunity
        {
            let from_f64 = |v: f64| Decimal::try_from(v).ok();
            spot_bid = spot_bid
                .or_else(|| raw_spot_bid.and_then(from_f64))
                .or_else(|| from_f64(*spot_price));
            spot_ask = spot_ask
                .or_else(|| raw_spot_ask.and_then(from_f64))
                .or_else(|| from_f64(*spot_price))
                .or(spot_bid);
            perp_bid = perp_bid
                .or_else(|| raw_perp_bid.and_then(from_f64))
                .or_else(|| from_f64(*perp_price));
            perp_ask = perp_ask
                .or_else(|| raw_perp_ask.and_then(from_f64))
                .or_else(|| from_f64(*perp_price))
                .or(perp_bid);
        }

        let (Some(spot_bid), Some(spot_ask), Some(perp_bid), Some(perp_ask)) =
            (spot_bid, spot_ask, perp_bid, perp_ask)
        else {
            return Err(OmsError::transient("missing market data"));
        };

        let spot_price = match spot_side {
            OrderSide::Buy => spot_ask,
            OrderSide::Sell => spot_bid,
        };
        let perp_price = match perp_side {
            OrderSide::Buy => perp_ask,
            OrderSide::Sell => perp_bid,
        };
        if spot_price <= Decimal::ZERO {
            return Err(OmsError::transient("missing spot price"));
        }

        let spot_qty = (exposure / spot_price).round_dp(8);
        let perp_qty = spot_qty;

        let decision_json = serde_json::to_value(decision).unwrap_or(serde_json::Value::Null);
        let spot_fee = (exposure * self.settings.spot_fee_rate).round_dp(8);
        let perp_fee = (exposure * self.settings.perp_fee_rate).round_dp(8);

        let spot_leg = self
            .place_leg(
                user_id,
                mode,
                plan_id,
                "spot",
                AccountType::Spot,
                &symbol,
                spot_side,
                spot_qty,
                spot_price,
                spot_fee,
                Some("USDT"),
                &decision_json,
            )
            .await?;
        let perp_leg = self
            .place_leg(
                user_id,
                mode,
                plan_id,
                "perp",
                AccountType::Perp,
                &symbol,
                perp_side,
                perp_qty,
                perp_price,
                perp_fee,
                Some("USDT"),
                &decision_json,
            )
            .await?;

        Ok(vec![spot_leg, perp_leg])
    }

    async fn execute_triangular(
        &self,
        user_id: Uuid,
        decision: &Decision,
        mode: TradingMode,
        plan_id: Uuid,
    ) -> OmsResult<Vec<PlacedLeg>> {
        let Opportunity::Triangular { symbols, path, .. } = &decision.raw_opportunity else {
            return Err(OmsError::invalid("decision is not triangular"));
        };
        if symbols.len() != 3 {
            return Err(OmsError::invalid("invalid triangular opportunity"));
        }
        let currencies: Vec<String> = path.split("->").map(|p| p.trim().to_string()).collect();
        if currencies.len() != 4 || currencies.iter().any(String::is_empty) {
            return Err(OmsError::invalid("invalid triangular path"));
        }

        let decision_json = serde_json::to_value(decision).unwrap_or(serde_json::Value::Null);
        let mut current_amount = decision.estimated_exposure;
        let mut placed = Vec::with_capacity(3);

        for i in 0..3 {
            let u = &currencies[i];
            let v = &currencies[i + 1];
            let symbol = &symbols[i];
            let Some((base, quote)) = crate::util::split_symbol(symbol) else {
                return Err(OmsError::invalid(format!("bad symbol: {symbol}")));
            };

            let ex = &self.settings.exchange_id;
            let tob = self
                .repo
                .get_orderbook_tob(ex, symbol)
                .await
                .map_err(OmsError::Storage)?;
            let bba = self
                .repo
                .get_best_bid_ask(ex, symbol, AccountType::Spot)
                .await
                .map_err(OmsError::Storage)?;

            let (side, price, qty, fee) = if &quote == u && &base == v {
                // Spend quote to buy base.
                let ask = tob.best_ask_price.or(bba.ask).or(bba.last);
                let Some(price) = ask.filter(|p| *p > Decimal::ZERO) else {
                    return Err(OmsError::transient("missing spot ask"));
                };
                let qty = (current_amount / price).round_dp(8);
                let fee = (current_amount * self.settings.spot_fee_rate).round_dp(8);
                current_amount = (current_amount - fee) / price;
                (OrderSide::Buy, price, qty, fee)
            } else if &base == u && &quote == v {
                // Sell base into quote.
                let bid = tob.best_bid_price.or(bba.bid).or(bba.last);
                let Some(price) = bid.filter(|p| *p > Decimal::ZERO) else {
                    return Err(OmsError::transient("missing spot bid"));
                };
                let qty = current_amount.round_dp(8);
                let fee = (current_amount * price * self.settings.spot_fee_rate).round_dp(8);
                current_amount = (current_amount * price) - fee;
                (OrderSide::Sell, price, qty, fee)
            } else {
                return Err(OmsError::invalid("triangular symbol/path mismatch"));
            };

            let leg_id = format!("leg{}", i + 1);
            let leg = self
                .place_leg(
                    user_id,
                    mode,
                    plan_id,
                    &leg_id,
                    AccountType::Spot,
                    symbol,
                    side,
                    qty,
                    price,
                    fee,
                    Some(quote.as_str()),
                    &decision_json,
                )
                .await?;
            placed.push(leg);
        }

        Ok(placed)
    }

    /// Persist one leg order, then execute it: paper fills synthetically at
    /// the reference price, live goes through the exchange adapter.
    #[allow(clippy::too_many_arguments)]
    async fn place_leg(
        &self,
        user_id: Uuid,
        mode: TradingMode,
        plan_id: Uuid,
        leg_id: &str,
        account_type: AccountType,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        ref_price: Decimal,
        paper_fee: Decimal,
        paper_fee_currency: Option<&str>,
        decision_json: &serde_json::Value,
    ) -> OmsResult<PlacedLeg> {
        let client_order_id = format!("{plan_id}-{leg_id}");
        let order_id = self
            .db
            .create_order(
                mode,
                &NewOrder {
                    user_id,
                    plan_id: Some(plan_id),
                    leg_id: Some(leg_id.to_string()),
                    exchange_id: self.settings.exchange_id.clone(),
                    account_type,
                    symbol: symbol.to_string(),
                    side,
                    order_type: OrderType::Market,
                    quantity,
                    price: None,
                    client_order_id: Some(client_order_id.clone()),
                    external_order_id: None,
                    metadata: json!({
                        "ref_price": ref_price.to_string(),
                        "decision": decision_json,
                    }),
                },
            )
            .await
            .map_err(OmsError::Storage)?;

        match mode {
            TradingMode::Paper => {
                self.db
                    .update_order_status(
                        mode,
                        order_id,
                        &OrderStatusUpdate {
                            status: OrderStatus::Filled,
                            filled_quantity: Some(quantity),
                            average_price: Some(ref_price),
                            fee: Some(paper_fee),
                            fee_currency: paper_fee_currency.map(String::from),
                            external_order_id: None,
                        },
                    )
                    .await
                    .map_err(OmsError::Storage)?;
                let fill = Fill {
                    id: Uuid::new_v4(),
                    user_id,
                    order_id,
                    exchange_id: self.settings.exchange_id.clone(),
                    account_type,
                    symbol: symbol.to_string(),
                    price: ref_price,
                    quantity,
                    fee: paper_fee,
                    fee_currency: paper_fee_currency.map(String::from),
                    external_trade_id: None,
                    external_order_id: None,
                    raw: json!({}),
                    created_at: now_ms(),
                };
                apply_fill(&self.db, mode, &fill, side)
                    .await
                    .map_err(OmsError::Storage)?;
            }
            TradingMode::Live => {
                let safe_id = safe_client_order_id(&client_order_id);
                let mut last_err: Option<anyhow::Error> = None;
                let mut venue_order = None;
                for venue_symbol in self.try_symbols(account_type, symbol) {
                    match self
                        .adapter
                        .create_market_order(
                            account_type,
                            &venue_symbol,
                            side,
                            quantity,
                            Some(&safe_id),
                        )
                        .await
                    {
                        Ok(order) => {
                            venue_order = Some(order);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                let venue_order = venue_order.ok_or_else(|| {
                    OmsError::transient(format!(
                        "create_market_order failed: {}",
                        last_err
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    ))
                })?;

                let report = extract_execution(&venue_order, quantity);
                self.apply_execution_report(user_id, mode, order_id, account_type, symbol, &report, side)
                    .await?;
            }
        }

        Ok(PlacedLeg {
            order_id,
            leg_id: leg_id.to_string(),
            account_type,
            symbol: symbol.to_string(),
            side,
            quantity,
            average_price: ref_price,
        })
    }

    /// Perp symbols may need the settle suffix on the wire; try that first,
    /// then the plain form.
    fn try_symbols(&self, account_type: AccountType, symbol: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if account_type == AccountType::Perp
            && !symbol.contains(':')
            && symbol.ends_with("/USDT")
        {
            out.push(format!("{symbol}:USDT"));
        }
        out.push(symbol.to_string());
        out
    }

    /// Write the extractor's view into the order row and create any missing
    /// fills (deduplicated by external trade id inside the projector).
    async fn apply_execution_report(
        &self,
        user_id: Uuid,
        mode: TradingMode,
        order_id: Uuid,
        account_type: AccountType,
        symbol: &str,
        report: &super::extract::ExecutionReport,
        side: OrderSide,
    ) -> OmsResult<()> {
        self.db
            .update_order_status(
                mode,
                order_id,
                &OrderStatusUpdate {
                    status: report.status,
                    filled_quantity: Some(report.filled_quantity),
                    average_price: Some(report.average_price),
                    fee: Some(report.fee),
                    fee_currency: report.fee_currency.clone(),
                    external_order_id: Some(report.external_order_id.clone()),
                },
            )
            .await
            .map_err(OmsError::Storage)?;

        let mut fills = report.fills.clone();
        if fills.is_empty()
            && report.filled_quantity > Decimal::ZERO
            && report.average_price > Decimal::ZERO
        {
            // No per-trade data: book one summary fill with a deterministic
            // id so refresh replays stay deduplicated.
            fills.push(super::extract::FillReport {
                price: report.average_price,
                quantity: report.filled_quantity,
                fee: report.fee,
                fee_currency: report.fee_currency.clone(),
                external_trade_id: synthetic_trade_id(
                    &report.external_order_id,
                    0,
                    report.average_price,
                    report.filled_quantity,
                    report.fee,
                    report.fee_currency.as_deref(),
                    None,
                ),
                raw: json!({}),
            });
        }

        for f in fills {
            let fill = Fill {
                id: Uuid::new_v4(),
                user_id,
                order_id,
                exchange_id: self.settings.exchange_id.clone(),
                account_type,
                symbol: symbol.to_string(),
                price: f.price,
                quantity: f.quantity,
                fee: f.fee,
                fee_currency: f.fee_currency.clone(),
                external_trade_id: Some(f.external_trade_id.clone()),
                external_order_id: Some(report.external_order_id.clone()),
                raw: f.raw.clone(),
                created_at: now_ms(),
            };
            apply_fill(&self.db, mode, &fill, side)
                .await
                .map_err(OmsError::Storage)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Order-level operations
    // ------------------------------------------------------------------

    async fn owned_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        mode: TradingMode,
    ) -> OmsResult<Order> {
        let order = self
            .db
            .get_order(mode, order_id)
            .await
            .map_err(OmsError::Storage)?
            .ok_or_else(|| OmsError::not_found("order not found"))?;
        if order.user_id != user_id {
            return Err(OmsError::denied("order does not belong to user"));
        }
        Ok(order)
    }

    pub async fn refresh_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
    ) -> OmsResult<Order> {
        self.check_mode(mode, confirm_live)?;
        let order = self.owned_order(user_id, order_id, mode).await?;

        if mode == TradingMode::Paper {
            return Ok(order);
        }

        let external_order_id = order
            .external_order_id
            .clone()
            .ok_or_else(|| OmsError::invalid("missing external_order_id"))?;

        let mut last_err: Option<anyhow::Error> = None;
        let mut venue_order = None;
        for venue_symbol in self.try_symbols(order.account_type, &order.symbol) {
            match self
                .adapter
                .fetch_order(order.account_type, &external_order_id, &venue_symbol)
                .await
            {
                Ok(o) => {
                    venue_order = Some(o);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let venue_order = venue_order.ok_or_else(|| {
            OmsError::transient(format!(
                "fetch_order failed: {}",
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ))
        })?;

        let report = extract_execution(&venue_order, order.quantity);
        self.apply_execution_report(
            user_id,
            mode,
            order_id,
            order.account_type,
            &order.symbol,
            &report,
            order.side,
        )
        .await?;

        self.db
            .get_order(mode, order_id)
            .await
            .map_err(OmsError::Storage)?
            .ok_or_else(|| OmsError::not_found("order not found"))
    }

    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
    ) -> OmsResult<Order> {
        self.check_mode(mode, confirm_live)?;
        let order = self.owned_order(user_id, order_id, mode).await?;

        if mode == TradingMode::Paper {
            self.db
                .update_order_status(
                    mode,
                    order_id,
                    &OrderStatusUpdate::status_only(OrderStatus::Cancelled),
                )
                .await
                .map_err(OmsError::Storage)?;
            return self
                .db
                .get_order(mode, order_id)
                .await
                .map_err(OmsError::Storage)?
                .ok_or_else(|| OmsError::not_found("order not found"));
        }

        let external_order_id = order
            .external_order_id
            .clone()
            .ok_or_else(|| OmsError::invalid("missing external_order_id"))?;

        let mut last_err: Option<anyhow::Error> = None;
        let mut cancelled = false;
        for venue_symbol in self.try_symbols(order.account_type, &order.symbol) {
            match self
                .adapter
                .cancel_order(order.account_type, &external_order_id, &venue_symbol)
                .await
            {
                Ok(()) => {
                    cancelled = true;
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        if !cancelled {
            return Err(OmsError::transient(format!(
                "cancel_order failed: {}",
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )));
        }

        self.refresh_order(user_id, order_id, mode, confirm_live).await
    }

    // ------------------------------------------------------------------
    // Plan-level operations
    // ------------------------------------------------------------------

    pub async fn refresh_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
        limit: usize,
    ) -> OmsResult<PlanSweep> {
        self.check_mode(mode, confirm_live)?;
        let orders = self
            .db
            .get_orders_by_plan(mode, user_id, plan_id, limit)
            .await
            .map_err(OmsError::Storage)?;

        if mode == TradingMode::Paper {
            let stats = OpStats {
                total: orders.len() as u32,
                ok: orders.len() as u32,
                skipped: 0,
                failed: 0,
            };
            return Ok(PlanSweep {
                orders,
                results: Vec::new(),
                stats,
            });
        }

        let mut refreshed = Vec::with_capacity(orders.len());
        let mut results = Vec::new();
        let mut stats = OpStats::default();
        for order in orders {
            stats.total += 1;
            if order.status.is_terminal() {
                stats.ok += 1;
                stats.skipped += 1;
                results.push(CompensationResult {
                    order_id: order.id,
                    ok: true,
                    skipped: Some(true),
                    error: None,
                });
                refreshed.push(order);
                continue;
            }
            match self
                .refresh_order(user_id, order.id, mode, confirm_live)
                .await
            {
                Ok(updated) => {
                    stats.ok += 1;
                    results.push(CompensationResult {
                        order_id: updated.id,
                        ok: true,
                        skipped: None,
                        error: None,
                    });
                    refreshed.push(updated);
                }
                Err(e) => {
                    stats.failed += 1;
                    results.push(CompensationResult {
                        order_id: order.id,
                        ok: false,
                        skipped: None,
                        error: Some(e.to_string()),
                    });
                    refreshed.push(order);
                }
            }
        }

        Ok(PlanSweep {
            orders: refreshed,
            results,
            stats,
        })
    }

    pub async fn cancel_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
        limit: usize,
    ) -> OmsResult<PlanSweep> {
        self.check_mode(mode, confirm_live)?;
        let orders = self
            .db
            .get_orders_by_plan(mode, user_id, plan_id, limit)
            .await
            .map_err(OmsError::Storage)?;

        let mut swept = Vec::with_capacity(orders.len());
        let mut results = Vec::new();
        let mut stats = OpStats::default();
        let mut failures: Vec<String> = Vec::new();

        for order in orders {
            stats.total += 1;
            if order.status.is_terminal() {
                stats.ok += 1;
                stats.skipped += 1;
                results.push(CompensationResult {
                    order_id: order.id,
                    ok: true,
                    skipped: Some(true),
                    error: None,
                });
                swept.push(order);
                continue;
            }
            match self
                .cancel_order(user_id, order.id, mode, confirm_live)
                .await
            {
                Ok(updated) => {
                    stats.ok += 1;
                    results.push(CompensationResult {
                        order_id: updated.id,
                        ok: true,
                        skipped: None,
                        error: None,
                    });
                    swept.push(updated);
                }
                Err(e) => {
                    stats.failed += 1;
                    failures.push(e.to_string());
                    results.push(CompensationResult {
                        order_id: order.id,
                        ok: false,
                        skipped: None,
                        error: Some(e.to_string()),
                    });
                    swept.push(order);
                }
            }
        }

        let error_message = (!failures.is_empty()).then(|| {
            failures
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ")
        });
        self.db
            .update_plan_status(
                mode,
                plan_id,
                PlanStatus::Cancelled,
                error_message.as_deref(),
            )
            .await
            .map_err(OmsError::Storage)?;

        Ok(PlanSweep {
            orders: swept,
            results,
            stats,
        })
    }

    /// Live post-execution polling: refresh until terminal or the round
    /// budget runs out.
    async fn poll_plan_until_terminal(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
    ) -> OmsResult<(PollSummary, PlanSweep)> {
        let max_rounds = self.settings.post_exec_poll_max_rounds;
        let sleep_ms = self.settings.post_exec_poll_sleep_ms;
        let limit = self.settings.post_exec_poll_limit;

        let mut rounds: Vec<PollRound> = Vec::new();
        let mut last: Option<PlanSweep> = None;
        let mut terminal = false;
        let mut rejected = false;
        let mut counts = StatusCounts::new();

        for i in 0..max_rounds {
            if i > 0 && sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            let sweep = self
                .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
                .await?;
            counts = status_counts(&sweep.orders);
            terminal = sweep.orders.iter().all(|o| o.status.is_terminal());
            rejected = sweep
                .orders
                .iter()
                .any(|o| o.status == OrderStatus::Rejected);
            rounds.push(PollRound {
                round: i + 1,
                status_counts: counts.clone(),
                terminal,
                rejected,
            });
            last = Some(sweep);
            if terminal {
                break;
            }
        }

        let reason = if !terminal {
            Some(format!(
                "max_rounds_exhausted (max_rounds={max_rounds}, rounds={})",
                rounds.len()
            ))
        } else if rejected {
            Some("rejected".to_string())
        } else {
            None
        };

        let summary = PollSummary {
            plan_id,
            terminal,
            rejected,
            rounds: rounds.len() as u32,
            max_rounds,
            sleep_ms,
            last_status_counts: counts.clone(),
            orders_summary: OrdersSummary::from_counts(&counts, true),
            reason,
        };
        let last = last.ok_or_else(|| OmsError::Storage(anyhow!("no poll rounds executed")))?;
        Ok((summary, last))
    }

    pub(crate) fn default_reconcile_request(
        &self,
        plan_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
    ) -> ReconcileRequest {
        ReconcileRequest {
            plan_id,
            trading_mode: mode,
            confirm_live,
            limit: self.settings.reconcile_default_limit,
            max_rounds: self.settings.reconcile_default_max_rounds,
            sleep_ms: self.settings.reconcile_default_sleep_ms,
            auto_cancel: self.settings.reconcile_default_auto_cancel,
            max_age_seconds: self.settings.reconcile_default_max_age_seconds,
        }
    }

    // ------------------------------------------------------------------
    // Read-only getters
    // ------------------------------------------------------------------

    pub async fn get_execution_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
    ) -> OmsResult<ExecutionPlan> {
        self.db
            .get_plan(mode, user_id, plan_id)
            .await
            .map_err(OmsError::Storage)?
            .ok_or_else(|| OmsError::not_found("plan not found"))
    }

    pub async fn get_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        mode: TradingMode,
    ) -> OmsResult<Order> {
        self.owned_order(user_id, order_id, mode).await
    }

    pub async fn get_plan_orders(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
        limit: usize,
    ) -> OmsResult<Vec<Order>> {
        self.db
            .get_orders_by_plan(mode, user_id, plan_id, limit)
            .await
            .map_err(OmsError::Storage)
    }

    pub async fn get_plan_fills(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
    ) -> OmsResult<Vec<Fill>> {
        let orders = self
            .db
            .get_orders_by_plan(mode, user_id, plan_id, 1000)
            .await
            .map_err(OmsError::Storage)?;
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        self.db
            .get_fills_for_orders(mode, &ids)
            .await
            .map_err(OmsError::Storage)
    }
}

pub(crate) fn status_counts(orders: &[Order]) -> StatusCounts {
    let mut counts = StatusCounts::new();
    for order in orders {
        *counts.entry(order.status.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}
