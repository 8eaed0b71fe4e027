//! Plan-level realized PnL: computed from fills, recorded once per plan.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::models::{Fill, Order, OrderSide, PlanKind, PlanLeg, PlanPnl, PnlRecord, TradingMode};
use crate::store::{keys, Database, KvStore};
use crate::util::now_ms;

const PNL_MARKER_TTL: Duration = Duration::from_secs(3600);

/// Sum fills into a plan PnL estimate: sells add notional, buys subtract,
/// fees come off the top. `None` when there are no fills.
pub fn estimate_plan_pnl(orders: &[Order], fills: &[Fill]) -> Option<PlanPnl> {
    if fills.is_empty() {
        return None;
    }

    let side_by_order: HashMap<Uuid, OrderSide> =
        orders.iter().map(|o| (o.id, o.side)).collect();

    let mut net_notional = Decimal::ZERO;
    let mut total_abs = Decimal::ZERO;
    let mut total_fee = Decimal::ZERO;
    let mut symbols: BTreeSet<String> = BTreeSet::new();
    let mut quotes: BTreeSet<String> = BTreeSet::new();

    for fill in fills {
        let notional = fill.price * fill.quantity;
        total_fee += fill.fee;
        symbols.insert(fill.symbol.clone());
        if let Some((_, quote)) = crate::util::split_symbol(&fill.symbol) {
            quotes.insert(quote);
        }
        match side_by_order.get(&fill.order_id) {
            Some(OrderSide::Buy) => {
                net_notional -= notional;
                total_abs += notional.abs();
            }
            Some(OrderSide::Sell) => {
                net_notional += notional;
                total_abs += notional.abs();
            }
            None => {}
        }
    }

    let profit = net_notional - total_fee;
    let profit_rate = (total_abs > Decimal::ZERO).then(|| (profit / total_abs).round_dp(8));
    let quote_currency = (quotes.len() == 1).then(|| quotes.into_iter().next()).flatten();
    let symbol = (symbols.len() == 1)
        .then(|| symbols.iter().next().cloned())
        .flatten();
    let symbols_list = if symbol.is_some() {
        Vec::new()
    } else {
        symbols.into_iter().collect()
    };

    Some(PlanPnl {
        symbol,
        quote_currency,
        profit,
        profit_rate,
        total_notional: total_abs,
        total_fee,
        symbols: symbols_list,
    })
}

/// Record the plan's PnL row and append the `pnl_summary` leg, guarded by a
/// KV marker so completion paths never double-book.
pub async fn record_plan_pnl(
    db: &Database,
    kv: &Arc<dyn KvStore>,
    user_id: Uuid,
    plan_id: Uuid,
    mode: TradingMode,
    kind: PlanKind,
    exchange_id: &str,
) -> Result<()> {
    let marker = keys::pnl_plan_marker(mode.as_str(), &plan_id.to_string());
    if kv.get(&marker).await?.is_some() {
        return Ok(());
    }

    let orders = db.get_orders_by_plan(mode, user_id, plan_id, 1000).await?;
    let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let fills = db.get_fills_for_orders(mode, &order_ids).await?;

    let Some(estimate) = estimate_plan_pnl(&orders, &fills) else {
        return Ok(());
    };

    let mut metadata = serde_json::to_value(&estimate)?;
    if let Some(map) = metadata.as_object_mut() {
        map.insert("plan_id".to_string(), json!(plan_id.to_string()));
        map.insert("kind".to_string(), json!(kind.as_str()));
        map.insert("trading_mode".to_string(), json!(mode.as_str()));
    }

    db.insert_pnl(
        mode,
        &PnlRecord {
            id: Uuid::new_v4(),
            user_id,
            exchange_id: exchange_id.to_string(),
            symbol: estimate.symbol.clone().unwrap_or_else(|| "MULTI".to_string()),
            profit: estimate.profit,
            profit_rate: estimate.profit_rate,
            metadata,
            created_at: now_ms(),
        },
    )
    .await?;

    kv.set(&marker, "1", Some(PNL_MARKER_TTL)).await?;

    db.append_plan_leg(
        mode,
        plan_id,
        PlanLeg::PnlSummary { summary: estimate },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountType, OrderStatus, OrderType};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn order(id: Uuid, side: OrderSide, symbol: &str) -> Order {
        Order {
            id,
            user_id: Uuid::nil(),
            plan_id: None,
            leg_id: None,
            exchange_id: "binance".into(),
            account_type: AccountType::Spot,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
            status: OrderStatus::Filled,
            filled_quantity: Decimal::ONE,
            average_price: None,
            fee: Decimal::ZERO,
            fee_currency: None,
            client_order_id: None,
            external_order_id: None,
            metadata: serde_json::Value::Null,
            created_at: 0,
            updated_at: 0,
            filled_at: None,
        }
    }

    fn fill(order_id: Uuid, symbol: &str, price: &str, qty: &str, fee: &str) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            order_id,
            exchange_id: "binance".into(),
            account_type: AccountType::Spot,
            symbol: symbol.into(),
            price: dec(price),
            quantity: dec(qty),
            fee: dec(fee),
            fee_currency: Some("USDT".into()),
            external_trade_id: None,
            external_order_id: None,
            raw: serde_json::Value::Null,
            created_at: 0,
        }
    }

    #[test]
    fn profit_is_net_notional_minus_fees() {
        let buy = Uuid::new_v4();
        let sell = Uuid::new_v4();
        let orders = vec![
            order(buy, OrderSide::Buy, "BTC/USDT"),
            order(sell, OrderSide::Sell, "BTC/USDT"),
        ];
        let fills = vec![
            fill(buy, "BTC/USDT", "100", "1", "0.1"),
            fill(sell, "BTC/USDT", "105", "1", "0.1"),
        ];
        let pnl = estimate_plan_pnl(&orders, &fills).unwrap();
        // net = 105 - 100 = 5; fees 0.2 => profit 4.8 on 205 traded
        assert_eq!(pnl.profit, dec("4.8"));
        assert_eq!(pnl.total_fee, dec("0.2"));
        assert_eq!(pnl.total_notional, dec("205"));
        assert_eq!(pnl.profit_rate, Some((dec("4.8") / dec("205")).round_dp(8)));
        assert_eq!(pnl.symbol.as_deref(), Some("BTC/USDT"));
        assert_eq!(pnl.quote_currency.as_deref(), Some("USDT"));
        // Invariant: profit + fees == net notional.
        assert_eq!(pnl.profit + pnl.total_fee, dec("5"));
    }

    #[test]
    fn multi_symbol_plans_report_symbol_list() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let orders = vec![
            order(a, OrderSide::Buy, "ETH/USDT"),
            order(b, OrderSide::Sell, "BTC/USDT"),
        ];
        let fills = vec![
            fill(a, "ETH/USDT", "3000", "1", "1"),
            fill(b, "BTC/USDT", "60000", "0.05", "1"),
        ];
        let pnl = estimate_plan_pnl(&orders, &fills).unwrap();
        assert_eq!(pnl.symbol, None);
        assert_eq!(pnl.symbols, vec!["BTC/USDT", "ETH/USDT"]);
        assert_eq!(pnl.quote_currency.as_deref(), Some("USDT"));
    }

    #[test]
    fn no_fills_yields_no_estimate() {
        assert!(estimate_plan_pnl(&[], &[]).is_none());
    }
}
