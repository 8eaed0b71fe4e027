//! Uniform execution report extracted from venue order records.
//!
//! Whatever shape the venue returns, the OMS consumes one normalized report:
//! status, filled quantity, VWAP, summed fees, and per-trade fills with
//! deduplicatable trade ids. Trades without a venue id get a deterministic
//! synthetic id so refresh replays never duplicate fills.

use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::exchange::ExchangeOrder;
use crate::models::OrderStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub external_trade_id: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_price: Decimal,
    pub fee: Decimal,
    /// Set only when every fill shares one fee currency.
    pub fee_currency: Option<String>,
    pub external_order_id: String,
    pub fills: Vec<FillReport>,
}

/// Normalize a venue order into an [`ExecutionReport`].
///
/// With per-trade data: filled = sum of quantities, average = VWAP, fee = sum.
/// Without: fall back to the order's filled/average, deriving the average
/// from cost when needed.
pub fn extract_execution(order: &ExchangeOrder, quantity_fallback: Decimal) -> ExecutionReport {
    let external_order_id = order.id.clone();

    let mut fills = Vec::with_capacity(order.trades.len());
    for (index, trade) in order.trades.iter().enumerate() {
        let external_trade_id = match &trade.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => synthetic_trade_id(
                &external_order_id,
                index,
                trade.price,
                trade.quantity,
                trade.fee,
                trade.fee_currency.as_deref(),
                trade.timestamp,
            ),
        };
        fills.push(FillReport {
            price: trade.price.round_dp(8),
            quantity: trade.quantity.round_dp(8),
            fee: trade.fee.round_dp(8),
            fee_currency: trade.fee_currency.clone(),
            external_trade_id,
            raw: trade.raw.clone(),
        });
    }

    let (filled, average, fee, fee_currency) = if fills.is_empty() {
        let filled = order
            .filled
            .or(order.amount)
            .unwrap_or(quantity_fallback)
            .round_dp(8);
        let average = order
            .average
            .or(order.price)
            .or_else(|| {
                order.cost.and_then(|cost| {
                    (filled > Decimal::ZERO).then(|| cost / filled)
                })
            })
            .unwrap_or(Decimal::ZERO)
            .round_dp(8);
        (
            filled,
            average,
            order.fee.unwrap_or(Decimal::ZERO).round_dp(8),
            order.fee_currency.clone(),
        )
    } else {
        let filled: Decimal = fills.iter().map(|f| f.quantity).sum();
        let average = if filled > Decimal::ZERO {
            (fills
                .iter()
                .map(|f| f.price * f.quantity)
                .sum::<Decimal>()
                / filled)
                .round_dp(8)
        } else {
            Decimal::ZERO
        };
        let fee: Decimal = fills.iter().map(|f| f.fee).sum();
        let currencies: std::collections::HashSet<&str> = fills
            .iter()
            .filter_map(|f| f.fee_currency.as_deref())
            .collect();
        let fee_currency = (currencies.len() == 1)
            .then(|| currencies.into_iter().next().map(String::from))
            .flatten();
        (filled.round_dp(8), average, fee.round_dp(8), fee_currency)
    };

    let status = map_status(order.status.as_deref(), filled);

    ExecutionReport {
        status,
        filled_quantity: filled,
        average_price: average,
        fee,
        fee_currency,
        external_order_id,
        fills,
    }
}

fn map_status(venue_status: Option<&str>, filled: Decimal) -> OrderStatus {
    match venue_status.unwrap_or("closed").to_ascii_lowercase().as_str() {
        "closed" | "filled" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => {
            if filled > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Pending
            }
        }
    }
}

/// Deterministic substitute for a missing venue trade id: a SHA-256 over the
/// identifying fields, stable under replay.
pub fn synthetic_trade_id(
    external_order_id: &str,
    index: usize,
    price: Decimal,
    quantity: Decimal,
    fee: Decimal,
    fee_currency: Option<&str>,
    timestamp: Option<i64>,
) -> String {
    let seed = json!({
        "external_order_id": external_order_id,
        "i": index,
        "price": price.to_string(),
        "quantity": quantity.to_string(),
        "fee": fee.to_string(),
        "fee_currency": fee_currency,
        "ts": timestamp,
    });
    let digest = hex::encode(Sha256::digest(seed.to_string().as_bytes()));
    format!("synthetic:{external_order_id}:{digest}")
}

/// Client order ids must survive venue constraints: short alphanumerics pass
/// through, anything else collapses to a hashed form.
pub fn safe_client_order_id(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }
    let plain = v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if v.len() <= 32 && plain {
        return v.to_string();
    }
    let digest = hex::encode(Sha256::digest(v.as_bytes()));
    format!("inarbit-{}", &digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeTrade;

    fn trade(id: Option<&str>, price: i64, qty: &str, fee: &str) -> ExchangeTrade {
        ExchangeTrade {
            id: id.map(String::from),
            price: Decimal::from(price),
            quantity: qty.parse().unwrap(),
            fee: fee.parse().unwrap(),
            fee_currency: Some("USDT".into()),
            timestamp: Some(1_700_000_000_000),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn vwap_and_fee_sum_over_trades() {
        let order = ExchangeOrder {
            id: "42".into(),
            status: Some("closed".into()),
            trades: vec![
                trade(Some("t1"), 100, "1", "0.1"),
                trade(Some("t2"), 110, "1", "0.1"),
            ],
            ..ExchangeOrder::default()
        };
        let report = extract_execution(&order, Decimal::from(2));
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.filled_quantity, Decimal::from(2));
        assert_eq!(report.average_price, Decimal::from(105));
        assert_eq!(report.fee, "0.2".parse::<Decimal>().unwrap());
        assert_eq!(report.fee_currency.as_deref(), Some("USDT"));
    }

    #[test]
    fn missing_trade_ids_get_stable_synthetic_ids() {
        let order = ExchangeOrder {
            id: "42".into(),
            status: Some("closed".into()),
            trades: vec![trade(None, 100, "1", "0.1")],
            ..ExchangeOrder::default()
        };
        let a = extract_execution(&order, Decimal::ONE);
        let b = extract_execution(&order, Decimal::ONE);
        assert!(a.fills[0].external_trade_id.starts_with("synthetic:42:"));
        assert_eq!(a.fills[0].external_trade_id, b.fills[0].external_trade_id);

        // Different trade contents produce different ids.
        let other = ExchangeOrder {
            id: "42".into(),
            status: Some("closed".into()),
            trades: vec![trade(None, 101, "1", "0.1")],
            ..ExchangeOrder::default()
        };
        let c = extract_execution(&other, Decimal::ONE);
        assert_ne!(a.fills[0].external_trade_id, c.fills[0].external_trade_id);
    }

    #[test]
    fn no_trades_falls_back_to_order_fields() {
        let order = ExchangeOrder {
            id: "7".into(),
            status: Some("closed".into()),
            filled: Some(Decimal::from(3)),
            cost: Some(Decimal::from(300)),
            ..ExchangeOrder::default()
        };
        let report = extract_execution(&order, Decimal::from(3));
        assert_eq!(report.filled_quantity, Decimal::from(3));
        // average derived from cost / filled
        assert_eq!(report.average_price, Decimal::from(100));
        assert!(report.fills.is_empty());
    }

    #[test]
    fn open_with_partial_fill_maps_to_partially_filled() {
        let order = ExchangeOrder {
            id: "7".into(),
            status: Some("open".into()),
            filled: Some(Decimal::ONE),
            amount: Some(Decimal::from(2)),
            average: Some(Decimal::from(100)),
            ..ExchangeOrder::default()
        };
        let report = extract_execution(&order, Decimal::from(2));
        assert_eq!(report.status, OrderStatus::PartiallyFilled);

        let untouched = ExchangeOrder {
            id: "8".into(),
            status: Some("open".into()),
            filled: Some(Decimal::ZERO),
            amount: Some(Decimal::from(2)),
            ..ExchangeOrder::default()
        };
        let report = extract_execution(&untouched, Decimal::from(2));
        assert_eq!(report.status, OrderStatus::Pending);
    }

    #[test]
    fn client_order_ids_are_sanitized() {
        assert_eq!(safe_client_order_id("plan-1-spot"), "plan-1-spot");
        let long = "d2719f5e-1d91-4bfa-a051-123456789abc-leg1-overflow";
        let safe = safe_client_order_id(long);
        assert!(safe.starts_with("inarbit-"));
        assert_eq!(safe.len(), "inarbit-".len() + 24);
        assert_eq!(safe, safe_client_order_id(long));
    }
}
