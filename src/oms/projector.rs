//! Position and ledger projection, applied as a side-effect of every fill.
//!
//! The arithmetic is pure and unit-tested in isolation; [`apply_fill`] runs
//! the fill insert and all projection writes inside one transaction so a
//! replayed fetch either lands completely or not at all.

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::models::{AccountType, Fill, LedgerEntry, OrderSide, TradingMode};
use crate::store::db::{
    adjust_simulation_balance_tx, fill_exists_in_tx, get_position_tx, insert_fill_tx,
    insert_ledger_tx, set_position_tx,
};
use crate::store::Database;
use crate::util::{now_ms, split_symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionState {
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

impl PositionState {
    pub const FLAT: Self = Self {
        quantity: Decimal::ZERO,
        avg_price: None,
    };
}

/// Average-entry bookkeeping: same-direction adds are volume-weighted, a sign
/// flip resets to the fill price, a net reduction keeps the old average, and
/// a flat position has no average at all.
pub fn next_position(old: PositionState, delta_qty: Decimal, price: Decimal) -> PositionState {
    let new_qty = old.quantity + delta_qty;
    let avg_price = if new_qty == Decimal::ZERO {
        None
    } else if old.quantity == Decimal::ZERO || old.avg_price.is_none() {
        Some(price)
    } else {
        let old_avg = old.avg_price.unwrap_or(price);
        let same_dir = (old.quantity > Decimal::ZERO && delta_qty > Decimal::ZERO)
            || (old.quantity < Decimal::ZERO && delta_qty < Decimal::ZERO);
        let flipped = (old.quantity > Decimal::ZERO && new_qty < Decimal::ZERO)
            || (old.quantity < Decimal::ZERO && new_qty > Decimal::ZERO);
        if same_dir {
            Some(
                (old.quantity.abs() * old_avg + delta_qty.abs() * price) / new_qty.abs(),
            )
        } else if flipped {
            Some(price)
        } else {
            Some(old_avg)
        }
    };
    PositionState {
        quantity: new_qty,
        avg_price,
    }
}

/// Asset movements of a spot fill: base against quote, with the fee deducted
/// from whichever of the two it is denominated in.
pub fn spot_fill_deltas(
    side: OrderSide,
    price: Decimal,
    quantity: Decimal,
    fee: Decimal,
    fee_currency: Option<&str>,
    base: &str,
    quote: &str,
) -> (Decimal, Decimal) {
    let mut base_delta = match side {
        OrderSide::Buy => quantity,
        OrderSide::Sell => -quantity,
    };
    let mut quote_delta = match side {
        OrderSide::Buy => -(price * quantity),
        OrderSide::Sell => price * quantity,
    };
    match fee_currency {
        Some(c) if c == base => base_delta -= fee,
        Some(c) if c == quote => quote_delta -= fee,
        _ => {}
    }
    (base_delta, quote_delta)
}

/// Insert `fill` and project positions, ledger entries, and (paper-mode spot)
/// the simulation balance. Returns `None` when the external trade id was
/// already recorded.
pub async fn apply_fill(
    db: &Database,
    mode: TradingMode,
    fill: &Fill,
    side: OrderSide,
) -> Result<Option<Uuid>> {
    let fill = fill.clone();
    db.with_tx(move |tx| {
        if let Some(trade_id) = fill.external_trade_id.as_deref() {
            if fill_exists_in_tx(tx, mode, trade_id)? {
                return Ok(None);
            }
        }
        insert_fill_tx(tx, mode, &fill)?;

        let ledger_meta = json!({
            "symbol": fill.symbol,
            "side": side.as_str(),
            "price": fill.price.to_string(),
            "quantity": fill.quantity.to_string(),
        });
        let ledger = |asset: &str, delta: Decimal, ref_type: &str| LedgerEntry {
            id: Uuid::new_v4(),
            user_id: fill.user_id,
            exchange_id: fill.exchange_id.clone(),
            account_type: fill.account_type,
            asset: asset.to_string(),
            delta,
            ref_type: ref_type.to_string(),
            ref_id: fill.order_id,
            metadata: ledger_meta.clone(),
            created_at: now_ms(),
        };

        match fill.account_type {
            AccountType::Spot => {
                let Some((base, quote)) = split_symbol(&fill.symbol) else {
                    return Ok(Some(fill.id));
                };
                let (base_delta, quote_delta) = spot_fill_deltas(
                    side,
                    fill.price,
                    fill.quantity,
                    fill.fee,
                    fill.fee_currency.as_deref(),
                    &base,
                    &quote,
                );

                let old = get_position_tx(
                    tx,
                    mode,
                    fill.user_id,
                    &fill.exchange_id,
                    AccountType::Spot,
                    &base,
                )?
                .map(|p| PositionState {
                    quantity: p.quantity,
                    avg_price: p.avg_price,
                })
                .unwrap_or(PositionState::FLAT);
                let next = next_position(old, base_delta, fill.price);
                set_position_tx(
                    tx,
                    mode,
                    fill.user_id,
                    &fill.exchange_id,
                    AccountType::Spot,
                    &base,
                    next.quantity,
                    next.avg_price,
                )?;

                if base_delta != Decimal::ZERO {
                    insert_ledger_tx(tx, mode, &ledger(&base, base_delta, "fill"))?;
                }
                if quote_delta != Decimal::ZERO {
                    insert_ledger_tx(tx, mode, &ledger(&quote, quote_delta, "fill"))?;
                }
                if fill.fee > Decimal::ZERO {
                    if let Some(fee_currency) = fill.fee_currency.as_deref() {
                        if fee_currency != base && fee_currency != quote {
                            insert_ledger_tx(
                                tx,
                                mode,
                                &ledger(fee_currency, -fill.fee, "fee"),
                            )?;
                        }
                    }
                }

                if mode == TradingMode::Paper {
                    adjust_simulation_balance_tx(tx, fill.user_id, &quote, quote_delta)?;
                }
            }
            AccountType::Perp => {
                let delta = match side {
                    OrderSide::Buy => fill.quantity,
                    OrderSide::Sell => -fill.quantity,
                };
                let old = get_position_tx(
                    tx,
                    mode,
                    fill.user_id,
                    &fill.exchange_id,
                    AccountType::Perp,
                    &fill.symbol,
                )?
                .map(|p| PositionState {
                    quantity: p.quantity,
                    avg_price: p.avg_price,
                })
                .unwrap_or(PositionState::FLAT);
                let next = next_position(old, delta, fill.price);
                set_position_tx(
                    tx,
                    mode,
                    fill.user_id,
                    &fill.exchange_id,
                    AccountType::Perp,
                    &fill.symbol,
                    next.quantity,
                    next.avg_price,
                )?;

                if fill.fee > Decimal::ZERO {
                    if let Some(fee_currency) = fill.fee_currency.as_deref() {
                        insert_ledger_tx(tx, mode, &ledger(fee_currency, -fill.fee, "fee"))?;
                    }
                }
            }
        }

        Ok(Some(fill.id))
    })
    .await
}
