//! Positions, ledger entries, and PnL records projected from fills.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::AccountType;

/// Signed position per `(user, exchange, account_type, instrument)`.
///
/// `avg_price` is null iff `quantity` is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub user_id: Uuid,
    pub exchange_id: String,
    pub account_type: AccountType,
    /// Base asset for spot, the symbol itself for perp.
    pub instrument: String,
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub updated_at: i64,
}

/// Append-only asset movement; one fill yields one entry per touched asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_id: String,
    pub account_type: AccountType,
    pub asset: String,
    pub delta: Decimal,
    /// `fill` for trade cashflows, `fee` for third-asset fee deductions.
    pub ref_type: String,
    pub ref_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// One realized-PnL row per completed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_id: String,
    pub symbol: String,
    pub profit: Decimal,
    pub profit_rate: Option<Decimal>,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// Plan-level PnL estimate computed from fills; also the `pnl_summary` leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPnl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_currency: Option<String>,
    /// `net_notional - total_fee`, where sells add and buys subtract.
    pub profit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_rate: Option<Decimal>,
    pub total_notional: Decimal,
    pub total_fee: Decimal,
    pub symbols: Vec<String>,
}
