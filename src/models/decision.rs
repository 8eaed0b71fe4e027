//! Ranked execution decisions emitted by the decision service.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::opportunity::Opportunity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyType {
    #[serde(rename = "triangular")]
    Triangular,
    #[serde(rename = "cashcarry")]
    CashCarry,
}

impl StrategyType {
    /// Key used in persisted strategy routing configs.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::Triangular => "triangular",
            Self::CashCarry => "funding_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    Range,
    Uptrend,
    Downtrend,
    Stress,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Range => "RANGE",
            Self::Uptrend => "UPTREND",
            Self::Downtrend => "DOWNTREND",
            Self::Stress => "STRESS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One executable decision; sorted-set score is `risk_score` (lower = better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub strategy_type: StrategyType,
    pub exchange: String,
    /// Main (exposure-carrying) symbol.
    pub symbol: String,
    /// `triangular`, or the cash-and-carry direction string.
    pub direction: String,
    pub expected_profit_rate: Decimal,
    pub estimated_exposure: Decimal,
    /// In [0,1], lower is better; divided by the routing weight when routed.
    pub risk_score: f64,
    /// In [0,1]; freshness-weighted.
    pub confidence: f64,
    pub timestamp: i64,
    pub raw_opportunity: Opportunity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<MarketRegime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_weight: Option<f64>,
}

impl Decision {
    pub fn base(&self) -> String {
        crate::util::base_currency(&self.symbol)
    }
}
