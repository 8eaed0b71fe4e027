//! Ranked arbitrage opportunities as serialized into the KV sorted sets.
//!
//! The JSON shape is wire-fixed: readers in any language key off
//! `strategyType` and the camelCase field names below.

use serde::{Deserialize, Serialize};

use crate::util::base_currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashCarryDirection {
    LongSpotShortPerp,
    ShortSpotLongPerp,
}

impl CashCarryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LongSpotShortPerp => "long_spot_short_perp",
            Self::ShortSpotLongPerp => "short_spot_long_perp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategyType")]
pub enum Opportunity {
    #[serde(rename = "triangular", rename_all = "camelCase")]
    Triangular {
        exchange: String,
        /// Human-readable cycle, e.g. `USDT -> BTC -> ETH -> USDT`.
        path: String,
        /// The three pairs traversed, in leg order.
        symbols: Vec<String>,
        /// Net of taker fees on all three legs.
        profit_rate: f64,
        timestamp: i64,
    },
    #[serde(rename = "cashcarry", rename_all = "camelCase")]
    CashCarry {
        exchange: String,
        symbol: String,
        direction: CashCarryDirection,
        /// Executable spot price when buying spot (long basis), else absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spot_ask: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        perp_bid: Option<f64>,
        /// Executable spot price when selling spot (reverse basis), else absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spot_bid: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        perp_ask: Option<f64>,
        spot_price: f64,
        perp_price: f64,
        basis_rate: f64,
        /// Funding carry already scaled by the horizon interval count.
        funding_rate: f64,
        profit_rate: f64,
        timestamp: i64,
    },
}

impl Opportunity {
    pub fn exchange(&self) -> &str {
        match self {
            Self::Triangular { exchange, .. } | Self::CashCarry { exchange, .. } => exchange,
        }
    }

    pub fn profit_rate(&self) -> f64 {
        match self {
            Self::Triangular { profit_rate, .. } | Self::CashCarry { profit_rate, .. } => {
                *profit_rate
            }
        }
    }

    /// Pairs touched by this opportunity, in execution order.
    pub fn symbols(&self) -> Vec<String> {
        match self {
            Self::Triangular { symbols, .. } => symbols.clone(),
            Self::CashCarry { symbol, .. } => vec![symbol.clone()],
        }
    }

    /// The symbol carrying exposure: for triangles, the first non-USDT pair.
    pub fn main_symbol(&self) -> Option<String> {
        match self {
            Self::Triangular { symbols, .. } => symbols
                .iter()
                .find(|s| !s.ends_with("/USDT"))
                .or_else(|| symbols.first())
                .cloned(),
            Self::CashCarry { symbol, .. } => Some(symbol.clone()),
        }
    }

    pub fn base(&self) -> Option<String> {
        self.main_symbol().map(|s| base_currency(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangular_member_shape_is_wire_stable() {
        let opp = Opportunity::Triangular {
            exchange: "binance".into(),
            path: "USDT -> BTC -> ETH -> USDT".into(),
            symbols: vec!["BTC/USDT".into(), "ETH/BTC".into(), "ETH/USDT".into()],
            profit_rate: 0.0012,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&opp).unwrap();
        assert_eq!(json["strategyType"], "triangular");
        assert_eq!(json["profitRate"], 0.0012);
        assert_eq!(json["path"], "USDT -> BTC -> ETH -> USDT");

        let back: Opportunity = serde_json::from_value(json).unwrap();
        assert_eq!(back, opp);
    }

    #[test]
    fn cashcarry_member_embeds_executable_prices() {
        let opp = Opportunity::CashCarry {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            direction: CashCarryDirection::LongSpotShortPerp,
            spot_ask: Some(100.0),
            perp_bid: Some(100.5),
            spot_bid: None,
            perp_ask: None,
            spot_price: 100.0,
            perp_price: 100.5,
            basis_rate: 0.005,
            funding_rate: 0.0015,
            profit_rate: 0.0057,
            timestamp: 1,
        };
        let json = serde_json::to_value(&opp).unwrap();
        assert_eq!(json["strategyType"], "cashcarry");
        assert_eq!(json["direction"], "long_spot_short_perp");
        assert_eq!(json["spotAsk"], 100.0);
        assert!(json.get("spotBid").is_none());
    }

    #[test]
    fn main_symbol_prefers_the_cross_pair() {
        let opp = Opportunity::Triangular {
            exchange: "binance".into(),
            path: "USDT -> BTC -> ETH -> USDT".into(),
            symbols: vec!["BTC/USDT".into(), "ETH/BTC".into(), "ETH/USDT".into()],
            profit_rate: 0.0,
            timestamp: 0,
        };
        assert_eq!(opp.main_symbol().as_deref(), Some("ETH/BTC"));
        assert_eq!(opp.base().as_deref(), Some("ETH"));
    }
}
