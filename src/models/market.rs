//! Market data snapshots as read back from the KV store.
//!
//! Every field is optional: a writer may have had only part of the picture,
//! and a failed parse degrades to `None` for that field rather than an error.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Best bid/ask snapshot for one `(exchange, symbol, account_type)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    /// Quote-currency volume over the exchange's rolling window.
    pub volume: Option<Decimal>,
    /// Local ingest time (ms). Freshness checks key off this, not the
    /// exchange-reported timestamp.
    pub timestamp: Option<i64>,
}

impl BestBidAsk {
    /// Midpoint of bid/ask, falling back to last.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid + ask > Decimal::ZERO => {
                Some((bid + ask) / Decimal::TWO)
            }
            _ => self.last,
        }
    }

    /// `(ask - bid) / mid` as a float for scoring paths.
    pub fn spread_rate(&self) -> Option<f64> {
        let (bid, ask) = (self.bid?, self.ask?);
        let mid = self.mid()?;
        if mid <= Decimal::ZERO {
            return None;
        }
        ((ask - bid).abs() / mid).to_f64()
    }
}

/// Top-of-book for one `(exchange, symbol)`. Deeper levels never enter the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookTob {
    pub best_bid_price: Option<Decimal>,
    pub best_bid_amount: Option<Decimal>,
    pub best_ask_price: Option<Decimal>,
    pub best_ask_amount: Option<Decimal>,
    pub timestamp_ms: Option<i64>,
}

/// Funding snapshot for one `(exchange, symbol)` perp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub rate: Option<Decimal>,
    pub next_time: Option<i64>,
    pub timestamp: Option<i64>,
    pub mark: Option<Decimal>,
    pub index: Option<Decimal>,
}
