//! Exchange adapter contract. Adapters return normalized records; none of the
//! venue-specific payload shapes leak past this boundary.

pub mod binance;
pub mod sim;

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{AccountType, OrderSide};

pub use binance::BinanceAdapter;
pub use sim::{SimExchange, SimFillMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketInfo {
    pub symbol: String,
    /// True for perpetual/contract markets.
    pub contract: bool,
    pub quote: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickerData {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub quote_volume: Option<f64>,
    /// Exchange-reported timestamp (ms).
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBookData {
    /// `(price, amount)` levels, best first.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundingRateData {
    pub symbol: String,
    pub funding_rate: Option<f64>,
    pub funding_timestamp: Option<i64>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeTrade {
    /// Venue trade id; absent ids get a synthetic replacement downstream.
    pub id: Option<String>,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub timestamp: Option<i64>,
    pub raw: Value,
}

/// Normalized order record as returned by create/fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeOrder {
    pub id: String,
    /// Venue status string (`closed`, `open`, `canceled`, ...).
    pub status: Option<String>,
    pub filled: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub average: Option<Decimal>,
    pub price: Option<Decimal>,
    pub cost: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_currency: Option<String>,
    pub trades: Vec<ExchangeTrade>,
    pub raw: Value,
}

impl Default for ExchangeTrade {
    fn default() -> Self {
        Self {
            id: None,
            price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_currency: None,
            timestamp: None,
            raw: Value::Null,
        }
    }
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn load_markets(&self, account: AccountType) -> Result<Vec<MarketInfo>>;

    async fn fetch_ticker(&self, account: AccountType, symbol: &str) -> Result<TickerData>;

    /// Batched ticker fetch. Adapters without a batch endpoint keep the
    /// default error and callers fall back to bounded per-symbol fetches.
    async fn fetch_tickers(
        &self,
        _account: AccountType,
        _symbols: &[String],
    ) -> Result<HashMap<String, TickerData>> {
        bail!("batch tickers not supported")
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBookData>;

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<FundingRateData>;

    async fn create_market_order(
        &self,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        client_order_id: Option<&str>,
    ) -> Result<ExchangeOrder>;

    async fn fetch_order(
        &self,
        account: AccountType,
        order_id: &str,
        symbol: &str,
    ) -> Result<ExchangeOrder>;

    async fn cancel_order(&self, account: AccountType, order_id: &str, symbol: &str)
        -> Result<()>;
}
