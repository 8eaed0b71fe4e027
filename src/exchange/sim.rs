//! Deterministic simulated exchange.
//!
//! Used by the integration tests and local demo wiring: market data is
//! scripted, orders fill (or stay open) according to [`SimFillMode`], and
//! every cancel is recorded so reconcile behavior can be asserted.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;

use crate::models::{AccountType, OrderSide};
use crate::util::now_ms;

use super::{
    ExchangeAdapter, ExchangeOrder, ExchangeTrade, FundingRateData, MarketInfo, OrderBookData,
    TickerData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFillMode {
    /// Orders fill immediately at the scripted ticker price.
    Immediate,
    /// Orders stay open until the test flips them via `set_order_status`.
    Pending,
}

#[derive(Default)]
struct SimState {
    markets: Vec<MarketInfo>,
    tickers: HashMap<(AccountType, String), TickerData>,
    books: HashMap<String, OrderBookData>,
    funding: HashMap<String, FundingRateData>,
    orders: HashMap<String, ExchangeOrder>,
    cancelled: Vec<String>,
    next_order: u64,
}

pub struct SimExchange {
    id: String,
    fee_rate: Decimal,
    fill_mode: SimFillMode,
    /// When false, created trades carry no id so the synthetic-id path runs.
    emit_trade_ids: bool,
    state: Mutex<SimState>,
}

impl SimExchange {
    pub fn new(fill_mode: SimFillMode) -> Self {
        Self {
            id: "binance".to_string(),
            fee_rate: Decimal::new(4, 4),
            fill_mode,
            emit_trade_ids: true,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn without_trade_ids(mut self) -> Self {
        self.emit_trade_ids = false;
        self
    }

    pub fn add_market(&self, symbol: &str, contract: bool, quote: &str) {
        self.state.lock().markets.push(MarketInfo {
            symbol: symbol.to_string(),
            contract,
            quote: quote.to_string(),
        });
    }

    pub fn set_ticker(&self, account: AccountType, ticker: TickerData) {
        self.state
            .lock()
            .tickers
            .insert((account, ticker.symbol.clone()), ticker);
    }

    pub fn set_order_book(&self, symbol: &str, book: OrderBookData) {
        self.state.lock().books.insert(symbol.to_string(), book);
    }

    pub fn set_funding(&self, funding: FundingRateData) {
        self.state
            .lock()
            .funding
            .insert(funding.symbol.clone(), funding);
    }

    /// Flip a stored order into a new venue status, optionally filling it.
    pub fn set_order_status(
        &self,
        order_id: &str,
        status: &str,
        filled: Option<Decimal>,
        average: Option<Decimal>,
    ) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = Some(status.to_string());
            if let Some(filled) = filled {
                order.filled = Some(filled);
            }
            if let Some(average) = average {
                order.average = Some(average);
            }
        }
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    fn reference_price(
        state: &SimState,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
    ) -> Option<Decimal> {
        let ticker = state.tickers.get(&(account, symbol.to_string()))?;
        let px = match side {
            OrderSide::Buy => ticker.ask.or(ticker.last),
            OrderSide::Sell => ticker.bid.or(ticker.last),
        }?;
        Decimal::try_from(px).ok()
    }
}

#[async_trait]
impl ExchangeAdapter for SimExchange {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self, account: AccountType) -> Result<Vec<MarketInfo>> {
        let state = self.state.lock();
        Ok(state
            .markets
            .iter()
            .filter(|m| m.contract == (account == AccountType::Perp))
            .cloned()
            .collect())
    }

    async fn fetch_ticker(&self, account: AccountType, symbol: &str) -> Result<TickerData> {
        self.state
            .lock()
            .tickers
            .get(&(account, symbol.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no ticker for {symbol}"))
    }

    async fn fetch_order_book(&self, symbol: &str, _limit: usize) -> Result<OrderBookData> {
        self.state
            .lock()
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no order book for {symbol}"))
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<FundingRateData> {
        self.state
            .lock()
            .funding
            .get(&crate::util::normalize_symbol(symbol))
            .cloned()
            .ok_or_else(|| anyhow!("no funding for {symbol}"))
    }

    async fn create_market_order(
        &self,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        client_order_id: Option<&str>,
    ) -> Result<ExchangeOrder> {
        let mut state = self.state.lock();
        state.next_order += 1;
        let order_id = format!("sim-{}", state.next_order);
        let price = Self::reference_price(&state, account, &crate::util::normalize_symbol(symbol), side)
            .ok_or_else(|| anyhow!("no reference price for {symbol}"))?;

        let order = match self.fill_mode {
            SimFillMode::Immediate => {
                let fee = (price * amount * self.fee_rate).round_dp(8);
                let trade = ExchangeTrade {
                    id: self
                        .emit_trade_ids
                        .then(|| format!("{order_id}-t1")),
                    price,
                    quantity: amount,
                    fee,
                    fee_currency: Some("USDT".to_string()),
                    timestamp: Some(now_ms()),
                    raw: json!({"clientOrderId": client_order_id}),
                };
                ExchangeOrder {
                    id: order_id.clone(),
                    status: Some("closed".to_string()),
                    filled: Some(amount),
                    amount: Some(amount),
                    average: Some(price),
                    price: Some(price),
                    cost: Some((price * amount).round_dp(8)),
                    fee: Some(fee),
                    fee_currency: Some("USDT".to_string()),
                    trades: vec![trade],
                    raw: json!({"clientOrderId": client_order_id}),
                }
            }
            SimFillMode::Pending => ExchangeOrder {
                id: order_id.clone(),
                status: Some("open".to_string()),
                filled: Some(Decimal::ZERO),
                amount: Some(amount),
                average: None,
                price: Some(price),
                cost: None,
                fee: None,
                fee_currency: None,
                trades: Vec::new(),
                raw: json!({"clientOrderId": client_order_id}),
            },
        };

        state.orders.insert(order_id, order.clone());
        Ok(order)
    }

    async fn fetch_order(
        &self,
        _account: AccountType,
        order_id: &str,
        _symbol: &str,
    ) -> Result<ExchangeOrder> {
        self.state
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("order {order_id} not found"))
    }

    async fn cancel_order(
        &self,
        _account: AccountType,
        order_id: &str,
        _symbol: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.cancelled.push(order_id.to_string());
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("order {order_id} not found"))?;
        if matches!(order.status.as_deref(), Some("open") | None) {
            order.status = Some("canceled".to_string());
        }
        Ok(())
    }
}
