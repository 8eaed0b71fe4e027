//! Binance REST adapter (spot + USDT-margined futures).
//!
//! Public market data endpoints are unauthenticated; order endpoints sign the
//! query string with HMAC-SHA256. Symbols cross this boundary in `BASE/QUOTE`
//! form and are flattened to the venue's `BASEQUOTE` on the wire.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::config::env_flag;
use crate::models::{AccountType, OrderSide};
use crate::util::{normalize_symbol, now_ms};

use super::{
    ExchangeAdapter, ExchangeOrder, ExchangeTrade, FundingRateData, MarketInfo, OrderBookData,
    TickerData,
};

const SPOT_BASE: &str = "https://api.binance.com";
const FUTURES_BASE: &str = "https://fapi.binance.com";
const SPOT_TESTNET_BASE: &str = "https://testnet.binance.vision";
const FUTURES_TESTNET_BASE: &str = "https://testnet.binancefuture.com";

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceAdapter {
    id: String,
    client: Client,
    spot_base: String,
    futures_base: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl BinanceAdapter {
    pub fn from_env() -> Result<Self> {
        let testnet = env_flag("BINANCE_TESTNET");
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            id: "binance".to_string(),
            client,
            spot_base: if testnet { SPOT_TESTNET_BASE } else { SPOT_BASE }.to_string(),
            futures_base: if testnet {
                FUTURES_TESTNET_BASE
            } else {
                FUTURES_BASE
            }
            .to_string(),
            api_key: std::env::var("BINANCE_API_KEY").ok().filter(|v| !v.is_empty()),
            api_secret: std::env::var("BINANCE_SECRET_KEY")
                .ok()
                .or_else(|| std::env::var("BINANCE_API_SECRET").ok())
                .filter(|v| !v.is_empty()),
        })
    }

    fn base(&self, account: AccountType) -> &str {
        match account {
            AccountType::Spot => &self.spot_base,
            AccountType::Perp => &self.futures_base,
        }
    }

    fn order_path(account: AccountType) -> &'static str {
        match account {
            AccountType::Spot => "/api/v3/order",
            AccountType::Perp => "/fapi/v1/order",
        }
    }

    fn venue_symbol(symbol: &str) -> String {
        normalize_symbol(symbol).replace('/', "")
    }

    async fn get_public(&self, account: AccountType, path: &str, query: &str) -> Result<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base(account), path)
        } else {
            format!("{}{}?{}", self.base(account), path, query)
        };
        let resp = self.client.get(&url).send().await.context("binance GET")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("binance response body")?;
        if !status.is_success() {
            bail!("binance {path} failed ({status}): {body}");
        }
        Ok(body)
    }

    fn sign(&self, query: &str) -> Result<String> {
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| anyhow!("missing BINANCE_SECRET_KEY"))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("hmac init: {e}"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        account: AccountType,
        path: &str,
        mut query: String,
    ) -> Result<Value> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("missing BINANCE_API_KEY"))?;
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", now_ms()));
        let signature = self.sign(&query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base(account),
            path,
            query,
            signature
        );
        debug!(%path, "binance signed request");
        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .context("binance signed request")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("binance response body")?;
        if !status.is_success() {
            bail!("binance {path} failed ({status}): {body}");
        }
        Ok(body)
    }

    fn ticker_from_24hr(symbol: &str, v: &Value) -> TickerData {
        TickerData {
            symbol: symbol.to_string(),
            bid: field_f64(v, "bidPrice"),
            ask: field_f64(v, "askPrice"),
            last: field_f64(v, "lastPrice"),
            quote_volume: field_f64(v, "quoteVolume"),
            timestamp: v.get("closeTime").and_then(Value::as_i64),
        }
    }

    fn order_from_response(account: AccountType, v: &Value) -> ExchangeOrder {
        let mut trades = Vec::new();
        if let Some(fills) = v.get("fills").and_then(Value::as_array) {
            for f in fills {
                let (Some(price), Some(qty)) = (field_dec(f, "price"), field_dec(f, "qty"))
                else {
                    continue;
                };
                trades.push(ExchangeTrade {
                    id: f
                        .get("tradeId")
                        .map(|t| t.to_string().trim_matches('"').to_string()),
                    price,
                    quantity: qty,
                    fee: field_dec(f, "commission").unwrap_or(Decimal::ZERO),
                    fee_currency: f
                        .get("commissionAsset")
                        .and_then(Value::as_str)
                        .map(String::from),
                    timestamp: f.get("time").and_then(Value::as_i64),
                    raw: f.clone(),
                });
            }
        }

        let filled = field_dec(v, "executedQty");
        let cost = match account {
            AccountType::Spot => field_dec(v, "cummulativeQuoteQty"),
            AccountType::Perp => field_dec(v, "cumQuote"),
        };
        let average = field_dec(v, "avgPrice").filter(|d| *d > Decimal::ZERO);

        ExchangeOrder {
            id: v
                .get("orderId")
                .map(|id| id.to_string().trim_matches('"').to_string())
                .unwrap_or_default(),
            status: v
                .get("status")
                .and_then(Value::as_str)
                .map(map_venue_status),
            filled,
            amount: field_dec(v, "origQty"),
            average,
            price: field_dec(v, "price").filter(|d| *d > Decimal::ZERO),
            cost,
            fee: None,
            fee_currency: None,
            trades,
            raw: v.clone(),
        }
    }
}

fn map_venue_status(status: &str) -> String {
    match status {
        "FILLED" => "closed",
        "CANCELED" | "PENDING_CANCEL" => "canceled",
        "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH" => "rejected",
        // NEW / PARTIALLY_FILLED stay open; fill quantity decides the rest.
        _ => "open",
    }
    .to_string()
}

fn field_f64(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_dec(v: &Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self, account: AccountType) -> Result<Vec<MarketInfo>> {
        let path = match account {
            AccountType::Spot => "/api/v3/exchangeInfo",
            AccountType::Perp => "/fapi/v1/exchangeInfo",
        };
        let body = self.get_public(account, path, "").await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("exchangeInfo missing symbols"))?;
        let mut out = Vec::with_capacity(symbols.len());
        for s in symbols {
            let (Some(base), Some(quote)) = (
                s.get("baseAsset").and_then(Value::as_str),
                s.get("quoteAsset").and_then(Value::as_str),
            ) else {
                continue;
            };
            if s.get("status").and_then(Value::as_str) != Some("TRADING") {
                continue;
            }
            out.push(MarketInfo {
                symbol: format!("{base}/{quote}"),
                contract: account == AccountType::Perp,
                quote: quote.to_string(),
            });
        }
        Ok(out)
    }

    async fn fetch_ticker(&self, account: AccountType, symbol: &str) -> Result<TickerData> {
        let path = match account {
            AccountType::Spot => "/api/v3/ticker/24hr",
            AccountType::Perp => "/fapi/v1/ticker/24hr",
        };
        let body = self
            .get_public(
                account,
                path,
                &format!("symbol={}", Self::venue_symbol(symbol)),
            )
            .await?;
        Ok(Self::ticker_from_24hr(symbol, &body))
    }

    async fn fetch_tickers(
        &self,
        account: AccountType,
        symbols: &[String],
    ) -> Result<HashMap<String, TickerData>> {
        if account == AccountType::Perp {
            bail!("batch tickers not supported for futures");
        }
        let venue_list = symbols
            .iter()
            .map(|s| format!("\"{}\"", Self::venue_symbol(s)))
            .collect::<Vec<_>>()
            .join(",");
        let body = self
            .get_public(
                account,
                "/api/v3/ticker/24hr",
                &format!("symbols=[{venue_list}]"),
            )
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| anyhow!("batch ticker response is not an array"))?;

        let by_venue: HashMap<String, &String> = symbols
            .iter()
            .map(|s| (Self::venue_symbol(s), s))
            .collect();
        let mut out = HashMap::new();
        for row in rows {
            let Some(venue) = row.get("symbol").and_then(Value::as_str) else {
                continue;
            };
            if let Some(symbol) = by_venue.get(venue) {
                out.insert((*symbol).clone(), Self::ticker_from_24hr(symbol, row));
            }
        }
        Ok(out)
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBookData> {
        let body = self
            .get_public(
                AccountType::Spot,
                "/api/v3/depth",
                &format!("symbol={}&limit={}", Self::venue_symbol(symbol), limit),
            )
            .await?;
        let levels = |key: &str| -> Vec<(f64, f64)> {
            body.get(key)
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|lvl| {
                            let row = lvl.as_array()?;
                            let price = row.first().and_then(|v| field_value_f64(v))?;
                            let amount = row.get(1).and_then(|v| field_value_f64(v))?;
                            Some((price, amount))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(OrderBookData {
            bids: levels("bids"),
            asks: levels("asks"),
            timestamp: body.get("lastUpdateId").map(|_| now_ms()),
        })
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<FundingRateData> {
        let body = self
            .get_public(
                AccountType::Perp,
                "/fapi/v1/premiumIndex",
                &format!("symbol={}", Self::venue_symbol(symbol)),
            )
            .await?;
        Ok(FundingRateData {
            symbol: normalize_symbol(symbol),
            funding_rate: field_f64(&body, "lastFundingRate"),
            funding_timestamp: body.get("nextFundingTime").and_then(Value::as_i64),
            mark_price: field_f64(&body, "markPrice"),
            index_price: field_f64(&body, "indexPrice"),
            timestamp: body.get("time").and_then(Value::as_i64),
        })
    }

    async fn create_market_order(
        &self,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        client_order_id: Option<&str>,
    ) -> Result<ExchangeOrder> {
        let mut query = format!(
            "symbol={}&side={}&type=MARKET&quantity={}",
            Self::venue_symbol(symbol),
            side.as_str().to_ascii_uppercase(),
            amount.normalize(),
        );
        if let Some(coid) = client_order_id {
            query.push_str(&format!("&newClientOrderId={coid}"));
        }
        if account == AccountType::Spot {
            // Spot returns fill details inline when asked for FULL.
            query.push_str("&newOrderRespType=FULL");
        }
        let body = self
            .signed_request(reqwest::Method::POST, account, Self::order_path(account), query)
            .await?;
        Ok(Self::order_from_response(account, &body))
    }

    async fn fetch_order(
        &self,
        account: AccountType,
        order_id: &str,
        symbol: &str,
    ) -> Result<ExchangeOrder> {
        let query = format!(
            "symbol={}&orderId={}",
            Self::venue_symbol(symbol),
            order_id
        );
        let body = self
            .signed_request(reqwest::Method::GET, account, Self::order_path(account), query)
            .await?;
        Ok(Self::order_from_response(account, &body))
    }

    async fn cancel_order(
        &self,
        account: AccountType,
        order_id: &str,
        symbol: &str,
    ) -> Result<()> {
        let query = format!(
            "symbol={}&orderId={}",
            Self::venue_symbol(symbol),
            order_id
        );
        self.signed_request(
            reqwest::Method::DELETE,
            account,
            Self::order_path(account),
            query,
        )
        .await?;
        Ok(())
    }
}

fn field_value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn venue_symbol_flattens_pairs() {
        assert_eq!(BinanceAdapter::venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceAdapter::venue_symbol("BTC/USDT:USDT"), "BTCUSDT");
    }

    #[test]
    fn spot_order_response_parses_fills() {
        let body = json!({
            "orderId": 12345,
            "status": "FILLED",
            "origQty": "0.5",
            "executedQty": "0.5",
            "cummulativeQuoteQty": "30000",
            "fills": [
                {"price": "60000", "qty": "0.5", "commission": "0.0002",
                 "commissionAsset": "BTC", "tradeId": 777}
            ]
        });
        let order = BinanceAdapter::order_from_response(AccountType::Spot, &body);
        assert_eq!(order.id, "12345");
        assert_eq!(order.status.as_deref(), Some("closed"));
        assert_eq!(order.trades.len(), 1);
        assert_eq!(order.trades[0].id.as_deref(), Some("777"));
        assert_eq!(order.trades[0].fee_currency.as_deref(), Some("BTC"));
    }

    #[test]
    fn venue_statuses_map_to_normalized() {
        assert_eq!(map_venue_status("FILLED"), "closed");
        assert_eq!(map_venue_status("CANCELED"), "canceled");
        assert_eq!(map_venue_status("EXPIRED"), "rejected");
        assert_eq!(map_venue_status("PARTIALLY_FILLED"), "open");
        assert_eq!(map_venue_status("NEW"), "open");
    }
}
