//! Read-through memoizing facade over the KV market data snapshots.
//!
//! Each read is cached in-process for a short TTL (bounded by item count, the
//! whole cache is dropped when full). A field that fails to parse degrades to
//! `None`; the repository itself never errors on malformed snapshots. Safe for
//! concurrent readers; correctness does not depend on cross-process coherence
//! because all durable state lives in the KV store.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::env_parse;
use crate::models::{AccountType, BestBidAsk, FundingInfo, OrderBookTob};
use crate::store::{keys, KvStore};
use crate::util::now_ms;

struct Cache<K, V> {
    entries: HashMap<K, (i64, V)>,
    ttl_ms: i64,
    max_items: usize,
}

impl<K: std::hash::Hash + Eq, V: Clone> Cache<K, V> {
    fn new(ttl_ms: i64, max_items: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
            max_items,
        }
    }

    fn get(&self, key: &K, now: i64) -> Option<V> {
        self.entries
            .get(key)
            .filter(|(at, _)| now - at <= self.ttl_ms)
            .map(|(_, v)| v.clone())
    }

    fn put(&mut self, key: K, value: V, now: i64) {
        if self.entries.len() >= self.max_items {
            self.entries.clear();
        }
        self.entries.insert(key, (now, value));
    }
}

pub struct MarketDataRepository {
    kv: Arc<dyn KvStore>,
    bba: Mutex<Cache<(String, String, AccountType), BestBidAsk>>,
    tob: Mutex<Cache<(String, String), OrderBookTob>>,
    funding: Mutex<Cache<(String, String), FundingInfo>>,
}

impl MarketDataRepository {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        let ttl_ms = env_parse("MARKETDATA_CACHE_TTL_MS", 500i64);
        let max_items = env_parse("MARKETDATA_CACHE_MAX_ITEMS", 2000usize);
        Arc::new(Self {
            kv,
            bba: Mutex::new(Cache::new(ttl_ms, max_items)),
            tob: Mutex::new(Cache::new(ttl_ms, max_items)),
            funding: Mutex::new(Cache::new(ttl_ms, max_items)),
        })
    }

    pub async fn get_best_bid_ask(
        &self,
        exchange_id: &str,
        symbol: &str,
        account_type: AccountType,
    ) -> Result<BestBidAsk> {
        let now = now_ms();
        let cache_key = (
            exchange_id.to_string(),
            symbol.to_string(),
            account_type,
        );
        if let Some(hit) = self.bba.lock().get(&cache_key, now) {
            return Ok(hit);
        }

        let key = match account_type {
            AccountType::Spot => keys::ticker(exchange_id, symbol),
            AccountType::Perp => keys::ticker_futures(exchange_id, symbol),
        };
        let data = self.kv.hgetall(&key).await?;
        let mut result = BestBidAsk {
            bid: parse_dec(data.get("bid")),
            ask: parse_dec(data.get("ask")),
            last: parse_dec(data.get("last")),
            volume: parse_dec(data.get("volume")),
            timestamp: parse_ts(data.get("timestamp")),
        };

        // Perp snapshots can lag the ticker feed; fall back to the funding
        // hash's mark/index as a reference price.
        if account_type == AccountType::Perp
            && result.bid.is_none()
            && result.ask.is_none()
            && result.last.is_none()
        {
            let fr = self.kv.hgetall(&keys::funding(exchange_id, symbol)).await?;
            let reference = parse_dec(fr.get("mark")).or_else(|| parse_dec(fr.get("index")));
            if let Some(px) = reference {
                result.bid = Some(px);
                result.ask = Some(px);
                result.last = Some(px);
                result.timestamp = parse_ts(fr.get("timestamp"));
            }
        }

        self.bba.lock().put(cache_key, result.clone(), now);
        Ok(result)
    }

    pub async fn get_orderbook_tob(
        &self,
        exchange_id: &str,
        symbol: &str,
    ) -> Result<OrderBookTob> {
        let now = now_ms();
        let cache_key = (exchange_id.to_string(), symbol.to_string());
        if let Some(hit) = self.tob.lock().get(&cache_key, now) {
            return Ok(hit);
        }

        let bids = self
            .kv
            .zrevrange_withscores(&keys::orderbook_bids(exchange_id, symbol), 0, 0)
            .await?;
        let asks = self
            .kv
            .zrange(&keys::orderbook_asks(exchange_id, symbol), 0, 0)
            .await?;
        let mut ts = self.kv.get(&keys::orderbook_ts(exchange_id, symbol)).await?;

        let (mut best_bid_price, best_bid_amount) = bids
            .first()
            .map(|(member, _)| parse_price_amount(member))
            .unwrap_or((None, None));
        let (mut best_ask_price, best_ask_amount) = asks
            .first()
            .map(|member| parse_price_amount(member))
            .unwrap_or((None, None));

        // No book snapshot at all: the spot ticker is the next best source.
        if best_bid_price.is_none() && best_ask_price.is_none() {
            let ticker = self.kv.hgetall(&keys::ticker(exchange_id, symbol)).await?;
            best_bid_price = parse_dec(ticker.get("bid"));
            best_ask_price = parse_dec(ticker.get("ask"));
            if ts.is_none() {
                ts = ticker.get("timestamp").cloned();
            }
        }

        let result = OrderBookTob {
            best_bid_price,
            best_bid_amount,
            best_ask_price,
            best_ask_amount,
            timestamp_ms: parse_ts(ts.as_ref()),
        };
        self.tob.lock().put(cache_key, result.clone(), now);
        Ok(result)
    }

    pub async fn get_funding(&self, exchange_id: &str, symbol: &str) -> Result<FundingInfo> {
        let now = now_ms();
        let cache_key = (exchange_id.to_string(), symbol.to_string());
        if let Some(hit) = self.funding.lock().get(&cache_key, now) {
            return Ok(hit);
        }

        let data = self.kv.hgetall(&keys::funding(exchange_id, symbol)).await?;
        let result = FundingInfo {
            rate: parse_dec(data.get("rate")),
            next_time: parse_ts(data.get("next_time")),
            timestamp: parse_ts(data.get("timestamp")),
            mark: parse_dec(data.get("mark")),
            index: parse_dec(data.get("index")),
        };
        self.funding.lock().put(cache_key, result.clone(), now);
        Ok(result)
    }
}

fn parse_dec(value: Option<&String>) -> Option<Decimal> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    Decimal::from_str(v).ok()
}

fn parse_ts(value: Option<&String>) -> Option<i64> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    v.parse::<i64>()
        .ok()
        .or_else(|| v.parse::<f64>().ok().map(|f| f as i64))
}

/// Sorted-set members are `"{price}:{amount}"`.
fn parse_price_amount(member: &str) -> (Option<Decimal>, Option<Decimal>) {
    let mut parts = member.splitn(2, ':');
    let price = parts.next().and_then(|p| Decimal::from_str(p.trim()).ok());
    let amount = parts.next().and_then(|a| Decimal::from_str(a.trim()).ok());
    match (price, amount) {
        (Some(p), Some(a)) => (Some(p), Some(a)),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn hash(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn reads_spot_ticker_hash() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.hset(
            "ticker:binance:BTC/USDT",
            &hash(&[
                ("bid", "60000"),
                ("ask", "60010"),
                ("last", "60005"),
                ("volume", "123456789"),
                ("timestamp", "1700000000000"),
            ]),
            None,
        )
        .await
        .unwrap();

        let repo = MarketDataRepository::new(kv);
        let bba = repo
            .get_best_bid_ask("binance", "BTC/USDT", AccountType::Spot)
            .await
            .unwrap();
        assert_eq!(bba.bid, Some(Decimal::from(60000)));
        assert_eq!(bba.ask, Some(Decimal::from(60010)));
        assert_eq!(bba.timestamp, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn malformed_fields_become_none() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.hset(
            "ticker:binance:BTC/USDT",
            &hash(&[("bid", "garbage"), ("ask", ""), ("last", "60005")]),
            None,
        )
        .await
        .unwrap();

        let repo = MarketDataRepository::new(kv);
        let bba = repo
            .get_best_bid_ask("binance", "BTC/USDT", AccountType::Spot)
            .await
            .unwrap();
        assert_eq!(bba.bid, None);
        assert_eq!(bba.ask, None);
        assert_eq!(bba.last, Some(Decimal::from(60005)));
    }

    #[tokio::test]
    async fn perp_falls_back_to_funding_mark() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.hset(
            "funding:binance:BTC/USDT",
            &hash(&[("mark", "60100"), ("timestamp", "1700000000000")]),
            None,
        )
        .await
        .unwrap();

        let repo = MarketDataRepository::new(kv);
        let bba = repo
            .get_best_bid_ask("binance", "BTC/USDT", AccountType::Perp)
            .await
            .unwrap();
        assert_eq!(bba.bid, Some(Decimal::from(60100)));
        assert_eq!(bba.ask, Some(Decimal::from(60100)));
        assert_eq!(bba.last, Some(Decimal::from(60100)));
    }

    #[tokio::test]
    async fn tob_reads_best_levels_from_sorted_sets() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.replace_zset(
            "orderbook:binance:BTC/USDT:bids",
            &[("59990:0.5".into(), 59990.0), ("60000:1.2".into(), 60000.0)],
            None,
        )
        .await
        .unwrap();
        kv.replace_zset(
            "orderbook:binance:BTC/USDT:asks",
            &[("60010:0.7".into(), 60010.0), ("60020:2.0".into(), 60020.0)],
            None,
        )
        .await
        .unwrap();
        kv.set("orderbook:binance:BTC/USDT:ts", "1700000000000", None)
            .await
            .unwrap();

        let repo = MarketDataRepository::new(kv);
        let tob = repo.get_orderbook_tob("binance", "BTC/USDT").await.unwrap();
        assert_eq!(tob.best_bid_price, Some(Decimal::from(60000)));
        assert_eq!(tob.best_bid_amount, Some(Decimal::new(12, 1)));
        assert_eq!(tob.best_ask_price, Some(Decimal::from(60010)));
        assert_eq!(tob.timestamp_ms, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn tob_falls_back_to_ticker_when_book_missing() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.hset(
            "ticker:binance:ETH/USDT",
            &hash(&[("bid", "3000"), ("ask", "3001"), ("timestamp", "42")]),
            None,
        )
        .await
        .unwrap();

        let repo = MarketDataRepository::new(kv);
        let tob = repo.get_orderbook_tob("binance", "ETH/USDT").await.unwrap();
        assert_eq!(tob.best_bid_price, Some(Decimal::from(3000)));
        assert_eq!(tob.best_ask_price, Some(Decimal::from(3001)));
        assert_eq!(tob.timestamp_ms, Some(42));
    }

    #[tokio::test]
    async fn funding_hash_parses_all_fields() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.hset(
            "funding:binance:BTC/USDT",
            &hash(&[
                ("rate", "0.0005"),
                ("next_time", "1700000100000"),
                ("timestamp", "1700000000000"),
                ("mark", "60100"),
                ("index", "60090"),
            ]),
            None,
        )
        .await
        .unwrap();

        let repo = MarketDataRepository::new(kv);
        let funding = repo.get_funding("binance", "BTC/USDT").await.unwrap();
        assert_eq!(funding.rate, Some(Decimal::new(5, 4)));
        assert_eq!(funding.next_time, Some(1_700_000_100_000));
        assert_eq!(funding.mark, Some(Decimal::from(60100)));
    }
}
