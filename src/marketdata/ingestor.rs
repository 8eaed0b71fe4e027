//! Polling market data ingestor.
//!
//! One long-running task per exchange: each loop fetches spot tickers (batched
//! where the venue supports it), top-K order books, futures tickers, and
//! funding rates, then rewrites the KV snapshots with fresh TTLs and updates
//! the symbol index sets. Per-symbol failures are skipped; a whole-loop
//! failure is logged and retried after the poll interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::config::{env_flag, env_parse, PairCatalog};
use crate::exchange::{ExchangeAdapter, OrderBookData, TickerData};
use crate::models::AccountType;
use crate::store::{keys, KvStore};
use crate::util::{normalize_symbol, now_ms, StopSignal};

const SPOT_TICKER_TTL: Duration = Duration::from_secs(20);
const FUTURES_TICKER_TTL: Duration = Duration::from_secs(20);
const ORDERBOOK_TTL: Duration = Duration::from_secs(15);
const FUNDING_TTL: Duration = Duration::from_secs(60 * 60 * 8);
const INDEX_TTL: Duration = Duration::from_secs(120);
const RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct IngestorSettings {
    pub poll_interval: Duration,
    pub max_ticker_symbols: usize,
    pub max_orderbook_symbols: usize,
    pub max_futures_symbols: usize,
    pub max_funding_symbols: usize,
    pub orderbook_limit: usize,
    pub fetch_concurrency: usize,
    pub expand_usdt_markets: bool,
}

impl IngestorSettings {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs_f64(
                env_parse("MARKETDATA_POLL_INTERVAL", 1.0f64).max(0.1),
            ),
            max_ticker_symbols: env_parse("MARKETDATA_MAX_TICKER_SYMBOLS", 200usize),
            max_orderbook_symbols: env_parse("MARKETDATA_MAX_ORDERBOOK_SYMBOLS", 5usize),
            max_futures_symbols: env_parse("MARKETDATA_MAX_FUTURES_SYMBOLS", 120usize),
            max_funding_symbols: env_parse("MARKETDATA_MAX_FUNDING_SYMBOLS", 80usize),
            orderbook_limit: env_parse("MARKETDATA_ORDERBOOK_LIMIT", 10usize),
            fetch_concurrency: env_parse("MARKETDATA_FETCH_CONCURRENCY", 10usize).max(1),
            expand_usdt_markets: env_flag("MARKETDATA_EXPAND_USDT_MARKETS"),
        }
    }
}

pub struct MarketDataIngestor {
    exchange_id: String,
    adapter: Arc<dyn ExchangeAdapter>,
    kv: Arc<dyn KvStore>,
    catalog: Arc<PairCatalog>,
    settings: IngestorSettings,
    last_metrics_ms: i64,
}

impl MarketDataIngestor {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        kv: Arc<dyn KvStore>,
        catalog: Arc<PairCatalog>,
        settings: IngestorSettings,
    ) -> Self {
        Self {
            exchange_id: adapter.id().to_string(),
            adapter,
            kv,
            catalog,
            settings,
            last_metrics_ms: 0,
        }
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        info!(exchange = %self.exchange_id, "market data ingestor starting");
        while !stop.is_stopped() {
            // Market lists survive the inner loop; failures leave the list
            // empty and the loop keeps going with catalog symbols only.
            let spot_markets = match self.adapter.load_markets(AccountType::Spot).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "spot load_markets failed, continuing without markets");
                    Vec::new()
                }
            };
            let futures_markets = match self.adapter.load_markets(AccountType::Perp).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "futures load_markets failed, continuing without markets");
                    Vec::new()
                }
            };

            while !stop.is_stopped() {
                let start = now_ms();
                let mut spot_count = 0usize;
                let mut futures_count = 0usize;
                let mut funding_count = 0usize;

                match self
                    .run_loop_once(&spot_markets, &futures_markets)
                    .await
                {
                    Ok((s, f, fr)) => {
                        spot_count = s;
                        futures_count = f;
                        funding_count = fr;
                    }
                    Err(e) => warn!(error = %e, "market data loop error"),
                }

                let elapsed = now_ms() - start;
                if let Err(e) = self
                    .write_metrics(spot_count, futures_count, funding_count, elapsed)
                    .await
                {
                    warn!(error = %e, "failed to write ingest metrics");
                }

                if stop.sleep(self.settings.poll_interval).await {
                    return;
                }
            }

            if stop.sleep(RETRY_DELAY).await {
                return;
            }
        }
    }

    async fn run_loop_once(
        &self,
        spot_markets: &[crate::exchange::MarketInfo],
        futures_markets: &[crate::exchange::MarketInfo],
    ) -> Result<(usize, usize, usize)> {
        let config_symbols = self.catalog_symbols().await?;
        let mut spot_symbols = config_symbols.clone();
        if self.settings.expand_usdt_markets {
            let mut market_usdt: Vec<String> = spot_markets
                .iter()
                .filter(|m| m.symbol.ends_with("/USDT"))
                .map(|m| m.symbol.clone())
                .collect();
            market_usdt.sort();
            spot_symbols = merge_symbol_priority(
                &config_symbols,
                &market_usdt,
                self.settings.max_ticker_symbols,
            );
        }
        let spot_count = spot_symbols.len();

        if !spot_symbols.is_empty() {
            let tickers = self.fetch_spot_tickers(&spot_symbols).await;
            if !tickers.is_empty() {
                self.write_tickers("ticker", &tickers, SPOT_TICKER_TTL).await?;
            }

            let ob_symbols: Vec<String> = config_symbols
                .iter()
                .take(self.settings.max_orderbook_symbols)
                .cloned()
                .collect();
            self.ingest_orderbooks(&ob_symbols).await?;
        }

        // Futures universe: prefer the venue's USDT-settled contracts, fall
        // back to mapping the spot list.
        let mut futures_symbols: Vec<String> = futures_markets
            .iter()
            .filter(|m| m.quote == "USDT")
            .map(|m| m.symbol.clone())
            .collect();
        futures_symbols.sort();
        if futures_symbols.is_empty() {
            futures_symbols = spot_symbols
                .iter()
                .filter(|s| s.ends_with("/USDT"))
                .cloned()
                .collect();
        }
        futures_symbols.truncate(self.settings.max_futures_symbols);
        let futures_count = futures_symbols.len();

        if !futures_symbols.is_empty() {
            let tickers = self
                .fetch_per_symbol(AccountType::Perp, &futures_symbols)
                .await;
            if !tickers.is_empty() {
                self.write_tickers("ticker_futures", &tickers, FUTURES_TICKER_TTL)
                    .await?;
            }
        }

        let funding_symbols: Vec<String> = futures_symbols
            .iter()
            .take(self.settings.max_funding_symbols)
            .cloned()
            .collect();
        let funding_count = funding_symbols.len();
        if !funding_symbols.is_empty() {
            self.ingest_funding(&funding_symbols).await?;
        }

        Ok((spot_count, futures_count, funding_count))
    }

    async fn catalog_symbols(&self) -> Result<Vec<String>> {
        let pairs = self
            .catalog
            .pairs_for_exchange(&self.exchange_id, true)
            .await?;
        let mut symbols: Vec<String> = pairs.into_iter().map(|p| p.symbol).collect();
        symbols.sort();
        symbols.truncate(self.settings.max_ticker_symbols);
        Ok(symbols)
    }

    async fn fetch_spot_tickers(&self, symbols: &[String]) -> HashMap<String, TickerData> {
        match self
            .adapter
            .fetch_tickers(AccountType::Spot, symbols)
            .await
        {
            Ok(tickers) => tickers,
            // Batch failed (or unsupported): degrade to bounded per-symbol
            // fetches so one bad symbol cannot sink the whole round.
            Err(_) => self.fetch_per_symbol(AccountType::Spot, symbols).await,
        }
    }

    async fn fetch_per_symbol(
        &self,
        account: AccountType,
        symbols: &[String],
    ) -> HashMap<String, TickerData> {
        let adapter = self.adapter.clone();
        stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let adapter = adapter.clone();
                async move {
                    match adapter.fetch_ticker(account, &symbol).await {
                        Ok(t) => Some((normalize_symbol(&symbol), t)),
                        Err(_) => None,
                    }
                }
            })
            .buffer_unordered(self.settings.fetch_concurrency)
            .filter_map(|item| async move { item })
            .collect()
            .await
    }

    async fn write_tickers(
        &self,
        namespace: &str,
        tickers: &HashMap<String, TickerData>,
        ttl: Duration,
    ) -> Result<()> {
        let now = now_ms();
        let index_key = keys::symbol_index(namespace, &self.exchange_id);
        let mut written = Vec::new();
        let mut stale = 0usize;

        for (symbol, t) in tickers {
            let mut bid = t.bid;
            let mut ask = t.ask;
            if let Some(last) = t.last {
                bid = bid.or(Some(last));
                ask = ask.or(Some(last));
            }
            if bid.is_none() && ask.is_none() && t.last.is_none() {
                continue;
            }

            // Seconds-resolution venue timestamps get scaled to ms; local
            // ingest time is what freshness checks read.
            let exchange_ts = t.timestamp.map(|ts| {
                if ts < 1_000_000_000_000 {
                    ts * 1000
                } else {
                    ts
                }
            });
            if exchange_ts.is_some_and(|ts| now - ts > 15_000) {
                stale += 1;
            }

            let key = format!("{namespace}:{}:{symbol}", self.exchange_id);
            let fields = vec![
                ("bid".to_string(), opt_str(bid)),
                ("ask".to_string(), opt_str(ask)),
                ("last".to_string(), opt_str(t.last)),
                ("volume".to_string(), opt_str(t.quote_volume)),
                ("timestamp".to_string(), now.to_string()),
                (
                    "exchange_timestamp".to_string(),
                    exchange_ts.map(|v| v.to_string()).unwrap_or_default(),
                ),
            ];
            self.kv.hset(&key, &fields, Some(ttl)).await?;
            written.push(symbol.clone());
        }

        if !written.is_empty() {
            self.kv.sadd(&index_key, &written, Some(INDEX_TTL)).await?;
        }
        if stale > 0 {
            tracing::debug!(namespace, stale, "stale exchange timestamps in ticker batch");
        }
        Ok(())
    }

    async fn ingest_orderbooks(&self, symbols: &[String]) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let adapter = self.adapter.clone();
        let limit = self.settings.orderbook_limit;
        let books: Vec<(String, OrderBookData)> = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let adapter = adapter.clone();
                async move {
                    match adapter.fetch_order_book(&symbol, limit).await {
                        Ok(book) => Some((symbol, book)),
                        Err(_) => None,
                    }
                }
            })
            .buffer_unordered(self.settings.fetch_concurrency)
            .filter_map(|item| async move { item })
            .collect()
            .await;

        for (symbol, book) in books {
            self.write_orderbook(&symbol, &book).await?;
        }
        Ok(())
    }

    async fn write_orderbook(&self, symbol: &str, book: &OrderBookData) -> Result<()> {
        let limit = self.settings.orderbook_limit;
        let members = |levels: &[(f64, f64)]| -> Vec<(String, f64)> {
            levels
                .iter()
                .take(limit)
                .map(|(price, amount)| (format!("{price}:{amount}"), *price))
                .collect()
        };

        self.kv
            .replace_zset(
                &keys::orderbook_bids(&self.exchange_id, symbol),
                &members(&book.bids),
                Some(ORDERBOOK_TTL),
            )
            .await?;
        self.kv
            .replace_zset(
                &keys::orderbook_asks(&self.exchange_id, symbol),
                &members(&book.asks),
                Some(ORDERBOOK_TTL),
            )
            .await?;
        self.kv
            .set(
                &keys::orderbook_ts(&self.exchange_id, symbol),
                &now_ms().to_string(),
                Some(ORDERBOOK_TTL),
            )
            .await?;
        self.kv
            .sadd(
                &keys::symbol_index("orderbook", &self.exchange_id),
                &[symbol.to_string()],
                Some(INDEX_TTL),
            )
            .await?;
        Ok(())
    }

    async fn ingest_funding(&self, symbols: &[String]) -> Result<()> {
        let adapter = self.adapter.clone();
        let rates: Vec<(String, crate::exchange::FundingRateData)> =
            stream::iter(symbols.iter().cloned())
                .map(|symbol| {
                    let adapter = adapter.clone();
                    async move {
                        match adapter.fetch_funding_rate(&symbol).await {
                            Ok(fr) => Some((normalize_symbol(&symbol), fr)),
                            Err(_) => None,
                        }
                    }
                })
                .buffer_unordered(self.settings.fetch_concurrency)
                .filter_map(|item| async move { item })
                .collect()
                .await;

        let now = now_ms();
        let mut written = Vec::new();
        for (symbol, fr) in rates {
            let key = keys::funding(&self.exchange_id, &symbol);
            let fields = vec![
                ("rate".to_string(), opt_str(fr.funding_rate)),
                (
                    "next_time".to_string(),
                    fr.funding_timestamp
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                ),
                (
                    "timestamp".to_string(),
                    fr.timestamp.unwrap_or(now).to_string(),
                ),
                ("mark".to_string(), opt_str(fr.mark_price)),
                ("index".to_string(), opt_str(fr.index_price)),
            ];
            self.kv.hset(&key, &fields, Some(FUNDING_TTL)).await?;
            written.push(symbol);
        }
        if !written.is_empty() {
            self.kv
                .sadd(
                    &keys::symbol_index("funding", &self.exchange_id),
                    &written,
                    Some(FUNDING_TTL),
                )
                .await?;
        }
        Ok(())
    }

    async fn write_metrics(
        &mut self,
        spot: usize,
        futures: usize,
        funding: usize,
        elapsed_ms: i64,
    ) -> Result<()> {
        let now = now_ms();
        if now - self.last_metrics_ms < 5_000 {
            return Ok(());
        }
        self.last_metrics_ms = now;
        self.kv
            .hset(
                &keys::metrics("market_data_service"),
                &[
                    ("spot_symbols".to_string(), spot.to_string()),
                    ("futures_symbols".to_string(), futures.to_string()),
                    ("funding_symbols".to_string(), funding.to_string()),
                    ("last_loop_ms".to_string(), elapsed_ms.to_string()),
                    ("timestamp_ms".to_string(), now.to_string()),
                ],
                Some(Duration::from_secs(120)),
            )
            .await?;
        Ok(())
    }
}

fn merge_symbol_priority(primary: &[String], fallback: &[String], limit: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for s in primary.iter().chain(fallback.iter()) {
        if merged.len() >= limit {
            break;
        }
        if seen.insert(s.clone()) {
            merged.push(s.clone());
        }
    }
    merged
}

fn opt_str<T: ToString>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}
