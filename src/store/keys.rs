//! KV key layout. Bit-exact: readers and writers in any language must agree.

pub const OPPORTUNITIES_TRIANGULAR: &str = "opportunities:triangular";
pub const OPPORTUNITIES_CASHCARRY: &str = "opportunities:cashcarry";
pub const DECISIONS_LATEST: &str = "decisions:latest";
pub const CONSTRAINTS_HUMAN: &str = "decision:constraints:human";
pub const CONSTRAINTS_AUTO: &str = "decision:constraints:auto";
pub const CONSTRAINTS_EFFECTIVE: &str = "decision:constraints:effective";

pub fn ticker(exchange: &str, symbol: &str) -> String {
    format!("ticker:{exchange}:{symbol}")
}

pub fn ticker_futures(exchange: &str, symbol: &str) -> String {
    format!("ticker_futures:{exchange}:{symbol}")
}

pub fn orderbook_bids(exchange: &str, symbol: &str) -> String {
    format!("orderbook:{exchange}:{symbol}:bids")
}

pub fn orderbook_asks(exchange: &str, symbol: &str) -> String {
    format!("orderbook:{exchange}:{symbol}:asks")
}

pub fn orderbook_ts(exchange: &str, symbol: &str) -> String {
    format!("orderbook:{exchange}:{symbol}:ts")
}

pub fn funding(exchange: &str, symbol: &str) -> String {
    format!("funding:{exchange}:{symbol}")
}

/// Symbol index set written during ingest, per snapshot namespace.
pub fn symbol_index(namespace: &str, exchange: &str) -> String {
    format!("symbols:{namespace}:{exchange}")
}

pub fn metrics(service: &str) -> String {
    format!("metrics:{service}")
}

pub fn oms_dedupe(user_id: &str, idempotency_key: &str) -> String {
    format!("oms:dedupe:{user_id}:{idempotency_key}")
}

pub fn pnl_plan_marker(trading_mode: &str, plan_id: &str) -> String {
    format!("pnl:plan:{trading_mode}:{plan_id}")
}
