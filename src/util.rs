//! Small shared helpers: wall-clock milliseconds, cooperative stop signals,
//! and symbol string utilities used across services.

use std::time::Duration;

use tokio::sync::watch;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cooperative stop signal for long-running service loops.
///
/// Loops hold a [`StopSignal`] and wait on it alongside their sleep so a stop
/// request interrupts the sleep promptly. The owning side keeps the
/// [`StopHandle`] and calls `stop()` during shutdown.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `timeout`, returning early (with `true`) if stop is signalled.
    pub async fn sleep(&mut self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => self.is_stopped(),
            res = self.rx.changed() => {
                match res {
                    Ok(()) => self.is_stopped(),
                    // Sender dropped: treat as stop so the loop winds down.
                    Err(_) => true,
                }
            }
        }
    }
}

/// Split `BASE/QUOTE` (also `BASE-QUOTE`, `BASE_QUOTE`, or suffix forms like
/// `BTCUSDT`) into base and quote legs.
pub fn split_symbol(symbol: &str) -> Option<(String, String)> {
    if symbol.is_empty() {
        return None;
    }
    for sep in ['/', '-', '_'] {
        if symbol.contains(sep) {
            let mut parts = symbol.splitn(2, sep);
            let base = parts.next()?.trim();
            let quote = parts.next()?.trim();
            if base.is_empty() || quote.is_empty() {
                return None;
            }
            return Some((base.to_string(), quote.to_string()));
        }
    }
    for quote in ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"] {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return Some((base.to_string(), quote.to_string()));
        }
    }
    None
}

/// Base currency of a symbol, e.g. `BTC` for `BTC/USDT`.
pub fn base_currency(symbol: &str) -> String {
    split_symbol(symbol)
        .map(|(base, _)| base)
        .unwrap_or_else(|| symbol.to_string())
}

/// Strip a perp settle suffix: `BTC/USDT:USDT` -> `BTC/USDT`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.split(':').next().unwrap_or(symbol).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_symbol_handles_separators_and_suffixes() {
        assert_eq!(
            split_symbol("BTC/USDT"),
            Some(("BTC".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_symbol("ETHUSDT"),
            Some(("ETH".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_symbol("SOL-BTC"),
            Some(("SOL".to_string(), "BTC".to_string()))
        );
        assert_eq!(split_symbol(""), None);
        assert_eq!(split_symbol("USDT"), None);
    }

    #[test]
    fn normalize_strips_settle_suffix() {
        assert_eq!(normalize_symbol("BTC/USDT:USDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTC/USDT"), "BTC/USDT");
    }

    #[tokio::test]
    async fn stop_signal_interrupts_sleep() {
        let (handle, mut signal) = stop_channel();
        let waiter = tokio::spawn(async move {
            signal.sleep(Duration::from_secs(30)).await
        });
        handle.stop();
        let stopped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
        assert!(stopped);
    }
}
