//! Human risk constraints and the machine-derived overlay.
//!
//! Constraints are operator-configured, persisted to a stable KV key, and
//! reloaded on service start. The overlay is recomputed from market state each
//! scan; the union of the two is published as the effective constraint
//! snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::MarketRegime;
use crate::regime::MarketRegimeSnapshot;
use crate::store::{keys, KvStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConstraints {
    /// Per-symbol exposure ceiling in quote units.
    pub max_exposure_per_symbol: Decimal,
    pub max_total_exposure: Decimal,
    pub min_profit_rate: Decimal,
    pub max_positions: usize,
    pub blacklist_symbols: BTreeSet<String>,
    /// Non-empty whitelist restricts selection to listed bases.
    pub whitelist_symbols: BTreeSet<String>,
    pub max_drawdown_per_symbol: Decimal,
    pub liquidity_score_min: Decimal,
    /// `(ask - bid) / mid` ceiling.
    pub max_spread_rate: Decimal,
    pub max_data_age_ms: i64,
    pub min_confidence: Decimal,
    /// Funding spike ceiling, absolute.
    pub max_abs_funding_rate: Decimal,
}

impl Default for RiskConstraints {
    fn default() -> Self {
        Self {
            max_exposure_per_symbol: Decimal::from(1000),
            max_total_exposure: Decimal::from(5000),
            min_profit_rate: Decimal::new(1, 3),
            max_positions: 5,
            blacklist_symbols: BTreeSet::new(),
            whitelist_symbols: BTreeSet::new(),
            max_drawdown_per_symbol: Decimal::new(5, 2),
            liquidity_score_min: Decimal::new(5, 1),
            max_spread_rate: Decimal::new(2, 3),
            max_data_age_ms: 15_000,
            min_confidence: Decimal::new(50, 2),
            max_abs_funding_rate: Decimal::new(2, 2),
        }
    }
}

/// Shared handle so operator updates land while the scan loop owns the
/// service. Every update persists to the stable KV key immediately.
#[derive(Clone)]
pub struct ConstraintsHandle {
    kv: Arc<dyn KvStore>,
    inner: Arc<RwLock<RiskConstraints>>,
}

impl ConstraintsHandle {
    pub async fn load(kv: Arc<dyn KvStore>) -> Self {
        let constraints = match kv.get(keys::CONSTRAINTS_HUMAN).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            _ => RiskConstraints::default(),
        };
        Self {
            kv,
            inner: Arc::new(RwLock::new(constraints)),
        }
    }

    pub fn get(&self) -> RiskConstraints {
        self.inner.read().clone()
    }

    /// Apply an in-place edit and persist the result. Idempotent: re-applying
    /// the same edit rewrites the same payload.
    pub async fn update(&self, edit: impl FnOnce(&mut RiskConstraints)) -> Result<()> {
        let updated = {
            let mut guard = self.inner.write();
            edit(&mut guard);
            guard.clone()
        };
        self.kv
            .set(
                keys::CONSTRAINTS_HUMAN,
                &serde_json::to_string(&updated)?,
                None,
            )
            .await?;
        Ok(())
    }
}

/// Machine-derived overlay recomputed each scan from data quality and regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoOverlay {
    pub timestamp_ms: i64,
    pub min_profit_rate_boost: Decimal,
    /// In (0, 1]; scales the per-symbol exposure ceiling down.
    pub exposure_multiplier: Decimal,
    pub blacklist_symbols: BTreeSet<String>,
    pub avg_data_age_ms: i64,
    pub avg_spread_rate: f64,
    pub regime: MarketRegime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime_metrics: Option<MarketRegimeSnapshot>,
}

impl Default for AutoOverlay {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            min_profit_rate_boost: Decimal::ZERO,
            exposure_multiplier: Decimal::ONE,
            blacklist_symbols: BTreeSet::new(),
            avg_data_age_ms: 0,
            avg_spread_rate: 0.0,
            regime: MarketRegime::Unknown,
            regime_metrics: None,
        }
    }
}

/// Union of human constraints and overlay, published per scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConstraints {
    pub regime: MarketRegime,
    pub max_exposure_per_symbol: Decimal,
    pub max_total_exposure: Decimal,
    pub min_profit_rate: Decimal,
    pub max_positions: usize,
    pub blacklist_symbols: BTreeSet<String>,
    pub whitelist_symbols: BTreeSet<String>,
    pub max_drawdown_per_symbol: Decimal,
    pub liquidity_score_min: Decimal,
    pub max_spread_rate: Decimal,
    pub max_data_age_ms: i64,
    pub min_confidence: Decimal,
    pub max_abs_funding_rate: Decimal,
}

pub fn effective_min_profit_rate(constraints: &RiskConstraints, overlay: &AutoOverlay) -> Decimal {
    constraints.min_profit_rate + overlay.min_profit_rate_boost
}

pub fn effective_max_exposure(constraints: &RiskConstraints, overlay: &AutoOverlay) -> Decimal {
    (constraints.max_exposure_per_symbol * overlay.exposure_multiplier).round_dp(2)
}

pub fn effective_snapshot(
    constraints: &RiskConstraints,
    overlay: &AutoOverlay,
) -> EffectiveConstraints {
    let mut blacklist = constraints.blacklist_symbols.clone();
    blacklist.extend(overlay.blacklist_symbols.iter().cloned());
    EffectiveConstraints {
        regime: overlay.regime,
        max_exposure_per_symbol: effective_max_exposure(constraints, overlay),
        max_total_exposure: constraints.max_total_exposure,
        min_profit_rate: effective_min_profit_rate(constraints, overlay),
        max_positions: constraints.max_positions,
        blacklist_symbols: blacklist,
        whitelist_symbols: constraints.whitelist_symbols.clone(),
        max_drawdown_per_symbol: constraints.max_drawdown_per_symbol,
        liquidity_score_min: constraints.liquidity_score_min,
        max_spread_rate: constraints.max_spread_rate,
        max_data_age_ms: constraints.max_data_age_ms,
        min_confidence: constraints.min_confidence,
        max_abs_funding_rate: constraints.max_abs_funding_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn updates_persist_and_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let handle = ConstraintsHandle::load(kv.clone()).await;
        handle
            .update(|c| {
                c.min_profit_rate = Decimal::new(5, 4);
                c.blacklist_symbols.insert("DOGE".to_string());
            })
            .await
            .unwrap();

        let reloaded = ConstraintsHandle::load(kv).await;
        let constraints = reloaded.get();
        assert_eq!(constraints.min_profit_rate, Decimal::new(5, 4));
        assert!(constraints.blacklist_symbols.contains("DOGE"));
        // Untouched fields keep defaults.
        assert_eq!(constraints.max_positions, 5);
    }

    #[test]
    fn effective_values_combine_overlay() {
        let constraints = RiskConstraints::default();
        let overlay = AutoOverlay {
            min_profit_rate_boost: Decimal::new(1, 3),
            exposure_multiplier: Decimal::new(3, 1),
            ..AutoOverlay::default()
        };
        assert_eq!(
            effective_min_profit_rate(&constraints, &overlay),
            Decimal::new(2, 3)
        );
        assert_eq!(
            effective_max_exposure(&constraints, &overlay),
            Decimal::from(300)
        );
    }
}
