//! Per-strategy routing weights loaded from persisted strategy configs.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::MarketRegime;
use crate::store::Database;
use crate::util::now_ms;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRouting {
    pub allow_short: bool,
    pub max_leverage: f64,
    pub regime_weights: HashMap<MarketRegime, f64>,
    pub is_enabled: bool,
}

impl Default for StrategyRouting {
    fn default() -> Self {
        Self {
            allow_short: true,
            max_leverage: 1.0,
            regime_weights: default_regime_weights(),
            is_enabled: true,
        }
    }
}

pub fn default_regime_weights() -> HashMap<MarketRegime, f64> {
    HashMap::from([
        (MarketRegime::Range, 1.0),
        (MarketRegime::Downtrend, 0.6),
        (MarketRegime::Uptrend, 0.7),
        (MarketRegime::Stress, 0.2),
    ])
}

fn regime_from_key(key: &str) -> Option<MarketRegime> {
    match key.to_ascii_uppercase().as_str() {
        "RANGE" => Some(MarketRegime::Range),
        "UPTREND" => Some(MarketRegime::Uptrend),
        "DOWNTREND" => Some(MarketRegime::Downtrend),
        "STRESS" => Some(MarketRegime::Stress),
        _ => None,
    }
}

fn routing_from_config(config: &Value, is_enabled: bool) -> StrategyRouting {
    let mut weights = default_regime_weights();
    if let Some(map) = config.get("regime_weights").and_then(Value::as_object) {
        for (key, value) in map {
            let (Some(regime), Some(weight)) = (regime_from_key(key), value.as_f64()) else {
                continue;
            };
            weights.insert(regime, weight);
        }
    }
    StrategyRouting {
        allow_short: config
            .get("allow_short")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        max_leverage: config
            .get("max_leverage")
            .and_then(Value::as_f64)
            .unwrap_or(1.0),
        regime_weights: weights,
        is_enabled,
    }
}

/// Routing table cached for `ttl_ms`, rebuilt from `strategy_configs` rows.
pub struct RoutingTable {
    db: Database,
    ttl_ms: i64,
    loaded_at: i64,
    routes: HashMap<String, StrategyRouting>,
}

impl RoutingTable {
    pub fn new(db: Database, ttl_ms: i64) -> Self {
        Self {
            db,
            ttl_ms,
            loaded_at: 0,
            routes: HashMap::new(),
        }
    }

    pub async fn refresh(&mut self) {
        let now = now_ms();
        if !self.routes.is_empty() && now - self.loaded_at < self.ttl_ms {
            return;
        }
        let Ok(rows) = self.db.get_strategy_configs().await else {
            return;
        };
        let mut routes = HashMap::new();
        for (strategy_type, config, is_enabled) in rows {
            routes.insert(
                strategy_type.to_ascii_lowercase(),
                routing_from_config(&config, is_enabled),
            );
        }
        self.routes = routes;
        self.loaded_at = now;
    }

    /// Routing for a strategy key, defaulting when no config row exists.
    pub fn for_strategy(&self, routing_key: &str) -> StrategyRouting {
        self.routes
            .get(routing_key)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_overrides_merge_over_defaults() {
        let routing = routing_from_config(
            &json!({
                "allow_short": false,
                "regime_weights": {"STRESS": 0.0, "range": 0.9}
            }),
            true,
        );
        assert!(!routing.allow_short);
        assert_eq!(routing.regime_weights[&MarketRegime::Stress], 0.0);
        assert_eq!(routing.regime_weights[&MarketRegime::Range], 0.9);
        // Unmentioned regimes keep defaults.
        assert_eq!(routing.regime_weights[&MarketRegime::Uptrend], 0.7);
    }

    #[tokio::test]
    async fn table_loads_rows_and_falls_back_to_default() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_strategy_config(
            "funding_rate",
            &json!({"allow_short": false}),
            true,
        )
        .await
        .unwrap();

        let mut table = RoutingTable::new(db, 10_000);
        table.refresh().await;

        assert!(!table.for_strategy("funding_rate").allow_short);
        assert!(table.for_strategy("triangular").allow_short);
    }
}
