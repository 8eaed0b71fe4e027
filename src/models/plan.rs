//! Execution plans and the tagged union of records appended to `plan.legs`.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::{AccountType, OrderSide, TradingMode};
use super::position::PlanPnl;

/// Order-status -> count map; BTreeMap keeps the JSON rendering stable.
pub type StatusCounts = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Triangle,
    Basis,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triangle => "triangle",
            Self::Basis => "basis",
        }
    }
}

impl FromStr for PlanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triangle" => Ok(Self::Triangle),
            "basis" => Ok(Self::Basis),
            other => Err(format!("invalid plan kind: {other}")),
        }
    }
}

/// `running -> {completed, failed, cancelled}`; terminal states absorb and
/// stamp `finished_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid plan status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_id: String,
    pub kind: PlanKind,
    pub status: PlanStatus,
    pub legs: Vec<PlanLeg>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Parameters for a (suggested or actual) reconcile call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub plan_id: Uuid,
    pub trading_mode: TradingMode,
    pub confirm_live: bool,
    pub limit: usize,
    pub max_rounds: u32,
    pub sleep_ms: u64,
    pub auto_cancel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<i64>,
}

/// Per-order outcome tallies for plan-wide refresh/cancel sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStats {
    pub total: u32,
    pub ok: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrdersSummary {
    pub total: i64,
    pub terminal: i64,
    pub non_terminal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_counts: Option<StatusCounts>,
}

impl OrdersSummary {
    pub fn from_counts(counts: &StatusCounts, with_counts: bool) -> Self {
        let total: i64 = counts.values().sum();
        let terminal = ["filled", "cancelled", "rejected"]
            .iter()
            .filter_map(|k| counts.get(*k))
            .sum::<i64>();
        Self {
            total,
            terminal,
            non_terminal: (total - terminal).max(0),
            status_counts: with_counts.then(|| counts.clone()),
        }
    }
}

/// Machine-suggested follow-up after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    None,
    ReconcileAgain,
    ConsiderAutoCancel,
    WaitCancel,
    ManualInvestigate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub rounds: u32,
    pub timeout: bool,
    pub max_rounds: u32,
    pub max_rounds_exhausted: bool,
    pub auto_cancel_attempted: bool,
    pub auto_cancel_succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_error: Option<String>,
}

/// One observation of the plan's orders during reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRound {
    pub orders: usize,
    pub status_counts: StatusCounts,
    pub terminal: bool,
    pub rejected: bool,
}

/// Outcome block persisted as the `reconcile_summary` leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub plan_id: Uuid,
    pub terminal: bool,
    pub rejected: bool,
    pub rounds: u32,
    pub auto_cancel: bool,
    pub max_rounds: u32,
    pub max_rounds_exhausted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
    pub timeout: bool,
    pub last_status_counts: StatusCounts,
    pub next_action: NextAction,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reconcile_stats: ReconcileStats,
    pub orders_summary: OrdersSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_request: Option<ReconcileRequest>,
}

/// One round of post-execution polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRound {
    pub round: u32,
    pub status_counts: StatusCounts,
    pub terminal: bool,
    pub rejected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSummary {
    pub plan_id: Uuid,
    pub terminal: bool,
    pub rejected: bool,
    pub rounds: u32,
    pub max_rounds: u32,
    pub sleep_ms: u64,
    pub last_status_counts: StatusCounts,
    pub orders_summary: OrdersSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationResult {
    pub order_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSummary {
    pub action: String,
    pub stats: OpStats,
    pub results: Vec<CompensationResult>,
}

/// Everything that can be appended to `plan.legs`, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanLeg {
    PlacedOrder {
        order_id: Uuid,
        leg_id: String,
        account_type: AccountType,
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        /// Reference price used when sizing the leg.
        average_price: Decimal,
    },
    ExecutionSummary {
        plan_id: Uuid,
        trading_mode: TradingMode,
        status_counts: StatusCounts,
        orders_summary: OrdersSummary,
        reconcile_suggested_request: ReconcileRequest,
    },
    PostExecPollSummary {
        summary: PollSummary,
    },
    ReconcileSummary {
        summary: ReconcileOutcome,
    },
    PnlSummary {
        summary: PlanPnl,
    },
    FailureCompensation {
        summary: CompensationSummary,
    },
    ReconcileSuggestedRequest {
        request: ReconcileRequest,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leg_union_is_kind_tagged() {
        let leg = PlanLeg::ReconcileSuggestedRequest {
            request: ReconcileRequest {
                plan_id: Uuid::nil(),
                trading_mode: TradingMode::Paper,
                confirm_live: false,
                limit: 20,
                max_rounds: 5,
                sleep_ms: 500,
                auto_cancel: false,
                max_age_seconds: None,
            },
            error: "boom".into(),
        };
        let json = serde_json::to_value(&leg).unwrap();
        assert_eq!(json["kind"], "reconcile_suggested_request");
        assert_eq!(json["request"]["trading_mode"], "paper");

        let back: PlanLeg = serde_json::from_value(json).unwrap();
        assert_eq!(back, leg);
    }

    #[test]
    fn orders_summary_counts_terminal_states() {
        let mut counts = StatusCounts::new();
        counts.insert("filled".into(), 2);
        counts.insert("pending".into(), 1);
        let summary = OrdersSummary::from_counts(&counts, true);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.terminal, 2);
        assert_eq!(summary.non_terminal, 1);
    }

    #[test]
    fn plan_status_terminality() {
        assert!(!PlanStatus::Running.is_terminal());
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
    }
}
