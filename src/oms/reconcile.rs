//! Plan reconciliation: converge every order to terminal state within the
//! round and wall-clock budgets, optionally auto-cancelling what remains.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OmsError, OmsResult};
use crate::models::{
    NextAction, Order, OrderStatus, OrdersSummary, PlanLeg, PlanStatus, ReconcileOutcome,
    ReconcileRound, ReconcileStats, StatusCounts, TradingMode,
};
use crate::util::now_ms;

use super::pnl::record_plan_pnl;
use super::service::{status_counts, OmsService, PlanSweep};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub reconciled: PlanSweep,
    pub rounds: Vec<ReconcileRound>,
    pub auto_cancel: bool,
    pub summary: ReconcileOutcome,
}

/// Pure rule table for the follow-up action after a reconcile pass.
pub fn preview_next_action(
    terminal: bool,
    auto_cancel: bool,
    timeout: bool,
    max_rounds_exhausted: bool,
    last_status_counts: &StatusCounts,
) -> NextAction {
    let has_non_terminal = last_status_counts.get("pending").copied().unwrap_or(0) > 0
        || last_status_counts
            .get("partially_filled")
            .copied()
            .unwrap_or(0)
            > 0;
    if terminal {
        NextAction::None
    } else if auto_cancel {
        NextAction::WaitCancel
    } else if (timeout || max_rounds_exhausted) && has_non_terminal {
        NextAction::ConsiderAutoCancel
    } else {
        NextAction::ReconcileAgain
    }
}

fn all_terminal(orders: &[Order]) -> bool {
    orders.iter().all(|o| o.status.is_terminal())
}

fn any_rejected(orders: &[Order]) -> bool {
    orders.iter().any(|o| o.status == OrderStatus::Rejected)
}

fn round_summary(sweep: &PlanSweep) -> ReconcileRound {
    ReconcileRound {
        orders: sweep.orders.len(),
        status_counts: status_counts(&sweep.orders),
        terminal: all_terminal(&sweep.orders),
        rejected: any_rejected(&sweep.orders),
    }
}

impl OmsService {
    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        mode: TradingMode,
        confirm_live: bool,
        limit: usize,
        max_rounds: u32,
        sleep_ms: u64,
        auto_cancel: bool,
        max_age_seconds: Option<i64>,
    ) -> OmsResult<ReconcileResult> {
        if max_rounds < 1 {
            return Err(OmsError::invalid("max_rounds must be >= 1"));
        }
        if let Some(age) = max_age_seconds {
            if age < 1 {
                return Err(OmsError::invalid("max_age_seconds must be >= 1"));
            }
        }

        let plan = self.get_execution_plan(user_id, plan_id, mode).await?;
        let started_at_ms = plan.started_at;

        let mut last = self
            .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
            .await?;
        let mut rounds = vec![round_summary(&last)];
        let mut timeout = false;
        let mut max_rounds_exhausted = false;

        for _ in 0..max_rounds.saturating_sub(1) {
            if all_terminal(&last.orders) {
                break;
            }

            if let Some(max_age) = max_age_seconds {
                // Inclusive: exactly at the deadline counts as timed out.
                let age_s = (now_ms() - started_at_ms) / 1000;
                if age_s >= max_age {
                    last = self
                        .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
                        .await?;
                    rounds.push(round_summary(&last));
                    timeout = true;
                    break;
                }
            }

            if sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            last = self
                .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
                .await?;
            rounds.push(round_summary(&last));
        }

        if !timeout && !all_terminal(&last.orders) && rounds.len() >= max_rounds as usize {
            if let Ok(sweep) = self
                .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
                .await
            {
                last = sweep;
                rounds.push(round_summary(&last));
            }
            max_rounds_exhausted = true;
        }

        let mut terminal = all_terminal(&last.orders);
        let mut rejected = any_rejected(&last.orders);
        let age_seconds = Some((now_ms() - started_at_ms) / 1000);
        let mut last_counts = rounds
            .last()
            .map(|r| r.status_counts.clone())
            .unwrap_or_default();

        let next_action = preview_next_action(
            terminal,
            auto_cancel,
            timeout,
            max_rounds_exhausted,
            &last_counts,
        );
        let suggested_request = (next_action == NextAction::ConsiderAutoCancel).then(|| {
            let mut request =
                self.default_reconcile_request(plan_id, mode, confirm_live);
            request.limit = limit;
            request.max_rounds = max_rounds;
            request.sleep_ms = sleep_ms;
            request.auto_cancel = true;
            request.max_age_seconds = max_age_seconds.or(request.max_age_seconds);
            request
        });

        let mut summary = ReconcileOutcome {
            plan_id,
            terminal,
            rejected,
            rounds: rounds.len() as u32,
            auto_cancel,
            max_rounds,
            max_rounds_exhausted,
            max_age_seconds,
            age_seconds,
            timeout,
            last_status_counts: last_counts.clone(),
            next_action,
            status: PlanStatus::Running,
            reason: None,
            reconcile_stats: ReconcileStats {
                rounds: rounds.len() as u32,
                timeout,
                max_rounds,
                max_rounds_exhausted,
                auto_cancel_attempted: false,
                auto_cancel_succeeded: false,
                cancel_error: None,
            },
            orders_summary: OrdersSummary::from_counts(&last_counts, true),
            suggested_request,
        };

        if auto_cancel && !terminal {
            summary.reconcile_stats.auto_cancel_attempted = true;
            match self
                .cancel_plan(user_id, plan_id, mode, confirm_live, limit)
                .await
            {
                Ok(_) => {
                    summary.status = PlanStatus::Cancelled;
                    summary.next_action = NextAction::None;
                    summary.reconcile_stats.auto_cancel_succeeded = true;

                    if let Ok(sweep) = self
                        .refresh_plan(user_id, plan_id, mode, confirm_live, limit)
                        .await
                    {
                        rounds.push(round_summary(&sweep));
                        terminal = all_terminal(&sweep.orders);
                        rejected = any_rejected(&sweep.orders);
                        last_counts = status_counts(&sweep.orders);
                        summary.terminal = terminal;
                        summary.rejected = rejected;
                        summary.rounds = rounds.len() as u32;
                        summary.reconcile_stats.rounds = rounds.len() as u32;
                        summary.last_status_counts = last_counts.clone();
                        summary.orders_summary = OrdersSummary::from_counts(&last_counts, true);
                        last = sweep;
                    }
                }
                Err(e) => {
                    summary.status = PlanStatus::Failed;
                    summary.reason = Some(format!("auto_cancel_failed: {e}"));
                    summary.next_action = NextAction::ManualInvestigate;
                    summary.reconcile_stats.cancel_error = Some(e.to_string());
                    let _ = self
                        .db()
                        .update_plan_status(
                            mode,
                            plan_id,
                            PlanStatus::Failed,
                            summary.reason.as_deref(),
                        )
                        .await;
                }
            }

            let _ = self
                .db()
                .append_plan_leg(
                    mode,
                    plan_id,
                    PlanLeg::ReconcileSummary {
                        summary: summary.clone(),
                    },
                )
                .await;

            return Ok(ReconcileResult {
                reconciled: last,
                rounds,
                auto_cancel: true,
                summary,
            });
        }

        let status = if terminal {
            if rejected {
                PlanStatus::Failed
            } else {
                PlanStatus::Completed
            }
        } else {
            PlanStatus::Failed
        };
        summary.status = status;

        let reason = if status == PlanStatus::Failed {
            if rejected {
                Some("rejected".to_string())
            } else if timeout {
                Some(format!(
                    "timeout (age_seconds={}, max_age_seconds={})",
                    age_seconds.unwrap_or(0),
                    max_age_seconds.unwrap_or(0)
                ))
            } else if max_rounds_exhausted {
                Some(format!(
                    "max_rounds_exhausted (max_rounds={max_rounds}, rounds={})",
                    rounds.len()
                ))
            } else {
                Some(format!("not_terminal (rounds={})", rounds.len()))
            }
        } else {
            None
        };
        summary.reason = reason.clone();

        self.db()
            .update_plan_status(mode, plan_id, status, reason.as_deref())
            .await
            .map_err(OmsError::Storage)?;

        if status == PlanStatus::Completed {
            if let Err(e) = record_plan_pnl(
                self.db(),
                self.kv(),
                user_id,
                plan_id,
                mode,
                plan.kind,
                &self.settings.exchange_id,
            )
            .await
            {
                tracing::warn!(error = %e, %plan_id, "plan pnl recording failed");
            }
        }

        let _ = self
            .db()
            .append_plan_leg(
                mode,
                plan_id,
                PlanLeg::ReconcileSummary {
                    summary: summary.clone(),
                },
            )
            .await;

        Ok(ReconcileResult {
            reconciled: last,
            rounds,
            auto_cancel: false,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> StatusCounts {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn terminal_means_no_action() {
        let action = preview_next_action(true, false, false, false, &counts(&[("filled", 3)]));
        assert_eq!(action, NextAction::None);
        // Terminal wins even when flags are messy.
        let action = preview_next_action(true, true, true, true, &counts(&[("filled", 3)]));
        assert_eq!(action, NextAction::None);
    }

    #[test]
    fn auto_cancel_waits_for_cancel() {
        let action = preview_next_action(false, true, false, false, &counts(&[("pending", 1)]));
        assert_eq!(action, NextAction::WaitCancel);
    }

    #[test]
    fn exhausted_budgets_with_open_orders_suggest_auto_cancel() {
        let action = preview_next_action(false, false, true, false, &counts(&[("pending", 2)]));
        assert_eq!(action, NextAction::ConsiderAutoCancel);
        let action = preview_next_action(
            false,
            false,
            false,
            true,
            &counts(&[("partially_filled", 1), ("filled", 1)]),
        );
        assert_eq!(action, NextAction::ConsiderAutoCancel);

        // Exhausted but nothing actionable left: keep reconciling.
        let action = preview_next_action(false, false, true, false, &counts(&[("filled", 1)]));
        assert_eq!(action, NextAction::ReconcileAgain);
    }

    #[test]
    fn otherwise_reconcile_again() {
        let action = preview_next_action(false, false, false, false, &counts(&[("pending", 1)]));
        assert_eq!(action, NextAction::ReconcileAgain);
    }
}
