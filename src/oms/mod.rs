//! Order Management Service: turns the best eligible decision into a
//! multi-leg execution plan, drives paper or live order placement, reconciles
//! fills to terminal state, and records plan-level PnL.

pub mod extract;
pub mod pnl;
pub mod projector;
pub mod reconcile;
pub mod service;

pub use reconcile::{preview_next_action, ReconcileResult};
pub use service::{ExecutionResult, OmsService, OmsSettings, PlanSweep, RiskGate};
