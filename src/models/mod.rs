pub mod decision;
pub mod market;
pub mod opportunity;
pub mod order;
pub mod plan;
pub mod position;

pub use decision::{Decision, MarketRegime, StrategyType};
pub use market::{BestBidAsk, FundingInfo, OrderBookTob};
pub use opportunity::{CashCarryDirection, Opportunity};
pub use order::{AccountType, Fill, Order, OrderSide, OrderStatus, OrderType, TradingMode};
pub use plan::{
    CompensationResult, CompensationSummary, ExecutionPlan, NextAction, OpStats, OrdersSummary,
    PlanKind, PlanLeg, PlanStatus, PollRound, PollSummary, ReconcileOutcome, ReconcileRequest,
    ReconcileRound, ReconcileStats, StatusCounts,
};
pub use position::{LedgerEntry, PlanPnl, PnlRecord, Position};
