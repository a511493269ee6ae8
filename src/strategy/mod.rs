//! Rebalancing strategy.
//!
//! Contains the core logic for:
//! - Risk-adjusted allocation across strategies
//! - The deviation gate deciding whether to act
//! - Transaction submission and confirmation

mod executor;
mod optimizer;
mod rebalancer;

pub use executor::TransactionExecutor;
pub use optimizer::{AllocationOptimizer, AllocationTarget, StrategyInput};
pub use rebalancer::{
    Allocation, PlanLeg, RebalanceDecision, RebalanceGate, RebalancePlan, StrategyDrift,
};
