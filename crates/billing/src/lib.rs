//! Billing: metering arithmetic and the settlement split.
//!
//! All money is integer cents.  The meter side owns the
//! reserve-at-acceptance / commit-at-completion protocol that keeps
//! `consumed` inside the budget under concurrency; the settlement side
//! turns a frozen session total into exactly one immutable payout record.

pub mod meter;
pub mod settlement;

pub use meter::{execution_cost, BudgetError};
pub use settlement::{
    MemSettlementStore, SettlementEngine, SettlementError, SettlementStore, SplitBreakdown,
    SplitPolicy,
};
