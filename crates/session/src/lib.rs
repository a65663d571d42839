//! The session state machine: the only component that invokes the
//! execution engine or moves money on the meter.
//!
//! Lifecycle is forward-only (`pending → active → completed → settled`)
//! and every transition or debit happens inside a single versioned
//! compare-and-swap on the session record, so "is this legal" and "apply
//! it" are one atomic unit.  An illegal request fails loudly and mutates
//! nothing.

mod manager;

pub use manager::{ExecuteReceipt, SessionManager};

use uuid::Uuid;

use hireling_billing::{BudgetError, SettlementError};
use hireling_exec::PrepareError;
use hireling_store::StoreError;
use hireling_tools::ValidationError;
use hireling_types::SessionStatus;

/// Everything the state machine can refuse or fail with.  Each variant
/// carries a stable machine-readable kind for the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("cannot {action} a {status} session")]
    State {
        action: &'static str,
        status: SessionStatus,
    },
    #[error("executions are still in flight; wait for them to finish")]
    ExecutionsInFlight,
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error("workspace i/o failure: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("storage failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            // A missing session record is the caller's 404, not an
            // internal fault.
            StoreError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Store(other),
        }
    }
}

impl SessionError {
    /// Stable machine-readable error kind carried on every HTTP error
    /// response.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) | SessionError::UnknownTool(_) => "not_found",
            SessionError::Invalid(_) | SessionError::Validation(_) => "validation",
            SessionError::Prepare(PrepareError::PathEscape { .. }) => "validation",
            SessionError::State { .. } | SessionError::ExecutionsInFlight => "invalid_state",
            SessionError::Budget(BudgetError::Exhausted { .. }) => "budget_exhausted",
            SessionError::Settlement(SettlementError::AlreadySettled(_)) => "already_settled",
            SessionError::Prepare(_)
            | SessionError::Budget(_)
            | SessionError::Settlement(_)
            | SessionError::Workspace(_)
            | SessionError::Store(_) => "internal",
        }
    }
}
