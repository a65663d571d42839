//! The session record and its lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Cents, Versioned};

/// Lifecycle of a rental session.  Transitions are forward-only:
/// `Pending → Active → Completed → Settled`.  The session state machine
/// rejects everything else; these variants carry no behaviour beyond the
/// adjacency check in [`SessionStatus::may_become`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, budget reserved, provider slot taken.  No tool may run yet.
    Pending,
    /// The agent may execute tools.
    Active,
    /// Ended normally; totals frozen, provider slot released.
    Completed,
    /// Terminal.  Exactly one settlement exists for the session.
    Settled,
}

impl SessionStatus {
    /// Whether `self → next` is a legal forward transition.
    pub fn may_become(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Completed, SessionStatus::Settled)
        )
    }

    /// Settlement and workspace teardown become legal from here on.
    pub fn is_over(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Settled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Settled => "settled",
        };
        f.write_str(s)
    }
}

/// One agent's bounded rental of this provider's compute.
///
/// Invariants, enforced by the metering arithmetic and never by clamping:
/// `consumed ≤ budget_allowance` and `consumed + reserved ≤
/// budget_allowance` at all times; `consumed` and `effective_ms` are
/// monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub agent_id: String,
    pub provider_id: String,
    pub status: SessionStatus,
    /// Fixed at creation; the hard spending ceiling.
    pub budget_allowance: Cents,
    /// Total actually billed so far.  Monotone.
    pub consumed: Cents,
    /// Worst-case cost of in-flight executions, reserved at acceptance and
    /// released when each execution commits its actual cost.  Bookkeeping
    /// only — never part of settlement.
    pub reserved: Cents,
    /// Cumulative billed execution time in milliseconds.
    pub effective_ms: u64,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter; bumped by the store on update.
    #[serde(default)]
    pub version: u64,
}

impl Session {
    pub fn new(agent_id: String, provider_id: String, budget_allowance: Cents) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            provider_id,
            status: SessionStatus::Pending,
            budget_allowance,
            consumed: 0,
            reserved: 0,
            effective_ms: 0,
            created_at: Utc::now(),
            ended_at: None,
            settled_at: None,
            version: 0,
        }
    }

    /// Budget still spendable: allowance minus billed and in-flight
    /// reservations.
    pub fn remaining_budget(&self) -> Cents {
        self.budget_allowance
            .saturating_sub(self.consumed)
            .saturating_sub(self.reserved)
    }
}

impl Versioned for Session {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use SessionStatus::*;
        assert!(Pending.may_become(Active));
        assert!(Active.may_become(Completed));
        assert!(Completed.may_become(Settled));

        assert!(!Pending.may_become(Completed));
        assert!(!Pending.may_become(Settled));
        assert!(!Active.may_become(Pending));
        assert!(!Active.may_become(Settled));
        assert!(!Completed.may_become(Active));
        assert!(!Settled.may_become(Pending));
        assert!(!Settled.may_become(Settled));
    }

    #[test]
    fn new_session_starts_pending_and_unspent() {
        let s = Session::new("agent-1".into(), "prov-1".into(), 1_000);
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(s.consumed, 0);
        assert_eq!(s.reserved, 0);
        assert_eq!(s.effective_ms, 0);
        assert_eq!(s.remaining_budget(), 1_000);
        assert!(s.ended_at.is_none());
        assert!(s.settled_at.is_none());
    }

    #[test]
    fn remaining_budget_accounts_for_reservations() {
        let mut s = Session::new("a".into(), "p".into(), 1_000);
        s.consumed = 300;
        s.reserved = 200;
        assert_eq!(s.remaining_budget(), 500);
    }

    #[test]
    fn status_serde_uses_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let back: SessionStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(back, SessionStatus::Pending);
    }
}
