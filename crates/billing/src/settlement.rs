//! Settlement: the fixed-percentage payout split, created exactly once
//! per session.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use hireling_types::{Cents, Session, Settlement};

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// Permanently terminal for the session: settlement is never retried.
    #[error("session {0} is already settled")]
    AlreadySettled(Uuid),
    /// Split percentages must sum to exactly 100.
    #[error("split percentages sum to {0}, expected 100")]
    BadSplit(u32),
}

/// Percentage split between provider, platform and reserve.  Configurable
/// but always summing to exactly 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitPolicy {
    pub provider_pct: u32,
    pub platform_pct: u32,
    pub reserve_pct: u32,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            provider_pct: 90,
            platform_pct: 7,
            reserve_pct: 3,
        }
    }
}

impl SplitPolicy {
    pub fn validate(&self) -> Result<(), SettlementError> {
        let sum = self.provider_pct + self.platform_pct + self.reserve_pct;
        if sum != 100 {
            return Err(SettlementError::BadSplit(sum));
        }
        Ok(())
    }

    /// Split `total` into (provider, platform, reserve).
    ///
    /// Provider and platform shares round down; the reserve takes the
    /// remainder, so the three parts always sum to `total` exactly.
    pub fn split(&self, total: Cents) -> SplitBreakdown {
        // u128 intermediates: totals near u64::MAX must not overflow the
        // percentage product.
        let provider_payout = (total as u128 * self.provider_pct as u128 / 100) as Cents;
        let platform_fee = (total as u128 * self.platform_pct as u128 / 100) as Cents;
        let reserve_amount = total - provider_payout - platform_fee;
        SplitBreakdown {
            total_amount: total,
            provider_payout,
            platform_fee,
            reserve_amount,
        }
    }
}

/// A computed split that has not (yet) been persisted.  `end` returns this
/// as a preview; only `settle` turns it into a [`Settlement`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBreakdown {
    pub total_amount: Cents,
    pub provider_payout: Cents,
    pub platform_fee: Cents,
    pub reserve_amount: Cents,
}

// ── Settlement store ─────────────────────────────────────────────────────────

/// Persistence seam for settlement records, keyed by *session* id.
/// `create` is the once-only guard: inserting for a session that already
/// has a settlement fails and leaves the prior record untouched.
pub trait SettlementStore: Send + Sync {
    fn create(&self, settlement: Settlement) -> Result<(), SettlementError>;
    fn get_by_session(&self, session_id: Uuid) -> Option<Settlement>;
    fn list(&self) -> Vec<Settlement>;
}

/// In-process settlement store.
#[derive(Default)]
pub struct MemSettlementStore {
    records: RwLock<HashMap<Uuid, Settlement>>,
}

impl MemSettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettlementStore for MemSettlementStore {
    fn create(&self, settlement: Settlement) -> Result<(), SettlementError> {
        let mut records = self.records.write().expect("settlement lock poisoned");
        if records.contains_key(&settlement.session_id) {
            return Err(SettlementError::AlreadySettled(settlement.session_id));
        }
        records.insert(settlement.session_id, settlement);
        Ok(())
    }

    fn get_by_session(&self, session_id: Uuid) -> Option<Settlement> {
        let records = self.records.read().expect("settlement lock poisoned");
        records.get(&session_id).cloned()
    }

    fn list(&self) -> Vec<Settlement> {
        let records = self.records.read().expect("settlement lock poisoned");
        records.values().cloned().collect()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Turns a completed session's consumption into exactly one settlement
/// record.  State gating (only `completed` sessions reach this point)
/// belongs to the session state machine; the engine owns the split math
/// and the uniqueness guarantee.
pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    policy: SplitPolicy,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn SettlementStore>, policy: SplitPolicy) -> Result<Self, SettlementError> {
        policy.validate()?;
        Ok(Self { store, policy })
    }

    /// Compute the split without persisting anything.
    pub fn preview(&self, total: Cents) -> SplitBreakdown {
        self.policy.split(total)
    }

    /// Create the settlement for `session`.  A second call for the same
    /// session fails with [`SettlementError::AlreadySettled`] and changes
    /// nothing — deliberately an error, not a silent return of the prior
    /// record, so double-settlement attempts stay observable.
    pub fn settle(&self, session: &Session) -> Result<Settlement, SettlementError> {
        let breakdown = self.policy.split(session.consumed);
        let settled_at = Utc::now();
        let id = Uuid::new_v4();
        let reference = settlement_reference(id, session.id, &breakdown, settled_at.timestamp());

        let settlement = Settlement {
            id,
            session_id: session.id,
            total_amount: breakdown.total_amount,
            provider_payout: breakdown.provider_payout,
            platform_fee: breakdown.platform_fee,
            reserve_amount: breakdown.reserve_amount,
            reference,
            settled_at,
        };
        self.store.create(settlement.clone())?;
        Ok(settlement)
    }

    pub fn get_by_session(&self, session_id: Uuid) -> Option<Settlement> {
        self.store.get_by_session(session_id)
    }
}

/// Hex sha-256 over the settled fields — the audit reference carried on
/// the record.
fn settlement_reference(
    id: Uuid,
    session_id: Uuid,
    breakdown: &SplitBreakdown,
    unix_ts: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(breakdown.total_amount.to_be_bytes());
    hasher.update(breakdown.provider_payout.to_be_bytes());
    hasher.update(breakdown.platform_fee.to_be_bytes());
    hasher.update(breakdown.reserve_amount.to_be_bytes());
    hasher.update(unix_ts.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hireling_types::{Session, SessionStatus};

    fn completed_session(consumed: Cents) -> Session {
        let mut s = Session::new("agent".into(), "provider".into(), consumed.max(1));
        s.status = SessionStatus::Completed;
        s.consumed = consumed;
        s
    }

    fn engine() -> SettlementEngine {
        SettlementEngine::new(Arc::new(MemSettlementStore::new()), SplitPolicy::default()).unwrap()
    }

    // ── split math ─────────────────────────────────────────────────────────

    #[test]
    fn default_split_on_a_round_dollar() {
        let b = SplitPolicy::default().split(100);
        assert_eq!(b.provider_payout, 90);
        assert_eq!(b.platform_fee, 7);
        assert_eq!(b.reserve_amount, 3);
    }

    #[test]
    fn reserve_absorbs_rounding_loss() {
        // 999¢: floors lose 2¢ which land in the reserve share.
        let b = SplitPolicy::default().split(999);
        assert_eq!(b.provider_payout, 899);
        assert_eq!(b.platform_fee, 69);
        assert_eq!(b.reserve_amount, 31);
        assert_eq!(b.provider_payout + b.platform_fee + b.reserve_amount, 999);
    }

    #[test]
    fn split_sums_exactly_for_every_small_total() {
        let policy = SplitPolicy::default();
        for total in 0..2_000 {
            let b = policy.split(total);
            assert_eq!(
                b.provider_payout + b.platform_fee + b.reserve_amount,
                total,
                "leakage at total={total}"
            );
        }
    }

    #[test]
    fn custom_split_must_sum_to_hundred() {
        let bad = SplitPolicy {
            provider_pct: 80,
            platform_pct: 15,
            reserve_pct: 3,
        };
        assert!(matches!(bad.validate(), Err(SettlementError::BadSplit(98))));
        assert!(
            SettlementEngine::new(Arc::new(MemSettlementStore::new()), bad).is_err(),
            "engine construction must reject a bad policy"
        );
    }

    #[test]
    fn zero_total_settles_to_zeros() {
        let b = SplitPolicy::default().split(0);
        assert_eq!(b.provider_payout, 0);
        assert_eq!(b.platform_fee, 0);
        assert_eq!(b.reserve_amount, 0);
    }

    // ── once-only settlement ───────────────────────────────────────────────

    #[test]
    fn settle_creates_exactly_one_record() {
        let engine = engine();
        let session = completed_session(1_000);

        let first = engine.settle(&session).unwrap();
        assert_eq!(first.total_amount, 1_000);
        assert_eq!(first.provider_payout, 900);
        assert!(!first.reference.is_empty());

        let err = engine.settle(&session).unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled(id) if id == session.id));

        // Prior record unchanged by the failed second attempt.
        let stored = engine.get_by_session(session.id).unwrap();
        assert_eq!(stored, first);
    }

    #[test]
    fn settlements_for_distinct_sessions_are_independent() {
        let engine = engine();
        let a = completed_session(100);
        let b = completed_session(200);
        engine.settle(&a).unwrap();
        engine.settle(&b).unwrap();
        assert_eq!(engine.get_by_session(a.id).unwrap().total_amount, 100);
        assert_eq!(engine.get_by_session(b.id).unwrap().total_amount, 200);
    }

    #[test]
    fn reference_is_unique_per_settlement() {
        let engine = engine();
        let a = completed_session(100);
        let b = completed_session(100);
        let ra = engine.settle(&a).unwrap().reference;
        let rb = engine.settle(&b).unwrap().reference;
        assert_ne!(ra, rb);
        assert_eq!(ra.len(), 64);
    }
}
