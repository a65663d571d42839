//! The settlement record: one immutable payout split per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Cents;

/// Payout split for a completed session.  Immutable once created; the
/// settlement store enforces at most one per session id.
///
/// `provider_payout + platform_fee + reserve_amount == total_amount`
/// exactly — the reserve share absorbs all rounding loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub session_id: Uuid,
    pub total_amount: Cents,
    pub provider_payout: Cents,
    pub platform_fee: Cents,
    pub reserve_amount: Cents,
    /// Audit reference: hex sha-256 over the settled fields.
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}
