//! Per-session budget metering.
//!
//! The protocol has two halves.  At acceptance the session state machine
//! *reserves* the worst-case cost of the execution (full wall-clock limit
//! at the tool's rate); at the terminal outcome it *commits* the actual
//! cost and releases the reservation.  Because the reservation happens
//! inside the same compare-and-swap as the state check, two concurrent
//! executes that are individually affordable but jointly over budget
//! resolve deterministically: one reserves, the other is refused before
//! any process spawns.
//!
//! Violations reject — nothing here ever clamps a value to fit.

use hireling_types::{Cents, Session};

/// Milliseconds per billing minute.
const MINUTE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// The request needs more budget than the session has left.
    /// Recoverable only by ending the session.
    #[error("budget exhausted: requested {requested}¢, {remaining}¢ remaining")]
    Exhausted { requested: Cents, remaining: Cents },
    /// A commit did not match its reservation.  Indicates a bookkeeping
    /// bug, not a caller mistake.
    #[error("commit of {amount}¢ exceeds outstanding reservation of {reserved}¢")]
    CommitExceedsReservation { amount: Cents, reserved: Cents },
}

/// Cost of one execution: `ceil(billed_ms / 1 min * price_per_minute)`.
///
/// Ceiling rounding is per execution; fractional minutes never accumulate
/// across a session.  Zero billed time costs zero.
pub fn execution_cost(billed_ms: u64, price_per_minute: Cents) -> Cents {
    if billed_ms == 0 || price_per_minute == 0 {
        return 0;
    }
    // u128 intermediate: ms * price can exceed u64 for absurd inputs.
    let numerator = billed_ms as u128 * price_per_minute as u128;
    numerator.div_ceil(MINUTE_MS as u128) as Cents
}

/// Reserve `projected` cents against the session's remaining budget.
///
/// Fails with [`BudgetError::Exhausted`] when
/// `consumed + reserved + projected > budget_allowance`; the session is
/// untouched on failure.
pub fn reserve(session: &mut Session, projected: Cents) -> Result<(), BudgetError> {
    let outstanding = session
        .consumed
        .checked_add(session.reserved)
        .and_then(|c| c.checked_add(projected));
    match outstanding {
        Some(total) if total <= session.budget_allowance => {
            session.reserved += projected;
            Ok(())
        }
        _ => Err(BudgetError::Exhausted {
            requested: projected,
            remaining: session.remaining_budget(),
        }),
    }
}

/// Release a reservation without billing anything.  Used when an accepted
/// execution is abandoned before a process could be spawned.
pub fn release(session: &mut Session, projected: Cents) -> Result<(), BudgetError> {
    if projected > session.reserved {
        return Err(BudgetError::CommitExceedsReservation {
            amount: projected,
            reserved: session.reserved,
        });
    }
    session.reserved -= projected;
    Ok(())
}

/// Commit the terminal outcome of a reserved execution: release the
/// `projected` reservation, add the `actual` cost to `consumed`, and add
/// the billed time to `effective_ms`.
///
/// `actual` can never exceed `projected` because billed time is capped at
/// the tool's wall-clock limit; a violation is reported, not absorbed.
pub fn commit(
    session: &mut Session,
    projected: Cents,
    actual: Cents,
    billed_ms: u64,
) -> Result<(), BudgetError> {
    if projected > session.reserved {
        return Err(BudgetError::CommitExceedsReservation {
            amount: projected,
            reserved: session.reserved,
        });
    }
    if actual > projected {
        return Err(BudgetError::CommitExceedsReservation {
            amount: actual,
            reserved: projected,
        });
    }
    session.reserved -= projected;
    session.consumed += actual;
    session.effective_ms += billed_ms;
    Ok(())
}
