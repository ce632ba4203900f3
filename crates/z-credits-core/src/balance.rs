//! Cached per-user credit balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CreditAllocation, CreditDeduction, LedgerError, Result, UserId};

fn overflow() -> LedgerError {
    LedgerError::Validation("credit balance out of range".into())
}

/// The fast-read view of a user's credits.
///
/// One row per user. After a reconciliation the amount equals the sum of all
/// allocations minus the sum of all deductions for that user; between
/// reconciliations it reflects allocations applied since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// The user ID.
    pub user_id: UserId,

    /// Current credits. Negative values signal over-consumption.
    pub amount: i64,

    /// When the row was last written.
    pub last_updated: DateTime<Utc>,
}

impl CreditBalance {
    /// Create an empty balance row.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            amount: 0,
            last_updated: Utc::now(),
        }
    }

    /// Apply a signed delta and stamp the row.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if the amount would overflow; the row
    /// is left unchanged.
    pub fn apply(&mut self, delta: i64, now: DateTime<Utc>) -> Result<()> {
        self.amount = self.amount.checked_add(delta).ok_or_else(overflow)?;
        self.last_updated = now;
        Ok(())
    }

    /// Whether the user has consumed more than was granted.
    #[must_use]
    pub const fn is_overdrawn(&self) -> bool {
        self.amount < 0
    }
}

/// Totals obtained by replaying a user's full fact history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replay {
    /// Sum of allocation amounts (signed; adjustments may be negative).
    pub allocated: i64,
    /// Sum of deduction amounts.
    pub deducted: i64,
    /// Number of allocation rows replayed.
    pub allocation_count: usize,
    /// Number of deduction rows replayed.
    pub deduction_count: usize,
}

impl Replay {
    /// Fold both fact logs.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if either total overflows.
    pub fn of(allocations: &[CreditAllocation], deductions: &[CreditDeduction]) -> Result<Self> {
        let allocated = allocations
            .iter()
            .try_fold(0_i64, |total, a| total.checked_add(a.amount))
            .ok_or_else(overflow)?;
        let deducted = deductions
            .iter()
            .try_fold(0_i64, |total, d| total.checked_add(d.amount))
            .ok_or_else(overflow)?;

        Ok(Self {
            allocated,
            deducted,
            allocation_count: allocations.len(),
            deduction_count: deductions.len(),
        })
    }

    /// Authoritative balance: allocated minus deducted.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if the difference overflows.
    pub fn balance(&self) -> Result<i64> {
        self.allocated
            .checked_sub(self.deducted)
            .ok_or_else(overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_balance_is_zero() {
        let balance = CreditBalance::new(UserId::generate());
        assert_eq!(balance.amount, 0);
        assert!(!balance.is_overdrawn());
    }

    #[test]
    fn replay_with_only_deductions_is_negative() {
        let user_id = UserId::generate();
        let deductions = vec![CreditDeduction::new(user_id, 1000, "inference")];
        let replay = Replay::of(&[], &deductions).unwrap();

        assert_eq!(replay.balance().unwrap(), -1000);
        assert_eq!(replay.deduction_count, 1);
    }

    #[test]
    fn replay_sums_signed_adjustments() {
        let user_id = UserId::generate();
        let allocations = vec![
            CreditAllocation::bonus(user_id, 5000, "promo".into(), None),
            CreditAllocation::adjustment(
                user_id,
                crate::SubscriptionId::generate(),
                -1200,
                crate::ProrationEventId::generate(),
                "reversal".into(),
            ),
        ];
        let deductions = vec![CreditDeduction::new(user_id, 300, "inference")];

        assert_eq!(
            Replay::of(&allocations, &deductions).unwrap().balance().unwrap(),
            3500
        );
    }

    #[test]
    fn apply_updates_amount() {
        let mut balance = CreditBalance::new(UserId::generate());
        balance.apply(-10, Utc::now()).unwrap();
        assert!(balance.is_overdrawn());
    }

    #[test]
    fn apply_rejects_overflow_and_keeps_amount() {
        let mut balance = CreditBalance::new(UserId::generate());
        balance.apply(i64::MAX, Utc::now()).unwrap();

        let result = balance.apply(1, Utc::now());

        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(balance.amount, i64::MAX);
    }

    #[test]
    fn replay_rejects_overflowing_totals() {
        let user_id = UserId::generate();
        let allocations = vec![
            CreditAllocation::bonus(user_id, i64::MAX, "a".into(), None),
            CreditAllocation::bonus(user_id, 1, "b".into(), None),
        ];
        assert!(matches!(
            Replay::of(&allocations, &[]),
            Err(LedgerError::Validation(_))
        ));

        // Totals fit but the difference does not
        let clawback = CreditAllocation::adjustment(
            user_id,
            crate::SubscriptionId::generate(),
            i64::MIN,
            crate::ProrationEventId::generate(),
            "reversal".into(),
        );
        let deductions = vec![CreditDeduction::new(user_id, 1, "inference")];
        let replay = Replay::of(&[clawback], &deductions).unwrap();
        assert!(matches!(replay.balance(), Err(LedgerError::Validation(_))));
    }
}
