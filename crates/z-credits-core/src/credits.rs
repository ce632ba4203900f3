//! Credit fact records: allocations (grants) and deductions (consumption).
//!
//! Both logs are append-only. A row is never updated or deleted once written;
//! corrections are new rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AllocationId, DeductionId, ProrationEventId, SubscriptionId, UserId};

/// An additive credit grant.
///
/// `amount` is positive for every grant made through the public allocation
/// API. Only `AllocationSource::Adjustment` rows, written when a proration is
/// reversed, may carry a negative amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAllocation {
    /// Unique allocation ID (ULID for time-ordering).
    pub id: AllocationId,

    /// The user receiving the credits.
    pub user_id: UserId,

    /// Subscription the grant belongs to. Absent for bonus and referral grants.
    pub subscription_id: Option<SubscriptionId>,

    /// Credits granted (1 credit = 1 cent).
    pub amount: i64,

    /// Why the credits were granted.
    pub source: AllocationSource,

    /// Start of the period the grant covers.
    pub allocation_period_start: DateTime<Utc>,

    /// End of the period for time-boxed grants.
    pub allocation_period_end: Option<DateTime<Utc>>,

    /// Human-readable description.
    pub description: String,

    /// Proration event this row compensates, for adjustment rows.
    pub reverses: Option<ProrationEventId>,

    /// Additional context (reason, referrer, etc.).
    pub metadata: serde_json::Value,

    /// When the allocation was written.
    pub created_at: DateTime<Utc>,
}

impl CreditAllocation {
    /// Create an allocation with no subscription, period end or metadata.
    #[must_use]
    pub fn new(user_id: UserId, amount: i64, source: AllocationSource, description: String) -> Self {
        let now = Utc::now();
        Self {
            id: AllocationId::generate(),
            user_id,
            subscription_id: None,
            amount,
            source,
            allocation_period_start: now,
            allocation_period_end: None,
            description,
            reverses: None,
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    /// Create a subscription renewal grant.
    #[must_use]
    pub fn subscription(
        user_id: UserId,
        subscription_id: SubscriptionId,
        amount: i64,
        period_end: Option<DateTime<Utc>>,
    ) -> Self {
        let mut allocation = Self::new(
            user_id,
            amount,
            AllocationSource::Subscription,
            format!("Subscription credit grant of {amount} credits"),
        );
        allocation.subscription_id = Some(subscription_id);
        allocation.allocation_period_end = period_end;
        allocation
    }

    /// Create a bonus grant, optionally expiring.
    #[must_use]
    pub fn bonus(
        user_id: UserId,
        amount: i64,
        reason: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut allocation = Self::new(user_id, amount, AllocationSource::Bonus, reason.clone());
        allocation.allocation_period_end = expires_at;
        allocation.metadata = serde_json::json!({ "reason": reason });
        allocation
    }

    /// Create a referral grant.
    #[must_use]
    pub fn referral(user_id: UserId, amount: i64, referrer: UserId) -> Self {
        let mut allocation = Self::new(
            user_id,
            amount,
            AllocationSource::Referral,
            format!("Referral bonus of {amount} credits"),
        );
        allocation.metadata = serde_json::json!({ "referrer": referrer.to_string() });
        allocation
    }

    /// Create a signed compensating row for a reversed proration event.
    #[must_use]
    pub fn adjustment(
        user_id: UserId,
        subscription_id: SubscriptionId,
        amount: i64,
        event_id: ProrationEventId,
        reason: String,
    ) -> Self {
        let mut allocation = Self::new(
            user_id,
            amount,
            AllocationSource::Adjustment,
            format!("Reversal of proration {event_id}: {reason}"),
        );
        allocation.subscription_id = Some(subscription_id);
        allocation.reverses = Some(event_id);
        allocation
    }

    /// Attach metadata to the allocation.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Why credits were granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    /// Subscription renewal or proration credit.
    Subscription,

    /// Promotional or admin-issued bonus.
    Bonus,

    /// Referral reward.
    Referral,

    /// Balance carried over from a legacy system.
    Migration,

    /// Signed compensating entry written by a proration reversal.
    Adjustment,
}

impl AllocationSource {
    /// Get the source name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Bonus => "bonus",
            Self::Referral => "referral",
            Self::Migration => "migration",
            Self::Adjustment => "adjustment",
        }
    }

    /// Whether the source requires a subscription reference.
    #[must_use]
    pub const fn requires_subscription(&self) -> bool {
        matches!(self, Self::Subscription)
    }
}

/// A consumption event written by the metering side of the platform.
///
/// The ledger only reads these rows during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDeduction {
    /// Unique deduction ID.
    pub id: DeductionId,

    /// The user whose credits were consumed.
    pub user_id: UserId,

    /// Credits consumed. Always positive.
    pub amount: i64,

    /// What consumed the credits (e.g. `"inference"`).
    pub deduction_type: String,

    /// When the consumption happened.
    pub timestamp: DateTime<Utc>,
}

impl CreditDeduction {
    /// Create a deduction stamped with the current time.
    #[must_use]
    pub fn new(user_id: UserId, amount: i64, deduction_type: impl Into<String>) -> Self {
        Self {
            id: DeductionId::generate(),
            user_id,
            amount: amount.abs(),
            deduction_type: deduction_type.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonus_allocation_has_no_subscription() {
        let user_id = UserId::generate();
        let allocation = CreditAllocation::bonus(user_id, 1000, "Launch promo".into(), None);

        assert_eq!(allocation.amount, 1000);
        assert_eq!(allocation.source, AllocationSource::Bonus);
        assert!(allocation.subscription_id.is_none());
        assert_eq!(allocation.metadata["reason"], "Launch promo");
    }

    #[test]
    fn subscription_allocation_references_subscription() {
        let user_id = UserId::generate();
        let sub_id = SubscriptionId::generate();
        let allocation = CreditAllocation::subscription(user_id, sub_id, 2500, None);

        assert_eq!(allocation.subscription_id, Some(sub_id));
        assert!(allocation.source.requires_subscription());
    }

    #[test]
    fn adjustment_may_be_negative() {
        let allocation = CreditAllocation::adjustment(
            UserId::generate(),
            SubscriptionId::generate(),
            -867,
            ProrationEventId::generate(),
            "chargeback".into(),
        );

        assert_eq!(allocation.amount, -867);
        assert_eq!(allocation.source, AllocationSource::Adjustment);
        assert!(allocation.reverses.is_some());
    }

    #[test]
    fn deduction_amount_is_positive() {
        let deduction = CreditDeduction::new(UserId::generate(), -40, "inference");
        assert_eq!(deduction.amount, 40);
    }

    #[test]
    fn source_serializes_snake_case() {
        let json = serde_json::to_string(&AllocationSource::Referral).unwrap();
        assert_eq!(json, "\"referral\"");
    }
}
