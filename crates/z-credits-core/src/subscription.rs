//! Read-only subscription snapshot supplied by subscription management.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LedgerError, Result, SubscriptionId, UserId};

/// A subscription tier name (e.g. `"pro"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(String);

impl Tier {
    /// Create a tier from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tier name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// How often the subscription bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Billed every month.
    Monthly,
    /// Billed every year.
    Annual,
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active.
    Active,

    /// Subscription was cancelled (still active until period end).
    Cancelled,

    /// Payment failed, subscription is past due.
    PastDue,
}

/// Base price per billing period for each tier, in cents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceBook(BTreeMap<Tier, i64>);

impl PriceBook {
    /// Create an empty price book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tier price.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<Tier>, price_cents: i64) -> Self {
        self.0.insert(tier.into(), price_cents);
        self
    }

    /// Look up the price of a tier.
    #[must_use]
    pub fn price_cents(&self, tier: &Tier) -> Option<i64> {
        self.0.get(tier).copied()
    }
}

/// A snapshot of a subscription at the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID.
    pub id: SubscriptionId,

    /// Owner of the subscription.
    pub user_id: UserId,

    /// Current tier.
    pub tier: Tier,

    /// Current status.
    pub status: SubscriptionStatus,

    /// Billing interval.
    pub interval: BillingInterval,

    /// Start of the current billing cycle.
    pub billing_cycle_start: DateTime<Utc>,

    /// End of the current billing cycle.
    pub billing_cycle_end: DateTime<Utc>,

    /// Tier prices for this subscription's interval.
    pub prices: PriceBook,
}

impl Subscription {
    /// Base price of `tier` for one full billing cycle.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if the tier is not priced.
    pub fn base_price_for_tier(&self, tier: &Tier) -> Result<i64> {
        self.prices
            .price_cents(tier)
            .ok_or_else(|| LedgerError::Validation(format!("tier {tier} has no price")))
    }

    /// Check if the subscription is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription() -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::generate(),
            user_id: UserId::generate(),
            tier: Tier::new("pro"),
            status: SubscriptionStatus::Active,
            interval: BillingInterval::Monthly,
            billing_cycle_start: now - Duration::days(20),
            billing_cycle_end: now + Duration::days(10),
            prices: PriceBook::new().with_tier("pro", 1900).with_tier("pro_max", 4500),
        }
    }

    #[test]
    fn price_lookup() {
        let sub = subscription();
        assert_eq!(sub.base_price_for_tier(&Tier::new("pro_max")).unwrap(), 4500);
        assert!(matches!(
            sub.base_price_for_tier(&Tier::new("enterprise")),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn price_book_serializes_as_map() {
        let book = PriceBook::new().with_tier("pro", 1900);
        let json = serde_json::to_value(&book).unwrap();
        assert_eq!(json, serde_json::json!({ "pro": 1900 }));
    }

    #[test]
    fn active_status() {
        let mut sub = subscription();
        assert!(sub.is_active());
        sub.status = SubscriptionStatus::PastDue;
        assert!(!sub.is_active());
    }
}
