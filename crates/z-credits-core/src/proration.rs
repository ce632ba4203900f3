//! Proration calculator.
//!
//! Pure arithmetic over a subscription snapshot: no I/O, no clock reads. The
//! caller passes `now`, so identical inputs always produce identical output
//! down to the cent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::prorate_cents;
use crate::{BillingInterval, LedgerError, Result, Subscription, SubscriptionId, Tier, UserId};

const SECONDS_PER_DAY: i64 = 86_400;

/// Kind of subscription change, derived from the tier prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// New tier costs more.
    Upgrade,
    /// New tier costs less.
    Downgrade,
    /// Same price, different billing interval.
    CycleChange,
    /// Same price and interval (lateral move between equally priced tiers).
    Migration,
    /// Subscription ends; the unused portion is credited back.
    Cancellation,
}

impl ChangeType {
    /// Get the change type as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::CycleChange => "cycle_change",
            Self::Migration => "migration",
            Self::Cancellation => "cancellation",
        }
    }
}

/// What the caller wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ChangeRequest {
    /// Move to another tier, optionally switching billing interval.
    Tier {
        /// Target tier.
        tier: Tier,
        /// Target interval, if it changes.
        interval: Option<BillingInterval>,
    },
    /// Cancel the subscription now.
    Cancel,
}

impl ChangeRequest {
    /// Change tier while keeping the billing interval.
    #[must_use]
    pub fn tier(tier: impl Into<Tier>) -> Self {
        Self::Tier {
            tier: tier.into(),
            interval: None,
        }
    }

    /// Target tier, `None` for a cancellation.
    #[must_use]
    pub fn target_tier(&self) -> Option<&Tier> {
        match self {
            Self::Tier { tier, .. } => Some(tier),
            Self::Cancel => None,
        }
    }
}

/// Result of prorating a subscription change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationCalculation {
    /// Subscription being changed.
    pub subscription_id: SubscriptionId,
    /// Owner of the subscription.
    pub user_id: UserId,
    /// Tier before the change.
    pub from_tier: Tier,
    /// Tier after the change, `None` when cancelling.
    pub to_tier: Option<Tier>,
    /// Billing interval after the change, `None` when cancelling.
    pub to_interval: Option<BillingInterval>,
    /// Derived change type.
    pub change_type: ChangeType,
    /// Whole days left in the cycle, rounded up.
    pub days_remaining: i64,
    /// Whole days in the cycle.
    pub days_in_cycle: i64,
    /// Full-cycle price of the current tier, in cents.
    pub current_price_cents: i64,
    /// Full-cycle price of the target tier, in cents.
    pub new_price_cents: i64,
    /// Value of the unused part of the current tier, in cents.
    pub unused_credit_cents: i64,
    /// Cost of the remaining part of the cycle on the new tier, in cents.
    pub new_tier_prorated_cost_cents: i64,
    /// `new_tier_prorated_cost_cents - unused_credit_cents`. Positive is a charge.
    pub net_charge_cents: i64,
    /// The instant the calculation was made for.
    pub effective_date: DateTime<Utc>,
}

impl ProrationCalculation {
    /// Amount due today, zero when the change results in a credit.
    #[must_use]
    pub const fn charge_amount_cents(&self) -> i64 {
        if self.net_charge_cents > 0 {
            self.net_charge_cents
        } else {
            0
        }
    }

    /// Amount owed to the user, `|min(0, net)|`.
    #[must_use]
    pub const fn credit_amount_cents(&self) -> i64 {
        if self.net_charge_cents < 0 {
            -self.net_charge_cents
        } else {
            0
        }
    }
}

/// Whole days in `seconds`, rounded up.
fn ceil_days(seconds: i64) -> i64 {
    (seconds + SECONDS_PER_DAY - 1).div_euclid(SECONDS_PER_DAY)
}

/// Prorate a subscription change at `now`.
///
/// Both day counts are whole days rounded up: a cycle of 30 days and one
/// second counts as 31 days, and any started day still counts as remaining.
/// `days_remaining` is clamped to `0..=days_in_cycle`.
///
/// # Errors
///
/// - `LedgerError::InvalidCycle` if the billing cycle does not end after it starts.
/// - `LedgerError::Validation` if a tier has no price.
pub fn compute_proration(
    subscription: &Subscription,
    request: &ChangeRequest,
    now: DateTime<Utc>,
) -> Result<ProrationCalculation> {
    let cycle_seconds = (subscription.billing_cycle_end - subscription.billing_cycle_start)
        .num_seconds();
    if cycle_seconds <= 0 {
        return Err(LedgerError::InvalidCycle(format!(
            "cycle {} .. {} has no duration",
            subscription.billing_cycle_start, subscription.billing_cycle_end
        )));
    }

    let days_in_cycle = ceil_days(cycle_seconds);
    let remaining_seconds = (subscription.billing_cycle_end - now).num_seconds().max(0);
    let days_remaining = ceil_days(remaining_seconds).min(days_in_cycle);

    let current_price_cents = subscription.base_price_for_tier(&subscription.tier)?;
    let (new_price_cents, change_type) = match request {
        ChangeRequest::Cancel => (0, ChangeType::Cancellation),
        ChangeRequest::Tier { tier, interval } => {
            let new_price = subscription.base_price_for_tier(tier)?;
            let interval_changes = matches!(interval, Some(i) if *i != subscription.interval);
            let change_type = match new_price.cmp(&current_price_cents) {
                std::cmp::Ordering::Greater => ChangeType::Upgrade,
                std::cmp::Ordering::Less => ChangeType::Downgrade,
                std::cmp::Ordering::Equal if interval_changes => ChangeType::CycleChange,
                std::cmp::Ordering::Equal => ChangeType::Migration,
            };
            (new_price, change_type)
        }
    };

    let overflow = || LedgerError::Validation("proration amount out of range".into());
    let unused_credit_cents =
        prorate_cents(current_price_cents, days_remaining, days_in_cycle).ok_or_else(overflow)?;
    let new_tier_prorated_cost_cents =
        prorate_cents(new_price_cents, days_remaining, days_in_cycle).ok_or_else(overflow)?;

    Ok(ProrationCalculation {
        subscription_id: subscription.id,
        user_id: subscription.user_id,
        from_tier: subscription.tier.clone(),
        to_tier: request.target_tier().cloned(),
        to_interval: match request {
            ChangeRequest::Tier { interval, .. } => Some(interval.unwrap_or(subscription.interval)),
            ChangeRequest::Cancel => None,
        },
        change_type,
        days_remaining,
        days_in_cycle,
        current_price_cents,
        new_price_cents,
        unused_credit_cents,
        new_tier_prorated_cost_cents,
        net_charge_cents: new_tier_prorated_cost_cents - unused_credit_cents,
        effective_date: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PriceBook, SubscriptionStatus};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 21, 12, 0, 0).unwrap()
    }

    fn subscription(days_elapsed: i64, days_remaining: i64) -> Subscription {
        Subscription {
            id: SubscriptionId::generate(),
            user_id: UserId::generate(),
            tier: Tier::new("pro"),
            status: SubscriptionStatus::Active,
            interval: BillingInterval::Monthly,
            billing_cycle_start: now() - Duration::days(days_elapsed),
            billing_cycle_end: now() + Duration::days(days_remaining),
            prices: PriceBook::new()
                .with_tier("free", 0)
                .with_tier("pro", 1900)
                .with_tier("pro_plus", 1900)
                .with_tier("pro_max", 4500),
        }
    }

    #[test]
    fn upgrade_with_ten_of_thirty_days_left() {
        let sub = subscription(20, 10);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();

        assert_eq!(calc.days_remaining, 10);
        assert_eq!(calc.days_in_cycle, 30);
        assert_eq!(calc.unused_credit_cents, 633);
        assert_eq!(calc.new_tier_prorated_cost_cents, 1500);
        assert_eq!(calc.net_charge_cents, 867);
        assert_eq!(calc.change_type, ChangeType::Upgrade);
        assert_eq!(calc.charge_amount_cents(), 867);
        assert_eq!(calc.credit_amount_cents(), 0);
    }

    #[test]
    fn downgrade_surfaces_credit_amount() {
        let mut sub = subscription(20, 10);
        sub.tier = Tier::new("pro_max");
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro"), now()).unwrap();

        assert_eq!(calc.change_type, ChangeType::Downgrade);
        assert_eq!(calc.net_charge_cents, -867);
        assert_eq!(calc.credit_amount_cents(), 867);
    }

    #[test]
    fn same_tier_on_first_day_nets_zero() {
        let sub = subscription(0, 30);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro"), now()).unwrap();

        assert_eq!(calc.days_remaining, calc.days_in_cycle);
        assert_eq!(calc.net_charge_cents, 0);
        assert_eq!(calc.change_type, ChangeType::Migration);
    }

    #[test]
    fn first_day_values_equal_plain_price_difference() {
        let sub = subscription(0, 30);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();

        assert_eq!(calc.unused_credit_cents, 1900);
        assert_eq!(calc.new_tier_prorated_cost_cents, 4500);
        assert_eq!(calc.net_charge_cents, 2600);
    }

    #[test]
    fn last_day_has_no_unused_value() {
        let sub = subscription(30, 0);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();

        assert_eq!(calc.days_remaining, 0);
        assert_eq!(calc.unused_credit_cents, 0);
        assert_eq!(calc.net_charge_cents, 0);
    }

    #[test]
    fn after_cycle_end_clamps_to_zero() {
        let sub = subscription(35, -5);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();
        assert_eq!(calc.days_in_cycle, 30);
        assert_eq!(calc.days_remaining, 0);
    }

    #[test]
    fn partial_day_rounds_up() {
        let mut sub = subscription(20, 10);
        sub.billing_cycle_end -= Duration::hours(6);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();
        assert_eq!(calc.days_remaining, 10);
    }

    #[test]
    fn partial_cycle_day_rounds_up() {
        let mut sub = subscription(20, 10);
        sub.billing_cycle_end += Duration::seconds(1);
        let calc = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now()).unwrap();
        assert_eq!(calc.days_in_cycle, 31);
        assert_eq!(calc.days_remaining, 11);
    }

    #[test]
    fn empty_cycle_is_rejected() {
        let mut sub = subscription(0, 0);
        sub.billing_cycle_end = sub.billing_cycle_start;
        let result = compute_proration(&sub, &ChangeRequest::tier("pro_max"), now());
        assert!(matches!(result, Err(LedgerError::InvalidCycle(_))));
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let sub = subscription(20, 10);
        let result = compute_proration(&sub, &ChangeRequest::tier("enterprise"), now());
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn interval_change_at_same_price() {
        let sub = subscription(20, 10);
        let request = ChangeRequest::Tier {
            tier: Tier::new("pro_plus"),
            interval: Some(BillingInterval::Annual),
        };
        let calc = compute_proration(&sub, &request, now()).unwrap();
        assert_eq!(calc.change_type, ChangeType::CycleChange);
        assert_eq!(calc.to_interval, Some(BillingInterval::Annual));
        assert_eq!(calc.net_charge_cents, 0);
    }

    #[test]
    fn cancellation_credits_unused_time() {
        let sub = subscription(20, 10);
        let calc = compute_proration(&sub, &ChangeRequest::Cancel, now()).unwrap();

        assert_eq!(calc.change_type, ChangeType::Cancellation);
        assert_eq!(calc.to_tier, None);
        assert_eq!(calc.to_interval, None);
        assert_eq!(calc.net_charge_cents, -633);
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let sub = subscription(12, 18);
        let request = ChangeRequest::tier("pro_max");
        let first = compute_proration(&sub, &request, now()).unwrap();
        let second = compute_proration(&sub, &request, now()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
