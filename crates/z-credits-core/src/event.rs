//! Proration event records and their lifecycle.
//!
//! ```text
//! pending ──► applied ──► reversed
//!    │
//!    └──────► failed
//! ```
//!
//! `reversed` and `failed` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BillingInterval, ChangeRequest, ChangeType, LedgerError, ProrationCalculation,
    ProrationEventId, Result, SubscriptionId, Tier, UserId,
};

/// Lifecycle status of a proration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationStatus {
    /// Recorded, settlement not finished.
    Pending,
    /// Settled and the tier change took effect.
    Applied,
    /// Settlement or tier change failed; nothing took effect.
    Failed,
    /// Undone by an admin with a compensating ledger entry.
    Reversed,
}

impl ProrationStatus {
    /// Get the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Reversed => "reversed",
        }
    }
}

/// How the net charge of a proration was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// Net charge was zero; nothing to settle.
    None,
    /// Positive net charge captured through the payment gateway.
    Charge,
    /// Credit owed was issued through the payment gateway.
    PaymentCredit,
    /// Credit owed was granted as ledger credits (1 credit per cent).
    LedgerCredit,
}

/// A persisted, auditable record of one tier-change attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationEvent {
    /// Event ID.
    pub id: ProrationEventId,
    /// Owner of the subscription.
    pub user_id: UserId,
    /// Subscription that changed.
    pub subscription_id: SubscriptionId,
    /// Tier before the change.
    pub from_tier: Tier,
    /// Tier after the change, `None` for a cancellation.
    pub to_tier: Option<Tier>,
    /// Billing interval after the change, `None` for a cancellation.
    pub to_interval: Option<BillingInterval>,
    /// Derived change type.
    pub change_type: ChangeType,
    /// Whole days left in the cycle at the change.
    pub days_remaining: i64,
    /// Whole days in the cycle.
    pub days_in_cycle: i64,
    /// Unused value of the old tier, in cents.
    pub unused_credit_value_cents: i64,
    /// Prorated cost of the new tier, in cents.
    pub new_tier_prorated_cost_cents: i64,
    /// Signed net charge in cents (positive = charge, negative = credit).
    pub net_charge_cents: i64,
    /// When the change takes effect.
    pub effective_date: DateTime<Utc>,
    /// Lifecycle status.
    pub status: ProrationStatus,
    /// How the net charge is settled.
    pub settlement: SettlementKind,
    /// Invoice, payment intent or credit note ID from the payment gateway.
    pub external_invoice_id: Option<String>,
    /// Why settlement failed, for `failed` events.
    pub failure_reason: Option<String>,
    /// Why the event was reversed, for `reversed` events.
    pub reversal_reason: Option<String>,
    /// When the event was reversed.
    pub reversed_at: Option<DateTime<Utc>>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
    /// When the event last changed.
    pub updated_at: DateTime<Utc>,
}

impl ProrationEvent {
    /// Record a calculation as a new pending event.
    #[must_use]
    pub fn pending(calculation: &ProrationCalculation, settlement: SettlementKind) -> Self {
        let now = Utc::now();
        Self {
            id: ProrationEventId::generate(),
            user_id: calculation.user_id,
            subscription_id: calculation.subscription_id,
            from_tier: calculation.from_tier.clone(),
            to_tier: calculation.to_tier.clone(),
            to_interval: calculation.to_interval,
            change_type: calculation.change_type,
            days_remaining: calculation.days_remaining,
            days_in_cycle: calculation.days_in_cycle,
            unused_credit_value_cents: calculation.unused_credit_cents,
            new_tier_prorated_cost_cents: calculation.new_tier_prorated_cost_cents,
            net_charge_cents: calculation.net_charge_cents,
            effective_date: calculation.effective_date,
            status: ProrationStatus::Pending,
            settlement,
            external_invoice_id: None,
            failure_reason: None,
            reversal_reason: None,
            reversed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The change this event records, as it was requested.
    #[must_use]
    pub fn change_request(&self) -> ChangeRequest {
        match &self.to_tier {
            Some(tier) => ChangeRequest::Tier {
                tier: tier.clone(),
                interval: self.to_interval,
            },
            None => ChangeRequest::Cancel,
        }
    }

    /// Whether the stored amounts are self-consistent.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.net_charge_cents == self.new_tier_prorated_cost_cents - self.unused_credit_value_cents
            && self.days_remaining <= self.days_in_cycle
    }

    /// Transition `pending → applied`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Conflict` unless the event is pending.
    pub fn mark_applied(&mut self, invoice_id: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(ProrationStatus::Pending, "apply")?;
        self.status = ProrationStatus::Applied;
        if invoice_id.is_some() {
            self.external_invoice_id = invoice_id;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Transition `pending → failed`, keeping the attempted amounts.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Conflict` unless the event is pending.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        invoice_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_status(ProrationStatus::Pending, "fail")?;
        self.status = ProrationStatus::Failed;
        self.failure_reason = Some(reason.into());
        if invoice_id.is_some() {
            self.external_invoice_id = invoice_id;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Transition `applied → reversed`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Conflict` unless the event is applied.
    pub fn mark_reversed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(ProrationStatus::Applied, "reverse")?;
        self.status = ProrationStatus::Reversed;
        self.reversal_reason = Some(reason.into());
        self.reversed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Signed credits the reversal must write to undo this event's effect.
    ///
    /// A captured charge is returned to the user as credits; a credit the user
    /// received (in the ledger or through the gateway) is clawed back.
    #[must_use]
    pub const fn compensation_credits(&self) -> i64 {
        match self.settlement {
            SettlementKind::None => 0,
            SettlementKind::Charge => self.net_charge_cents,
            SettlementKind::PaymentCredit | SettlementKind::LedgerCredit => {
                -self.net_charge_cents.abs()
            }
        }
    }

    fn expect_status(&self, expected: ProrationStatus, action: &str) -> Result<()> {
        if self.status == expected {
            return Ok(());
        }
        Err(LedgerError::Conflict(format!(
            "cannot {action} proration event {} in status {}",
            self.id,
            self.status.as_str()
        )))
    }
}
