//! Interfaces to the systems the ledger depends on but does not own.
//!
//! Subscription management and payment capture live outside the ledger. They
//! are injected as trait objects so tests can substitute in-memory fakes.

use async_trait::async_trait;

use z_credits_core::{BillingInterval, ProrationEventId, Subscription, SubscriptionId, Tier, UserId};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The collaborator could not be reached or did not answer.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered and refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Read and advance subscriptions owned by subscription management.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// Load a subscription snapshot, `None` if it does not exist.
    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>, GatewayError>;

    /// Move a subscription to a new tier and billing interval.
    async fn advance_tier(
        &self,
        subscription_id: &SubscriptionId,
        tier: &Tier,
        interval: BillingInterval,
    ) -> Result<(), GatewayError>;

    /// Cancel a subscription immediately.
    async fn cancel(&self, subscription_id: &SubscriptionId) -> Result<(), GatewayError>;
}

/// A money movement requested from the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    /// Proration event being settled; doubles as the idempotency key.
    pub event_id: ProrationEventId,
    /// User being charged or credited.
    pub user_id: UserId,
    /// Amount in cents, always positive.
    pub amount_cents: i64,
    /// Statement description.
    pub description: String,
}

/// Proof of a settled money movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Invoice, payment intent or credit note ID.
    pub invoice_id: String,
}

/// Capture charges and issue credits.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture a charge from the user.
    async fn settle_charge(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError>;

    /// Issue a credit to the user.
    async fn issue_credit(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError>;
}
