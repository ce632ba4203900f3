//! Z-Credits ledger and proration engine.
//!
//! This crate wires the credit ledger together:
//!
//! - **Allocator**: additive grants (subscription, bonus, referral, migration)
//! - **Reconciler**: replays the fact logs to correct cached balances
//! - **Proration recorder**: prorates, settles, applies and reverses tier changes
//!
//! Collaborators are injected explicitly through [`CreditLedger::new`]; there
//! is no global registry. Subscription management and payment capture are
//! reached through the traits in [`collaborators`], with [`StripeGateway`] as
//! the production payment implementation.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(RocksStore::open(&config.data_dir, &config.store_options())?);
//! let ledger = CreditLedger::new(store, subscriptions, payments, &config);
//!
//! ledger.grant_bonus(user_id, 1000, "welcome", None).await?;
//! let event = ledger.apply_tier_change(&subscription_id, Tier::new("pro_max")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod allocator;
pub mod collaborators;
pub mod config;
pub mod proration;
pub mod reconciler;
pub mod retry;
pub mod stripe;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use z_credits_core::{
    AllocationSource, ChangeRequest, CreditAllocation, CreditBalance, ProrationCalculation,
    ProrationEvent, ProrationEventId, Result, Subscription, SubscriptionId, Tier, UserId,
};
use z_credits_store::Store;

pub use allocator::Allocator;
pub use collaborators::{
    GatewayError, PaymentGateway, Receipt, SettlementRequest, SubscriptionDirectory,
};
pub use config::{DowngradeCreditMode, LedgerConfig};
pub use proration::ProrationRecorder;
pub use reconciler::{ReconcileSummary, Reconciler, Reconciliation};
pub use retry::{with_retry, RetryPolicy};
pub use stripe::{StripeError, StripeGateway};

/// The ledger surface exposed to controllers and admin tooling.
pub struct CreditLedger {
    allocator: Allocator,
    reconciler: Reconciler,
    proration: ProrationRecorder,
}

impl CreditLedger {
    /// Wire a ledger from its store and collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        payments: Arc<dyn PaymentGateway>,
        config: &LedgerConfig,
    ) -> Self {
        let retry = config.retry_policy();

        Self {
            allocator: Allocator::new(Arc::clone(&store), Arc::clone(&subscriptions), retry),
            reconciler: Reconciler::new(Arc::clone(&store), retry),
            proration: ProrationRecorder::new(
                store,
                subscriptions,
                payments,
                retry,
                config.settlement_timeout(),
                config.downgrade_credit_mode,
            ),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// See [`Allocator::allocate`].
    ///
    /// # Errors
    ///
    /// Validation, not-found and concurrency errors.
    pub async fn allocate(
        &self,
        user_id: UserId,
        amount: i64,
        source: AllocationSource,
        subscription_id: Option<SubscriptionId>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditAllocation> {
        self.allocator
            .allocate(user_id, amount, source, subscription_id, expires_at)
            .await
    }

    /// See [`Allocator::grant_bonus`].
    ///
    /// # Errors
    ///
    /// Validation and concurrency errors.
    pub async fn grant_bonus(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditAllocation> {
        self.allocator
            .grant_bonus(user_id, amount, reason, expires_at)
            .await
    }

    /// See [`Allocator::grant_referral`].
    ///
    /// # Errors
    ///
    /// Validation and concurrency errors.
    pub async fn grant_referral(
        &self,
        user_id: UserId,
        amount: i64,
        referrer: UserId,
    ) -> Result<CreditAllocation> {
        self.allocator.grant_referral(user_id, amount, referrer).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// See [`Reconciler::reconcile`].
    ///
    /// # Errors
    ///
    /// Concurrency and storage errors.
    pub async fn reconcile(&self, user_id: &UserId) -> Result<CreditBalance> {
        self.reconciler.reconcile(user_id).await
    }

    /// See [`Reconciler::reconcile_all`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the user list cannot be read.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        self.reconciler.reconcile_all().await
    }

    // =========================================================================
    // Proration
    // =========================================================================

    /// Prorate a change against a subscription snapshot. Pure, no I/O.
    ///
    /// # Errors
    ///
    /// Invalid cycle or unknown tier price.
    pub fn compute_proration(
        subscription: &Subscription,
        change: &ChangeRequest,
        now: DateTime<Utc>,
    ) -> Result<ProrationCalculation> {
        z_credits_core::compute_proration(subscription, change, now)
    }

    /// See [`ProrationRecorder::preview`].
    ///
    /// # Errors
    ///
    /// Not-found and calculator errors.
    pub async fn preview(
        &self,
        subscription_id: &SubscriptionId,
        change: &ChangeRequest,
    ) -> Result<ProrationCalculation> {
        self.proration.preview(subscription_id, change).await
    }

    /// See [`ProrationRecorder::apply_tier_change`].
    ///
    /// # Errors
    ///
    /// See [`ProrationRecorder::apply_change`].
    pub async fn apply_tier_change(
        &self,
        subscription_id: &SubscriptionId,
        new_tier: Tier,
    ) -> Result<ProrationEvent> {
        self.proration
            .apply_tier_change(subscription_id, new_tier)
            .await
    }

    /// See [`ProrationRecorder::apply_change`].
    ///
    /// # Errors
    ///
    /// See [`ProrationRecorder::apply_change`].
    pub async fn apply_change(
        &self,
        subscription_id: &SubscriptionId,
        change: ChangeRequest,
    ) -> Result<ProrationEvent> {
        self.proration.apply_change(subscription_id, change).await
    }

    /// See [`ProrationRecorder::apply_cancellation`].
    ///
    /// # Errors
    ///
    /// See [`ProrationRecorder::apply_change`].
    pub async fn apply_cancellation(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<ProrationEvent> {
        self.proration.apply_cancellation(subscription_id).await
    }

    /// See [`ProrationRecorder::reverse_proration`].
    ///
    /// # Errors
    ///
    /// Not-found and conflict errors.
    pub async fn reverse_proration(
        &self,
        event_id: &ProrationEventId,
        reason: &str,
    ) -> Result<ProrationEvent> {
        self.proration.reverse_proration(event_id, reason).await
    }

    /// Finish a proration event left `pending`.
    ///
    /// See [`ProrationRecorder::resume_proration`].
    ///
    /// # Errors
    ///
    /// Not-found, conflict and settlement errors.
    pub async fn resume_proration(&self, event_id: &ProrationEventId) -> Result<ProrationEvent> {
        self.proration.resume_proration(event_id).await
    }

    // =========================================================================
    // Read Accessors
    // =========================================================================

    /// Current cached balance for a user.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn balance(&self, user_id: &UserId) -> Result<CreditBalance> {
        self.allocator.balance(user_id)
    }

    /// Every allocation for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn allocations(&self, user_id: &UserId) -> Result<Vec<CreditAllocation>> {
        self.allocator.allocations(user_id)
    }

    /// A single proration event.
    ///
    /// # Errors
    ///
    /// Not-found and storage errors.
    pub fn proration_event(&self, event_id: &ProrationEventId) -> Result<ProrationEvent> {
        self.proration.event(event_id)
    }

    /// Proration history for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn proration_history_for_user(&self, user_id: &UserId) -> Result<Vec<ProrationEvent>> {
        self.proration.history_for_user(user_id)
    }

    /// Proration history for a subscription, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn proration_history_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<ProrationEvent>> {
        self.proration.history_for_subscription(subscription_id)
    }
}
