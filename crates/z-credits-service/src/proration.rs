//! Proration event recording, settlement and reversal.
//!
//! Applying a change runs in three steps:
//!
//! 1. The calculation is persisted as a `pending` event.
//! 2. The net charge is settled and the subscription is advanced, each call
//!    bounded by the settlement timeout. Any failure or timeout marks the
//!    event `failed` and leaves the tier untouched.
//! 3. One unit of work marks the event `applied` and, for ledger credits,
//!    writes the credit grant and the balance update. If that write fails
//!    the caller gets a settlement error and the event stays `pending`
//!    until [`ProrationRecorder::resume_proration`] finishes it.
//!
//! No row lock is held while an external call is in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use z_credits_core::{
    compute_proration, format_usd, ChangeRequest, CreditAllocation, LedgerError,
    ProrationCalculation, ProrationEvent, ProrationEventId, ProrationStatus, Result,
    SettlementKind, Subscription,
    SubscriptionId, SubscriptionStatus, Tier, UserId,
};
use z_credits_store::{Store, StoreTx};

use crate::allocator::apply_allocation;
use crate::collaborators::{GatewayError, PaymentGateway, SettlementRequest, SubscriptionDirectory};
use crate::config::DowngradeCreditMode;
use crate::retry::{with_retry, RetryPolicy};

/// Records tier changes as auditable, reversible proration events.
pub struct ProrationRecorder {
    store: Arc<dyn Store>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    payments: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
    settlement_timeout: Duration,
    downgrade_credit_mode: DowngradeCreditMode,
}

impl ProrationRecorder {
    /// Create a recorder.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        payments: Arc<dyn PaymentGateway>,
        retry: RetryPolicy,
        settlement_timeout: Duration,
        downgrade_credit_mode: DowngradeCreditMode,
    ) -> Self {
        Self {
            store,
            subscriptions,
            payments,
            retry,
            settlement_timeout,
            downgrade_credit_mode,
        }
    }

    /// Prorate a change against the current subscription without side effects.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the subscription does not exist.
    /// - `LedgerError::InvalidCycle` / `LedgerError::Validation` from the calculator.
    pub async fn preview(
        &self,
        subscription_id: &SubscriptionId,
        change: &ChangeRequest,
    ) -> Result<ProrationCalculation> {
        let subscription = self.load_subscription(subscription_id).await?;
        compute_proration(&subscription, change, Utc::now())
    }

    /// Move a subscription to `new_tier`, keeping its billing interval.
    ///
    /// # Errors
    ///
    /// See [`ProrationRecorder::apply_change`].
    pub async fn apply_tier_change(
        &self,
        subscription_id: &SubscriptionId,
        new_tier: Tier,
    ) -> Result<ProrationEvent> {
        self.apply_change(
            subscription_id,
            ChangeRequest::Tier {
                tier: new_tier,
                interval: None,
            },
        )
        .await
    }

    /// Cancel a subscription and pay back its unused portion.
    ///
    /// # Errors
    ///
    /// See [`ProrationRecorder::apply_change`].
    pub async fn apply_cancellation(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<ProrationEvent> {
        self.apply_change(subscription_id, ChangeRequest::Cancel)
            .await
    }

    /// Prorate, settle and apply a subscription change.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the subscription does not exist.
    /// - `LedgerError::Validation` for a no-op change or an inactive subscription.
    /// - `LedgerError::Settlement` if payment or the tier change failed or
    ///   timed out, in which case the event is persisted as `failed`. Also
    ///   returned when the change took effect but the final write did not;
    ///   the event is then left `pending` for `resume_proration`.
    /// - `LedgerError::Concurrency` if recording the pending event stayed
    ///   contended; nothing was settled.
    pub async fn apply_change(
        &self,
        subscription_id: &SubscriptionId,
        change: ChangeRequest,
    ) -> Result<ProrationEvent> {
        let subscription = self.load_subscription(subscription_id).await?;
        validate_change(&subscription, &change)?;

        let calculation = compute_proration(&subscription, &change, Utc::now())?;
        let event = ProrationEvent::pending(&calculation, self.settlement_kind(&calculation));

        with_retry(&self.retry, "record_proration", || {
            let mut tx = self.store.begin()?;
            tx.put_proration_event(&event)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::info!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            change_type = event.change_type.as_str(),
            net_charge = %format_usd(event.net_charge_cents),
            "Proration recorded"
        );

        self.drive(event, &subscription).await
    }

    /// Finish a proration event left `pending` by an interrupted apply.
    ///
    /// Settlement is sent again under the same idempotency key (the event id),
    /// so the gateway never moves money twice. The subscription change is
    /// skipped when the directory already shows it. Only call this once the
    /// apply that created the event has returned.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the event does not exist.
    /// - `LedgerError::Conflict` unless the event is `pending`.
    /// - `LedgerError::Settlement` if settlement, the change or the final
    ///   write failed again.
    pub async fn resume_proration(&self, event_id: &ProrationEventId) -> Result<ProrationEvent> {
        let event = self.event(event_id)?;
        if event.status != ProrationStatus::Pending {
            return Err(LedgerError::Conflict(format!(
                "cannot resume proration event {event_id} in status {}",
                event.status.as_str()
            )));
        }

        let subscription = self.load_subscription(&event.subscription_id).await?;
        tracing::info!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            "Resuming pending proration"
        );

        self.drive(event, &subscription).await
    }

    /// Undo an applied proration with a compensating ledger entry.
    ///
    /// The compensation, the balance update and the status flip commit
    /// together; a rejected reversal writes nothing.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the event does not exist.
    /// - `LedgerError::Conflict` unless the event is `applied`.
    pub async fn reverse_proration(
        &self,
        event_id: &ProrationEventId,
        reason: &str,
    ) -> Result<ProrationEvent> {
        let (event, compensation) = with_retry(&self.retry, "reverse_proration", || {
            let mut tx = self.store.begin()?;

            let mut event = tx
                .lock_proration_event(event_id)?
                .ok_or_else(|| LedgerError::not_found("proration event", event_id))?;
            event.mark_reversed(reason, Utc::now())?;

            let compensation = event.compensation_credits();
            if compensation != 0 {
                let adjustment = CreditAllocation::adjustment(
                    event.user_id,
                    event.subscription_id,
                    compensation,
                    event.id,
                    reason.to_string(),
                );
                apply_allocation(tx.as_mut(), &adjustment)?;
            }

            tx.put_proration_event(&event)?;
            tx.commit()?;
            Ok((event, compensation))
        })
        .await?;

        tracing::info!(
            event_id = %event.id,
            user_id = %event.user_id,
            compensation,
            reason,
            "Proration reversed"
        );

        Ok(event)
    }

    /// A single proration event.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotFound` if the event does not exist.
    pub fn event(&self, event_id: &ProrationEventId) -> Result<ProrationEvent> {
        self.store
            .get_proration_event(event_id)?
            .ok_or_else(|| LedgerError::not_found("proration event", event_id))
    }

    /// Proration events for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn history_for_user(&self, user_id: &UserId) -> Result<Vec<ProrationEvent>> {
        Ok(self.store.list_proration_events_by_user(user_id)?)
    }

    /// Proration events for a subscription, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn history_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<ProrationEvent>> {
        Ok(self
            .store
            .list_proration_events_by_subscription(subscription_id)?)
    }

    /// Settle, advance and record a persisted `pending` event.
    ///
    /// Once the subscription has changed, every failure is a settlement
    /// failure: the tier moved and money may have too.
    async fn drive(
        &self,
        event: ProrationEvent,
        subscription: &Subscription,
    ) -> Result<ProrationEvent> {
        let change = event.change_request();

        let invoice_id = match self.settle(&event).await {
            Ok(invoice_id) => invoice_id,
            Err(reason) => return Err(self.record_failure(event, reason, None).await),
        };

        if !already_applied(subscription, &change) {
            if let Err(reason) = self.advance(subscription, &change).await {
                let reason = match &invoice_id {
                    Some(invoice) => {
                        format!("{reason} (settled as {invoice}, needs manual refund)")
                    }
                    None => reason,
                };
                return Err(self.record_failure(event, reason, invoice_id).await);
            }
        }

        self.record_applied(&event, invoice_id)
            .await
            .map_err(|e| LedgerError::Settlement {
                event_id: event.id.to_string(),
                message: format!(
                    "change took effect but was not recorded, event left pending: {e}"
                ),
            })
    }

    async fn load_subscription(&self, subscription_id: &SubscriptionId) -> Result<Subscription> {
        self.subscriptions
            .get_subscription(subscription_id)
            .await
            .map_err(|e| LedgerError::Upstream(e.to_string()))?
            .ok_or_else(|| LedgerError::not_found("subscription", subscription_id))
    }

    fn settlement_kind(&self, calculation: &ProrationCalculation) -> SettlementKind {
        match calculation.net_charge_cents.signum() {
            1 => SettlementKind::Charge,
            -1 => match self.downgrade_credit_mode {
                DowngradeCreditMode::Ledger => SettlementKind::LedgerCredit,
                DowngradeCreditMode::Payment => SettlementKind::PaymentCredit,
            },
            _ => SettlementKind::None,
        }
    }

    /// Move money through the payment gateway, if the settlement needs it.
    async fn settle(&self, event: &ProrationEvent) -> std::result::Result<Option<String>, String> {
        let request = SettlementRequest {
            event_id: event.id,
            user_id: event.user_id,
            amount_cents: event.net_charge_cents.abs(),
            description: format!(
                "Proration for {} from {} to {}",
                event.change_type.as_str(),
                event.from_tier,
                event.to_tier.as_ref().map_or("cancelled", Tier::as_str),
            ),
        };

        let call = match event.settlement {
            SettlementKind::None | SettlementKind::LedgerCredit => return Ok(None),
            SettlementKind::Charge => self.payments.settle_charge(&request),
            SettlementKind::PaymentCredit => self.payments.issue_credit(&request),
        };

        let receipt = self.bounded("settlement", call).await?;
        tracing::info!(
            event_id = %event.id,
            invoice_id = %receipt.invoice_id,
            amount = %format_usd(request.amount_cents),
            "Proration settled"
        );
        Ok(Some(receipt.invoice_id))
    }

    /// Apply the change in subscription management.
    async fn advance(
        &self,
        subscription: &Subscription,
        change: &ChangeRequest,
    ) -> std::result::Result<(), String> {
        match change {
            ChangeRequest::Tier { tier, interval } => {
                let interval = interval.unwrap_or(subscription.interval);
                let call = self
                    .subscriptions
                    .advance_tier(&subscription.id, tier, interval);
                self.bounded("tier change", call).await
            }
            ChangeRequest::Cancel => {
                let call = self.subscriptions.cancel(&subscription.id);
                self.bounded("cancellation", call).await
            }
        }
    }

    /// Await an external call under the settlement timeout.
    ///
    /// A timeout is a failure, never an ambiguous success.
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl std::future::Future<Output = std::result::Result<T, GatewayError>>,
    ) -> std::result::Result<T, String> {
        match tokio::time::timeout(self.settlement_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{what} failed: {e}")),
            Err(_) => Err(format!(
                "{what} timed out after {}ms",
                self.settlement_timeout.as_millis()
            )),
        }
    }

    /// Persist `failed` and build the error returned to the caller.
    async fn record_failure(
        &self,
        event: ProrationEvent,
        reason: String,
        invoice_id: Option<String>,
    ) -> LedgerError {
        tracing::warn!(event_id = %event.id, reason = %reason, "Proration failed");

        let persisted = with_retry(&self.retry, "record_proration_failure", || {
            let mut tx = self.store.begin()?;
            let mut current = tx
                .lock_proration_event(&event.id)?
                .ok_or_else(|| LedgerError::not_found("proration event", event.id))?;
            current.mark_failed(reason.clone(), invoice_id.clone(), Utc::now())?;
            tx.put_proration_event(&current)?;
            tx.commit()?;
            Ok(())
        })
        .await;

        let message = match persisted {
            Ok(()) => reason,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Could not mark proration failed; event left pending"
                );
                format!("{reason} (event left pending: {e})")
            }
        };

        LedgerError::Settlement {
            event_id: event.id.to_string(),
            message,
        }
    }

    /// Mark the event applied and write any ledger credit with it.
    async fn record_applied(
        &self,
        event: &ProrationEvent,
        invoice_id: Option<String>,
    ) -> Result<ProrationEvent> {
        let result = with_retry(&self.retry, "apply_proration", || {
            let mut tx = self.store.begin()?;
            let mut current = tx
                .lock_proration_event(&event.id)?
                .ok_or_else(|| LedgerError::not_found("proration event", event.id))?;
            current.mark_applied(invoice_id.clone(), Utc::now())?;

            if current.settlement == SettlementKind::LedgerCredit {
                let credit = CreditAllocation::subscription(
                    current.user_id,
                    current.subscription_id,
                    current.net_charge_cents.abs(),
                    None,
                )
                .with_metadata(serde_json::json!({
                    "proration_event_id": current.id.to_string(),
                    "change_type": current.change_type.as_str(),
                }));
                apply_allocation(tx.as_mut(), &credit)?;
            }

            tx.put_proration_event(&current)?;
            tx.commit()?;
            Ok(current)
        })
        .await;

        match &result {
            Ok(applied) => tracing::info!(
                event_id = %applied.id,
                settlement = ?applied.settlement,
                invoice_id = ?applied.external_invoice_id,
                "Proration applied"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                error = %e,
                "Subscription changed but proration could not be marked applied"
            ),
        }

        result
    }
}

/// Whether the directory already shows the requested change.
fn already_applied(subscription: &Subscription, change: &ChangeRequest) -> bool {
    match change {
        ChangeRequest::Tier { tier, interval } => {
            subscription.tier == *tier && interval.map_or(true, |i| i == subscription.interval)
        }
        ChangeRequest::Cancel => subscription.status == SubscriptionStatus::Cancelled,
    }
}

/// Reject changes that cannot be applied to this subscription.
fn validate_change(subscription: &Subscription, change: &ChangeRequest) -> Result<()> {
    if subscription.status == SubscriptionStatus::Cancelled {
        return Err(LedgerError::Validation(format!(
            "subscription {} is cancelled",
            subscription.id
        )));
    }

    if let ChangeRequest::Tier { tier, interval } = change {
        let same_interval = interval.map_or(true, |i| i == subscription.interval);
        if *tier == subscription.tier && same_interval {
            return Err(LedgerError::Validation(format!(
                "subscription {} is already on tier {tier}",
                subscription.id
            )));
        }
    }

    Ok(())
}
