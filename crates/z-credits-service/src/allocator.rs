//! Additive credit grants.
//!
//! Every grant inserts one allocation row and bumps the cached balance in the
//! same unit of work, after locking the user's balance row. Concurrent grants
//! for one user therefore serialize on that row and none is lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use z_credits_core::{
    AllocationSource, CreditAllocation, CreditBalance, LedgerError, Result, SubscriptionId, UserId,
};
use z_credits_store::{Store, StoreTx};

use crate::collaborators::SubscriptionDirectory;
use crate::retry::{with_retry, RetryPolicy};

/// Applies credit grants to the ledger.
pub struct Allocator {
    store: Arc<dyn Store>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    retry: RetryPolicy,
}

impl Allocator {
    /// Create an allocator.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            subscriptions,
            retry,
        }
    }

    /// Grant `amount` credits to a user.
    ///
    /// A `subscription` grant must reference an active subscription owned by
    /// the user. Adjustment rows are reserved for proration reversals.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Validation` if `amount <= 0` or the source is not grantable.
    /// - `LedgerError::NotFound` if the referenced subscription does not exist.
    /// - `LedgerError::Concurrency` if the balance row stayed contended.
    pub async fn allocate(
        &self,
        user_id: UserId,
        amount: i64,
        source: AllocationSource,
        subscription_id: Option<SubscriptionId>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditAllocation> {
        validate_amount(amount)?;

        let allocation = match source {
            AllocationSource::Subscription => {
                let subscription_id = subscription_id.ok_or_else(|| {
                    LedgerError::Validation("subscription grants require a subscription".into())
                })?;
                self.check_subscription(&user_id, &subscription_id).await?;
                CreditAllocation::subscription(user_id, subscription_id, amount, expires_at)
            }
            AllocationSource::Adjustment => {
                return Err(LedgerError::Validation(
                    "adjustments are only written by proration reversals".into(),
                ));
            }
            AllocationSource::Bonus | AllocationSource::Referral | AllocationSource::Migration => {
                let mut allocation = CreditAllocation::new(
                    user_id,
                    amount,
                    source,
                    format!("{} grant of {amount} credits", source.as_str()),
                );
                allocation.subscription_id = subscription_id;
                allocation.allocation_period_end = expires_at;
                allocation
            }
        };

        self.commit_grant(allocation).await
    }

    /// Grant bonus credits, optionally expiring.
    ///
    /// # Errors
    ///
    /// Same as [`Allocator::allocate`].
    pub async fn grant_bonus(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditAllocation> {
        validate_amount(amount)?;
        self.commit_grant(CreditAllocation::bonus(
            user_id,
            amount,
            reason.to_string(),
            expires_at,
        ))
        .await
    }

    /// Grant referral credits to the referred user.
    ///
    /// # Errors
    ///
    /// Same as [`Allocator::allocate`]; a self-referral is a validation error.
    pub async fn grant_referral(
        &self,
        user_id: UserId,
        amount: i64,
        referrer: UserId,
    ) -> Result<CreditAllocation> {
        validate_amount(amount)?;
        if referrer == user_id {
            return Err(LedgerError::Validation("users cannot refer themselves".into()));
        }
        self.commit_grant(CreditAllocation::referral(user_id, amount, referrer))
            .await
    }

    /// Current cached balance, zero if the user has no balance row yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn balance(&self, user_id: &UserId) -> Result<CreditBalance> {
        Ok(self
            .store
            .get_balance(user_id)?
            .unwrap_or_else(|| CreditBalance::new(*user_id)))
    }

    /// Every allocation for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn allocations(&self, user_id: &UserId) -> Result<Vec<CreditAllocation>> {
        Ok(self.store.list_allocations(user_id)?)
    }

    async fn check_subscription(
        &self,
        user_id: &UserId,
        subscription_id: &SubscriptionId,
    ) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await
            .map_err(|e| LedgerError::Upstream(e.to_string()))?
            .ok_or_else(|| LedgerError::not_found("subscription", subscription_id))?;

        if subscription.user_id != *user_id {
            return Err(LedgerError::Validation(format!(
                "subscription {subscription_id} does not belong to user {user_id}"
            )));
        }
        if !subscription.is_active() {
            return Err(LedgerError::Validation(format!(
                "subscription {subscription_id} is not active"
            )));
        }
        Ok(())
    }

    async fn commit_grant(&self, allocation: CreditAllocation) -> Result<CreditAllocation> {
        let balance = with_retry(&self.retry, "allocate", || {
            let mut tx = self.store.begin()?;
            let balance = apply_allocation(tx.as_mut(), &allocation)?;
            tx.commit()?;
            Ok(balance)
        })
        .await?;

        tracing::info!(
            user_id = %allocation.user_id,
            allocation_id = %allocation.id,
            source = allocation.source.as_str(),
            amount = allocation.amount,
            balance = balance.amount,
            "Credits allocated"
        );

        Ok(allocation)
    }
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::Validation(format!(
            "allocation amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

/// Lock the owner's balance, append `allocation` and apply it to the balance.
///
/// The balance row is created when absent. The caller commits.
pub(crate) fn apply_allocation(
    tx: &mut (dyn StoreTx + '_),
    allocation: &CreditAllocation,
) -> Result<CreditBalance> {
    let mut balance = tx
        .lock_balance(&allocation.user_id)?
        .unwrap_or_else(|| CreditBalance::new(allocation.user_id));

    tx.insert_allocation(allocation)?;
    balance.apply(allocation.amount, Utc::now())?;
    tx.put_balance(&balance)?;

    Ok(balance)
}
