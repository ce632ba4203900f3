//! Drift correction for cached balances.
//!
//! The reconciler replays a user's full allocation and deduction history while
//! holding the balance row lock, then overwrites the cached amount with
//! `Σ allocations − Σ deductions`. Negative results are kept as-is.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use z_credits_core::{CreditBalance, Replay, Result, UserId};
use z_credits_store::{Store, StoreTx};

use crate::retry::{with_retry, RetryPolicy};

/// Users reconciled at once by [`Reconciler::reconcile_all`].
const RECONCILE_CONCURRENCY: usize = 8;

/// Result of reconciling one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The balance written.
    pub balance: CreditBalance,
    /// Cached amount before the write, `None` if the row did not exist.
    pub previous_amount: Option<i64>,
    /// Totals replayed from the fact logs.
    pub replay: Replay,
}

impl Reconciliation {
    /// Difference between the authoritative and the previously cached amount.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.balance.amount - self.previous_amount.unwrap_or(0)
    }
}

/// Outcome of a reconciliation sweep over every known user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Users reconciled successfully.
    pub users: usize,
    /// Users whose cached balance was wrong.
    pub corrected: usize,
    /// Sum of absolute drift across corrected users.
    pub total_drift: i64,
    /// Users whose authoritative balance is negative.
    pub overdrawn: Vec<UserId>,
    /// Users whose reconciliation failed; retried on the next sweep.
    pub failed: Vec<UserId>,
}

/// Recomputes balances from the fact logs.
pub struct Reconciler {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Recompute and store one user's balance.
    ///
    /// Safe to call concurrently with allocations for the same user and safe
    /// to repeat.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Concurrency` if the balance row stayed contended,
    /// or a storage error.
    pub async fn reconcile(&self, user_id: &UserId) -> Result<CreditBalance> {
        Ok(self.reconcile_user(*user_id).await?.balance)
    }

    /// Reconcile one user and report what changed.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::reconcile`].
    pub async fn reconcile_user(&self, user_id: UserId) -> Result<Reconciliation> {
        let outcome = with_retry(&self.retry, "reconcile", || {
            let mut tx = self.store.begin()?;

            // Holding this lock keeps new facts for the user out of our snapshot.
            let previous = tx.lock_balance(&user_id)?;
            let allocations = tx.scan_allocations(&user_id)?;
            let deductions = tx.scan_deductions(&user_id)?;
            let replay = Replay::of(&allocations, &deductions)?;

            let balance = CreditBalance {
                user_id,
                amount: replay.balance()?,
                last_updated: Utc::now(),
            };
            tx.put_balance(&balance)?;
            tx.commit()?;

            Ok(Reconciliation {
                balance,
                previous_amount: previous.map(|b| b.amount),
                replay,
            })
        })
        .await?;

        let drift = outcome.drift();
        if drift != 0 {
            tracing::info!(
                user_id = %user_id,
                previous = ?outcome.previous_amount,
                amount = outcome.balance.amount,
                drift,
                "Corrected balance drift"
            );
        } else {
            tracing::debug!(
                user_id = %user_id,
                amount = outcome.balance.amount,
                allocations = outcome.replay.allocation_count,
                deductions = outcome.replay.deduction_count,
                "Balance reconciled"
            );
        }

        if outcome.balance.is_overdrawn() {
            tracing::warn!(
                user_id = %user_id,
                amount = outcome.balance.amount,
                overdrawn = true,
                "Reconciled balance is negative"
            );
        }

        Ok(outcome)
    }

    /// Reconcile every user that has a balance row or any fact.
    ///
    /// Each user runs in its own unit of work; one failing user does not stop
    /// the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the user list cannot be read.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let users = self.store.list_user_ids()?;
        tracing::info!(users = users.len(), "Starting reconciliation sweep");

        let outcomes: Vec<_> = stream::iter(users)
            .map(|user_id| async move { (user_id, self.reconcile_user(user_id).await) })
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for (user_id, outcome) in outcomes {
            match outcome {
                Ok(reconciliation) => {
                    summary.users += 1;
                    let drift = reconciliation.drift();
                    if drift != 0 {
                        summary.corrected += 1;
                        summary.total_drift += drift.abs();
                    }
                    if reconciliation.balance.is_overdrawn() {
                        summary.overdrawn.push(user_id);
                    }
                }
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Failed to reconcile user");
                    summary.failed.push(user_id);
                }
            }
        }

        summary.overdrawn.sort();
        summary.failed.sort();

        tracing::info!(
            users = summary.users,
            corrected = summary.corrected,
            total_drift = summary.total_drift,
            overdrawn = summary.overdrawn.len(),
            failed = summary.failed.len(),
            "Reconciliation sweep finished"
        );

        Ok(summary)
    }
}
