//! Transactional ledger storage for z-credits.
//!
//! This crate is the single source of truth for allocation rows, deduction
//! rows, cached balances and proration events. All mutation happens inside an
//! explicit unit of work obtained from [`Store::begin`]; nothing is visible to
//! other readers until [`StoreTx::commit`] succeeds, and dropping a unit of
//! work without committing rolls it back.
//!
//! # Architecture
//!
//! The `RocksDB` backend uses a pessimistic `TransactionDB` with the following
//! column families:
//!
//! - `balances`: cached balance rows, keyed by `user_id`
//! - `allocations`: append-only grants, keyed by `user_id || allocation_id`
//! - `deductions`: append-only consumption facts, keyed by `user_id || deduction_id`
//! - `proration_events`: proration events, keyed by `event_id`
//! - `proration_events_by_user` / `proration_events_by_subscription`: indexes
//!
//! # Locking
//!
//! Row locks are taken with [`StoreTx::lock_balance`] and
//! [`StoreTx::lock_proration_event`]. Writers of allocations and deductions
//! lock the owner's balance row first, so a reader holding that lock sees a
//! phantom-free snapshot of the user's facts. Lock waits that exceed the
//! configured timeout fail with [`StoreError::Conflict`].
//!
//! # Example
//!
//! ```no_run
//! use z_credits_store::{RocksStore, Store, StoreOptions};
//! use z_credits_core::{CreditAllocation, CreditBalance, UserId};
//!
//! let store = RocksStore::open("/tmp/z-credits-db", &StoreOptions::default()).unwrap();
//! let user_id = UserId::generate();
//!
//! let mut tx = store.begin().unwrap();
//! let mut balance = tx.lock_balance(&user_id).unwrap().unwrap_or_else(|| CreditBalance::new(user_id));
//! let grant = CreditAllocation::bonus(user_id, 500, "welcome".into(), None);
//! tx.insert_allocation(&grant).unwrap();
//! balance.apply(grant.amount, chrono::Utc::now()).unwrap();
//! tx.put_balance(&balance).unwrap();
//! tx.commit().unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use rocks::{RocksStore, StoreOptions};

use z_credits_core::{
    CreditAllocation, CreditBalance, CreditDeduction, ProrationEvent, ProrationEventId,
    SubscriptionId, UserId,
};

/// The storage trait: a unit-of-work factory plus non-locking reads.
///
/// This trait abstracts the storage layer so the engine can be wired to any
/// backend that offers row-level locking and atomic commit.
pub trait Store: Send + Sync {
    /// Begin a unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>>;

    // =========================================================================
    // Read Accessors (latest committed state, no locks)
    // =========================================================================

    /// Get the cached balance for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>>;

    /// List a user's allocations in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_allocations(&self, user_id: &UserId) -> Result<Vec<CreditAllocation>>;

    /// List a user's deductions in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_deductions(&self, user_id: &UserId) -> Result<Vec<CreditDeduction>>;

    /// Get a proration event by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_proration_event(&self, event_id: &ProrationEventId) -> Result<Option<ProrationEvent>>;

    /// List proration events for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_proration_events_by_user(&self, user_id: &UserId) -> Result<Vec<ProrationEvent>>;

    /// List proration events for a subscription, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_proration_events_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<ProrationEvent>>;

    /// Every user with a balance row, an allocation or a deduction.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_user_ids(&self) -> Result<Vec<UserId>>;
}

/// An open unit of work.
///
/// Reads inside a unit of work see committed data plus the unit's own writes.
pub trait StoreTx {
    // =========================================================================
    // Balances
    // =========================================================================

    /// Lock a user's balance row for update and return its current value.
    ///
    /// The lock is taken even when the row does not exist yet, so concurrent
    /// creators serialize too.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the lock cannot be acquired in time.
    fn lock_balance(&mut self, user_id: &UserId) -> Result<Option<CreditBalance>>;

    /// Insert or overwrite a balance row. The row must be locked.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_balance(&mut self, balance: &CreditBalance) -> Result<()>;

    // =========================================================================
    // Fact Logs
    // =========================================================================

    /// Append an allocation. Lock the owner's balance row first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the allocation ID already exists.
    fn insert_allocation(&mut self, allocation: &CreditAllocation) -> Result<()>;

    /// Append a deduction. Lock the owner's balance row first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the deduction ID already exists.
    fn insert_deduction(&mut self, deduction: &CreditDeduction) -> Result<()>;

    /// Read all allocations for a user as seen by this unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan_allocations(&mut self, user_id: &UserId) -> Result<Vec<CreditAllocation>>;

    /// Read all deductions for a user as seen by this unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan_deductions(&mut self, user_id: &UserId) -> Result<Vec<CreditDeduction>>;

    // =========================================================================
    // Proration Events
    // =========================================================================

    /// Lock a proration event for update and return it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the lock cannot be acquired in time.
    fn lock_proration_event(&mut self, event_id: &ProrationEventId)
        -> Result<Option<ProrationEvent>>;

    /// Insert or update a proration event and its indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_proration_event(&mut self, event: &ProrationEvent) -> Result<()>;

    // =========================================================================
    // Completion
    // =========================================================================

    /// Make every write of this unit of work visible atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the commit lost a conflict; nothing
    /// was written in that case.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write of this unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to release the transaction.
    fn rollback(self: Box<Self>) -> Result<()>;
}
