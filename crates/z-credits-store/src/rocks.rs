//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait on
//! top of a pessimistic `TransactionDB`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, MultiThreaded, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};

use z_credits_core::{
    CreditAllocation, CreditBalance, CreditDeduction, ProrationEvent, ProrationEventId,
    SubscriptionId, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{Store, StoreTx};

/// Key/value pair as returned by `RocksDB` iterators.
type RawEntry = (Box<[u8]>, Box<[u8]>);

/// Tuning for the transactional store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a unit of work waits for a row lock before giving up.
    pub lock_timeout_ms: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1000,
        }
    }
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<TransactionDB<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P, options: &StoreOptions) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(options.lock_timeout_ms);
        txn_opts.set_default_lock_timeout(options.lock_timeout_ms);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = TransactionDB::open_cf_descriptors(&opts, &txn_opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            lock_timeout_ms = options.lock_timeout_ms,
            "Opened transactional ledger store"
        );

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Collect entries whose key starts with `prefix`, stopping at the first miss.
    fn collect_prefixed<I>(iter: I, prefix: &[u8]) -> Result<Vec<RawEntry>>
    where
        I: Iterator<Item = std::result::Result<RawEntry, rocksdb::Error>>,
    {
        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Decode the values of a set of entries.
    fn decode_values<T: serde::de::DeserializeOwned>(entries: &[RawEntry]) -> Result<Vec<T>> {
        entries
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    /// Scan a user-prefixed fact table from committed state.
    fn scan_committed<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        prefix: &[u8],
    ) -> Result<Vec<T>> {
        let cf = self.cf(table)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let entries = Self::collect_prefixed(iter, prefix)?;
        Self::decode_values(&entries)
    }

    /// Resolve an event index into events from committed state.
    fn events_by_index(&self, index: &str, prefix: &[u8]) -> Result<Vec<ProrationEvent>> {
        let cf_index = self.cf(index)?;
        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(prefix, Direction::Forward));
        let entries = Self::collect_prefixed(iter, prefix)?;

        let mut events = Vec::with_capacity(entries.len());
        for (key, _) in &entries {
            let event_id = keys::extract_event_id(key)
                .ok_or_else(|| StoreError::Database("malformed proration index key".into()))?;
            if let Some(event) = self.get_proration_event(&event_id)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl Store for RocksStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>> {
        Ok(Box::new(RocksTx {
            store: self,
            txn: self.db.transaction(),
        }))
    }

    fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        let cf = self.cf(cf::BALANCES)?;

        self.db
            .get_cf(&cf, keys::balance_key(user_id))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_allocations(&self, user_id: &UserId) -> Result<Vec<CreditAllocation>> {
        self.scan_committed(cf::ALLOCATIONS, &keys::user_prefix(user_id))
    }

    fn list_deductions(&self, user_id: &UserId) -> Result<Vec<CreditDeduction>> {
        self.scan_committed(cf::DEDUCTIONS, &keys::user_prefix(user_id))
    }

    fn get_proration_event(&self, event_id: &ProrationEventId) -> Result<Option<ProrationEvent>> {
        let cf = self.cf(cf::PRORATION_EVENTS)?;

        self.db
            .get_cf(&cf, keys::proration_event_key(event_id))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_proration_events_by_user(&self, user_id: &UserId) -> Result<Vec<ProrationEvent>> {
        self.events_by_index(cf::PRORATION_EVENTS_BY_USER, &keys::user_prefix(user_id))
    }

    fn list_proration_events_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<ProrationEvent>> {
        self.events_by_index(
            cf::PRORATION_EVENTS_BY_SUBSCRIPTION,
            &keys::subscription_prefix(subscription_id),
        )
    }

    fn list_user_ids(&self) -> Result<Vec<UserId>> {
        let mut users = BTreeSet::new();

        for table in [cf::BALANCES, cf::ALLOCATIONS, cf::DEDUCTIONS] {
            let cf = self.cf(table)?;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item?;
                if let Some(user_id) = keys::extract_user_id(&key) {
                    users.insert(user_id);
                }
            }
        }

        Ok(users.into_iter().collect())
    }
}

/// A unit of work on a `RocksStore`.
///
/// Dropping it without calling `commit` discards every write.
pub struct RocksTx<'a> {
    store: &'a RocksStore,
    txn: Transaction<'a, TransactionDB<MultiThreaded>>,
}

impl RocksTx<'_> {
    /// Scan a user-prefixed fact table through the transaction.
    fn scan<T: serde::de::DeserializeOwned>(&self, table: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.store.cf(table)?;
        let iter = self
            .txn
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let entries = RocksStore::collect_prefixed(iter, prefix)?;
        RocksStore::decode_values(&entries)
    }

    /// Append a record to an immutable table, refusing to overwrite.
    fn append(&self, table: &str, entity: &'static str, id: String, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.store.cf(table)?;
        if self.txn.get_cf(&cf, key)?.is_some() {
            return Err(StoreError::Duplicate { entity, id });
        }
        self.txn.put_cf(&cf, key, value)?;
        Ok(())
    }
}

impl StoreTx for RocksTx<'_> {
    // =========================================================================
    // Balances
    // =========================================================================

    fn lock_balance(&mut self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        let cf = self.store.cf(cf::BALANCES)?;

        self.txn
            .get_for_update_cf(&cf, keys::balance_key(user_id), true)?
            .map(|data| RocksStore::deserialize(&data))
            .transpose()
    }

    fn put_balance(&mut self, balance: &CreditBalance) -> Result<()> {
        let cf = self.store.cf(cf::BALANCES)?;
        let value = RocksStore::serialize(balance)?;

        self.txn
            .put_cf(&cf, keys::balance_key(&balance.user_id), value)?;
        Ok(())
    }

    // =========================================================================
    // Fact Logs
    // =========================================================================

    fn insert_allocation(&mut self, allocation: &CreditAllocation) -> Result<()> {
        let key = keys::allocation_key(&allocation.user_id, &allocation.id);
        let value = RocksStore::serialize(allocation)?;
        self.append(
            cf::ALLOCATIONS,
            "allocation",
            allocation.id.to_string(),
            &key,
            &value,
        )
    }

    fn insert_deduction(&mut self, deduction: &CreditDeduction) -> Result<()> {
        let key = keys::deduction_key(&deduction.user_id, &deduction.id);
        let value = RocksStore::serialize(deduction)?;
        self.append(
            cf::DEDUCTIONS,
            "deduction",
            deduction.id.to_string(),
            &key,
            &value,
        )
    }

    fn scan_allocations(&mut self, user_id: &UserId) -> Result<Vec<CreditAllocation>> {
        self.scan(cf::ALLOCATIONS, &keys::user_prefix(user_id))
    }

    fn scan_deductions(&mut self, user_id: &UserId) -> Result<Vec<CreditDeduction>> {
        self.scan(cf::DEDUCTIONS, &keys::user_prefix(user_id))
    }

    // =========================================================================
    // Proration Events
    // =========================================================================

    fn lock_proration_event(
        &mut self,
        event_id: &ProrationEventId,
    ) -> Result<Option<ProrationEvent>> {
        let cf = self.store.cf(cf::PRORATION_EVENTS)?;

        self.txn
            .get_for_update_cf(&cf, keys::proration_event_key(event_id), true)?
            .map(|data| RocksStore::deserialize(&data))
            .transpose()
    }

    fn put_proration_event(&mut self, event: &ProrationEvent) -> Result<()> {
        let cf_events = self.store.cf(cf::PRORATION_EVENTS)?;
        let cf_by_user = self.store.cf(cf::PRORATION_EVENTS_BY_USER)?;
        let cf_by_sub = self.store.cf(cf::PRORATION_EVENTS_BY_SUBSCRIPTION)?;

        let value = RocksStore::serialize(event)?;
        self.txn
            .put_cf(&cf_events, keys::proration_event_key(&event.id), value)?;
        self.txn.put_cf(
            &cf_by_user,
            keys::user_event_key(&event.user_id, &event.id),
            b"",
        )?;
        self.txn.put_cf(
            &cf_by_sub,
            keys::subscription_event_key(&event.subscription_id, &event.id),
            b"",
        )?;
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.txn.rollback()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use z_credits_core::{
        BillingInterval, ChangeType, ProrationCalculation, ProrationStatus, SettlementKind, Tier,
    };

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions {
            lock_timeout_ms: 50,
        };
        let store = RocksStore::open(dir.path(), &options).unwrap();
        (store, dir)
    }

    fn event_for(user_id: UserId, subscription_id: SubscriptionId) -> ProrationEvent {
        let calculation = ProrationCalculation {
            subscription_id,
            user_id,
            from_tier: Tier::new("pro"),
            to_tier: Some(Tier::new("pro_max")),
            to_interval: Some(BillingInterval::Monthly),
            change_type: ChangeType::Upgrade,
            days_remaining: 10,
            days_in_cycle: 30,
            current_price_cents: 1900,
            new_price_cents: 4500,
            unused_credit_cents: 633,
            new_tier_prorated_cost_cents: 1500,
            net_charge_cents: 867,
            effective_date: chrono::Utc::now(),
        };
        ProrationEvent::pending(&calculation, SettlementKind::Charge)
    }

    #[test]
    fn allocation_and_balance_commit_together() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let mut tx = store.begin().unwrap();
        let mut balance = tx
            .lock_balance(&user_id)
            .unwrap()
            .unwrap_or_else(|| CreditBalance::new(user_id));
        let grant = CreditAllocation::bonus(user_id, 5000, "welcome".into(), None);
        tx.insert_allocation(&grant).unwrap();
        balance.apply(grant.amount, chrono::Utc::now()).unwrap();
        tx.put_balance(&balance).unwrap();

        // Not visible before commit
        assert!(store.get_balance(&user_id).unwrap().is_none());
        tx.commit().unwrap();

        assert_eq!(store.get_balance(&user_id).unwrap().unwrap().amount, 5000);
        assert_eq!(store.list_allocations(&user_id).unwrap(), vec![grant]);
    }

    #[test]
    fn rollback_discards_writes() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let mut tx = store.begin().unwrap();
        tx.lock_balance(&user_id).unwrap();
        tx.insert_allocation(&CreditAllocation::bonus(user_id, 10, "x".into(), None))
            .unwrap();
        tx.rollback().unwrap();

        assert!(store.list_allocations(&user_id).unwrap().is_empty());
    }

    #[test]
    fn dropped_unit_of_work_is_discarded() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        {
            let mut tx = store.begin().unwrap();
            tx.lock_balance(&user_id).unwrap();
            tx.put_balance(&CreditBalance::new(user_id)).unwrap();
        }

        assert!(store.get_balance(&user_id).unwrap().is_none());
    }

    #[test]
    fn competing_lock_times_out_as_conflict() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let mut holder = store.begin().unwrap();
        holder.lock_balance(&user_id).unwrap();

        let mut contender = store.begin().unwrap();
        let result = contender.lock_balance(&user_id);
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        drop(contender);
        holder.commit().unwrap();

        // Lock is released after commit
        let mut next = store.begin().unwrap();
        assert!(next.lock_balance(&user_id).is_ok());
    }

    #[test]
    fn different_users_do_not_contend() {
        let (store, _dir) = create_test_store();

        let mut first = store.begin().unwrap();
        first.lock_balance(&UserId::generate()).unwrap();

        let mut second = store.begin().unwrap();
        assert!(second.lock_balance(&UserId::generate()).is_ok());
    }

    #[test]
    fn allocations_are_append_only() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let grant = CreditAllocation::bonus(user_id, 10, "x".into(), None);

        let mut tx = store.begin().unwrap();
        tx.insert_allocation(&grant).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let result = tx.insert_allocation(&grant);
        assert!(matches!(result, Err(StoreError::Duplicate { .. })));
    }

    #[test]
    fn facts_scan_in_creation_order_and_per_user() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let other = UserId::generate();

        let mut tx = store.begin().unwrap();
        let first = CreditDeduction::new(user_id, 100, "inference");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = CreditDeduction::new(user_id, 200, "inference");
        tx.insert_deduction(&second).unwrap();
        tx.insert_deduction(&first).unwrap();
        tx.insert_deduction(&CreditDeduction::new(other, 999, "inference"))
            .unwrap();

        // Own writes are visible inside the unit of work
        assert_eq!(tx.scan_deductions(&user_id).unwrap().len(), 2);
        tx.commit().unwrap();

        let deductions = store.list_deductions(&user_id).unwrap();
        assert_eq!(deductions, vec![first, second]);
    }

    #[test]
    fn proration_event_indexes() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let sub_id = SubscriptionId::generate();
        let mut event = event_for(user_id, sub_id);

        let mut tx = store.begin().unwrap();
        tx.put_proration_event(&event).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let mut locked = tx.lock_proration_event(&event.id).unwrap().unwrap();
        locked.mark_applied(Some("pi_1".into()), chrono::Utc::now()).unwrap();
        tx.put_proration_event(&locked).unwrap();
        tx.commit().unwrap();
        event = locked;

        let by_user = store.list_proration_events_by_user(&user_id).unwrap();
        let by_sub = store.list_proration_events_by_subscription(&sub_id).unwrap();
        assert_eq!(by_user, vec![event.clone()]);
        assert_eq!(by_sub, vec![event.clone()]);
        assert_eq!(
            store.get_proration_event(&event.id).unwrap().unwrap().status,
            ProrationStatus::Applied
        );
    }

    #[test]
    fn user_ids_cover_every_table() {
        let (store, _dir) = create_test_store();
        let with_balance = UserId::generate();
        let with_deduction = UserId::generate();

        let mut tx = store.begin().unwrap();
        tx.put_balance(&CreditBalance::new(with_balance)).unwrap();
        tx.insert_deduction(&CreditDeduction::new(with_deduction, 5, "inference"))
            .unwrap();
        tx.commit().unwrap();

        let users = store.list_user_ids().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&with_balance));
        assert!(users.contains(&with_deduction));
    }
}
