//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//!
//! Read-modify-write operations take a striped lock on the key being updated,
//! then commit through a single `WriteBatch`, so a record and its index entry
//! are always written together.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use meterbill_core::{
    Bill, BillStatus, BillingCycle, CreditApplication, Discount, RevenueSnapshot, SchedulerState,
    TenantId, TierChangeEvent, UsageRecord,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf, meta};
use crate::Store;

const LOCK_STRIPES: usize = 64;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    locks: Vec<Mutex<()>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Lock the stripe guarding `key` in column family `cf_name`.
    fn lock(&self, cf_name: &str, key: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        cf_name.hash(&mut hasher);
        key.hash(&mut hasher);
        // Truncation is fine for picking a stripe.
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hasher.finish() as usize) % self.locks.len();
        self.locks[idx].lock()
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

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Decode every value whose key starts with `prefix`, in key order.
    fn scan_prefix<T: serde::de::DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Follow a tenant index to the primary records, oldest cycle first.
    fn scan_tenant_index<T: serde::de::DeserializeOwned>(
        &self,
        index_cf: &str,
        primary_cf: &str,
        tenant_id: &TenantId,
    ) -> Result<Vec<T>> {
        let cf_index = self.cf(index_cf)?;
        let prefix = keys::tenant_prefix(tenant_id);
        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&prefix, Direction::Forward));

        let mut cycles = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            match keys::extract_cycle_from_tenant_key(&key) {
                Some(cycle) => cycles.push(cycle),
                None => tracing::warn!(tenant_id = %tenant_id, "skipping malformed index key"),
            }
        }

        let mut values = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            if let Some(value) = self.get_value(primary_cf, &keys::cycle_tenant_key(cycle, tenant_id))? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Write a usage record with its tenant index entry.
    fn write_usage(&self, record: &UsageRecord) -> Result<()> {
        let cf_usage = self.cf(cf::USAGE)?;
        let cf_by_tenant = self.cf(cf::USAGE_BY_TENANT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_usage,
            keys::cycle_tenant_key(record.billing_cycle, &record.tenant_id),
            Self::serialize(record)?,
        );
        batch.put_cf(
            &cf_by_tenant,
            keys::tenant_cycle_key(&record.tenant_id, record.billing_cycle),
            [],
        );
        self.write(batch)
    }

    /// Add a bill and its index entry to a batch.
    fn batch_bill(&self, batch: &mut WriteBatch, bill: &Bill) -> Result<()> {
        let cf_bills = self.cf(cf::BILLS)?;
        let cf_by_tenant = self.cf(cf::BILLS_BY_TENANT)?;
        batch.put_cf(
            &cf_bills,
            keys::cycle_tenant_key(bill.billing_cycle, &bill.tenant_id),
            Self::serialize(bill)?,
        );
        batch.put_cf(
            &cf_by_tenant,
            keys::tenant_cycle_key(&bill.tenant_id, bill.billing_cycle),
            [],
        );
        Ok(())
    }

    /// Read-modify-write of a singleton document under its lock.
    fn update_meta<T, F>(&self, key: &[u8], init: F, update: &mut dyn FnMut(&mut T)) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> T,
    {
        let _guard = self.lock(cf::META, key);
        let mut value = self.get_value(cf::META, key)?.unwrap_or_else(init);
        update(&mut value);

        let cf_meta = self.cf(cf::META)?;
        self.db
            .put_cf(&cf_meta, key, Self::serialize(&value)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(value)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Usage Records
    // =========================================================================

    fn get_usage(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<UsageRecord>> {
        self.get_value(cf::USAGE, &keys::cycle_tenant_key(cycle, tenant_id))
    }

    fn upsert_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut UsageRecord),
    ) -> Result<UsageRecord> {
        let key = keys::cycle_tenant_key(cycle, tenant_id);
        let _guard = self.lock(cf::USAGE, &key);

        let mut record = self
            .get_value(cf::USAGE, &key)?
            .unwrap_or_else(|| UsageRecord::empty(tenant_id.clone(), cycle, now));
        update(&mut record);
        self.write_usage(&record)?;
        Ok(record)
    }

    fn put_usage(&self, record: &UsageRecord) -> Result<()> {
        let key = keys::cycle_tenant_key(record.billing_cycle, &record.tenant_id);
        let _guard = self.lock(cf::USAGE, &key);
        self.write_usage(record)
    }

    fn list_usage_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<UsageRecord>> {
        self.scan_prefix(cf::USAGE, &keys::cycle_prefix(cycle))
    }

    fn list_usage_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<UsageRecord>> {
        self.scan_tenant_index(cf::USAGE_BY_TENANT, cf::USAGE, tenant_id)
    }

    fn archive_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = keys::cycle_tenant_key(cycle, tenant_id);
        let _guard = self.lock(cf::USAGE, &key);

        let Some(mut record) = self.get_value::<UsageRecord>(cf::USAGE, &key)? else {
            return Ok(false);
        };
        record.archived_at.get_or_insert(at);
        self.write_usage(&record)?;
        Ok(true)
    }

    // =========================================================================
    // Bills
    // =========================================================================

    fn put_bill(&self, bill: &Bill) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.batch_bill(&mut batch, bill)?;
        self.write(batch)
    }

    fn create_bill(&self, bill: &Bill, applied: &CreditApplication) -> Result<()> {
        let credit_key = keys::credit_key(&bill.tenant_id);
        let _guard = self.lock(cf::CREDITS, &credit_key);

        let mut batch = WriteBatch::default();
        self.batch_bill(&mut batch, bill)?;

        if applied.consumed > 0 || applied.carry_over.is_some() {
            let cf_credits = self.cf(cf::CREDITS)?;
            let mut credits: Vec<Discount> =
                self.get_value(cf::CREDITS, &credit_key)?.unwrap_or_default();
            let n = applied.consumed.min(credits.len());
            credits.drain(..n);
            if let Some(rest) = &applied.carry_over {
                credits.insert(0, rest.clone());
            }
            if credits.is_empty() {
                batch.delete_cf(&cf_credits, &credit_key);
            } else {
                batch.put_cf(&cf_credits, &credit_key, Self::serialize(&credits)?);
            }
        }

        self.write(batch)
    }

    fn get_bill(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<Bill>> {
        self.get_value(cf::BILLS, &keys::cycle_tenant_key(cycle, tenant_id))
    }

    fn list_bills_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<Bill>> {
        self.scan_prefix(cf::BILLS, &keys::cycle_prefix(cycle))
    }

    fn list_bills_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Bill>> {
        self.scan_tenant_index(cf::BILLS_BY_TENANT, cf::BILLS, tenant_id)
    }

    fn list_bills_with_status(&self, status: BillStatus) -> Result<Vec<Bill>> {
        let bills: Vec<Bill> = self.scan_prefix(cf::BILLS, &[])?;
        Ok(bills.into_iter().filter(|b| b.status == status).collect())
    }

    // =========================================================================
    // Tier Changes & Credits
    // =========================================================================

    fn append_tier_change(&self, event: &TierChangeEvent) -> Result<()> {
        let cf = self.cf(cf::TIER_CHANGES)?;
        let key = keys::tier_change_key(&event.tenant_id, &event.id);
        self.db
            .put_cf(&cf, key, Self::serialize(event)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_tier_changes(&self, tenant_id: &TenantId) -> Result<Vec<TierChangeEvent>> {
        self.scan_prefix(cf::TIER_CHANGES, &keys::tenant_prefix(tenant_id))
    }

    fn push_credit(&self, tenant_id: &TenantId, credit: &Discount) -> Result<()> {
        let key = keys::credit_key(tenant_id);
        let _guard = self.lock(cf::CREDITS, &key);

        let mut credits: Vec<Discount> = self.get_value(cf::CREDITS, &key)?.unwrap_or_default();
        credits.push(credit.clone());

        let cf = self.cf(cf::CREDITS)?;
        self.db
            .put_cf(&cf, key, Self::serialize(&credits)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn pending_credits(&self, tenant_id: &TenantId) -> Result<Vec<Discount>> {
        Ok(self
            .get_value(cf::CREDITS, &keys::credit_key(tenant_id))?
            .unwrap_or_default())
    }

    // =========================================================================
    // Singletons
    // =========================================================================

    fn get_revenue(&self) -> Result<Option<RevenueSnapshot>> {
        self.get_value(cf::META, meta::REVENUE)
    }

    fn update_revenue(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut RevenueSnapshot),
    ) -> Result<RevenueSnapshot> {
        self.update_meta(meta::REVENUE, || RevenueSnapshot::empty(now), update)
    }

    fn get_scheduler_state(&self) -> Result<Option<SchedulerState>> {
        self.get_value(cf::META, meta::SCHEDULER)
    }

    fn update_scheduler_state(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut SchedulerState),
    ) -> Result<SchedulerState> {
        self.update_meta(meta::SCHEDULER, || SchedulerState::new(now), update)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn flush(&self) -> Result<()> {
        for name in all_column_families() {
            let cf = self.cf(name)?;
            self.db
                .flush_cf(&cf)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn usage_upsert_and_listing() {
        let (store, _dir) = create_test_store();
        conformance::usage_upsert_and_listing(&store);
    }

    #[test]
    fn concurrent_upserts_lose_nothing() {
        let (store, _dir) = create_test_store();
        conformance::concurrent_upserts_lose_nothing(Arc::new(store));
    }

    #[test]
    fn bills_and_credits() {
        let (store, _dir) = create_test_store();
        conformance::bills_and_credits(&store);
    }

    #[test]
    fn split_credit_stays_first_in_line() {
        let (store, _dir) = create_test_store();
        conformance::split_credit_stays_first_in_line(&store);
    }

    #[test]
    fn tier_changes_in_order() {
        let (store, _dir) = create_test_store();
        conformance::tier_changes_in_order(&store);
    }

    #[test]
    fn singletons() {
        let (store, _dir) = create_test_store();
        conformance::singletons(&store);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let cycle = BillingCycle::from_datetime(now);
        let tenant = TenantId::new("durable").unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .upsert_usage(&tenant, cycle, now, &mut |r| r.weighted_calls = 42)
                .unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        let record = store.get_usage(&tenant, cycle).unwrap().unwrap();
        assert_eq!(record.weighted_calls, 42);
    }
}
