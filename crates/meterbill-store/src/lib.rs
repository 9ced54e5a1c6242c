//! Storage layer for meterbill.
//!
//! This crate provides persistent storage for usage records, bills, the tier
//! change audit trail, pending proration credits, the revenue snapshot and
//! the billing scheduler state.
//!
//! Two backends implement [`Store`]:
//!
//! - [`MemoryStore`]: sharded in-memory maps (`dashmap`), for tests and
//!   single-process deployments that accept losing state on restart.
//! - `RocksStore` (feature `rocksdb-backend`): `RocksDB` with column families
//!   for efficient indexing.
//!
//! # Atomicity
//!
//! Every `upsert_*`/`update_*` method is a linearizable read-modify-write on
//! one key. Concurrent callers never lose each other's updates. The closure
//! runs while the key is locked, so it must be short and must not perform I/O.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use meterbill_core::{BillingCycle, TenantId};
//! use meterbill_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let tenant = TenantId::new("acme").unwrap();
//! let now = Utc::now();
//! let cycle = BillingCycle::from_datetime(now);
//!
//! let record = store
//!     .upsert_usage(&tenant, cycle, now, &mut |r| r.total_calls += 1)
//!     .unwrap();
//! assert_eq!(record.total_calls, 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

#[cfg(test)]
mod conformance;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use meterbill_core::{
    Bill, BillStatus, BillingCycle, CreditApplication, Discount, RevenueSnapshot, SchedulerState,
    TenantId, TierChangeEvent, UsageRecord,
};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Usage Records
    // =========================================================================

    /// Get the usage record for a tenant and cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_usage(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<UsageRecord>>;

    /// Atomically apply `update` to the record for `(tenant_id, cycle)`,
    /// creating an empty record stamped `now` first if none exists.
    ///
    /// Returns the record after the update.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn upsert_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut UsageRecord),
    ) -> Result<UsageRecord>;

    /// Insert or replace a usage record (used by imports).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_usage(&self, record: &UsageRecord) -> Result<()>;

    /// List all usage records of a cycle, ordered by tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_usage_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<UsageRecord>>;

    /// List a tenant's usage records, oldest cycle first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_usage_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<UsageRecord>>;

    /// Mark a record archived. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn archive_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    // =========================================================================
    // Bills
    // =========================================================================

    /// Insert or update a bill.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_bill(&self, bill: &Bill) -> Result<()>;

    /// Persist a newly computed bill and settle its tenant's pending credits
    /// in one atomic step: the first `credits.consumed` are dropped and the
    /// carried-over remainder, if any, goes back to the front of the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn create_bill(&self, bill: &Bill, credits: &CreditApplication) -> Result<()>;

    /// Get the bill for a tenant and cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_bill(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<Bill>>;

    /// List the bills of a cycle, ordered by tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_bills_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<Bill>>;

    /// List a tenant's bills, oldest cycle first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_bills_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Bill>>;

    /// List every bill with the given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_bills_with_status(&self, status: BillStatus) -> Result<Vec<Bill>>;

    // =========================================================================
    // Tier Changes & Credits
    // =========================================================================

    /// Append a tier change to the audit trail.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_tier_change(&self, event: &TierChangeEvent) -> Result<()>;

    /// List a tenant's tier changes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_tier_changes(&self, tenant_id: &TenantId) -> Result<Vec<TierChangeEvent>>;

    /// Queue a credit for the tenant's next bill.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn push_credit(&self, tenant_id: &TenantId, credit: &Discount) -> Result<()>;

    /// Credits waiting for the tenant's next bill, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn pending_credits(&self, tenant_id: &TenantId) -> Result<Vec<Discount>>;

    // =========================================================================
    // Singletons
    // =========================================================================

    /// Get the revenue snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_revenue(&self) -> Result<Option<RevenueSnapshot>>;

    /// Atomically update the revenue snapshot, starting from an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn update_revenue(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut RevenueSnapshot),
    ) -> Result<RevenueSnapshot>;

    /// Get the scheduler state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_scheduler_state(&self) -> Result<Option<SchedulerState>>;

    /// Atomically update the scheduler state, initializing it for `now` if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn update_scheduler_state(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut SchedulerState),
    ) -> Result<SchedulerState>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flush buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn flush(&self) -> Result<()>;
}
