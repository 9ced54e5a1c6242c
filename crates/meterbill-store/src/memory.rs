//! In-memory storage implementation.
//!
//! Per-key atomicity comes from `DashMap`'s entry API: the shard holding a key
//! stays write-locked while an upsert closure runs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use meterbill_core::{
    Bill, BillStatus, BillingCycle, CreditApplication, Discount, RevenueSnapshot, SchedulerState,
    TenantId, TierChangeEvent, UsageRecord,
};

use crate::error::Result;
use crate::Store;

type CycleKey = (BillingCycle, TenantId);

/// Sharded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    usage: DashMap<CycleKey, UsageRecord>,
    bills: DashMap<CycleKey, Bill>,
    tier_changes: DashMap<TenantId, Vec<TierChangeEvent>>,
    credits: DashMap<TenantId, Vec<Discount>>,
    revenue: Mutex<Option<RevenueSnapshot>>,
    scheduler: Mutex<Option<SchedulerState>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted<T: Clone>(map: &DashMap<CycleKey, T>, keep: impl Fn(&CycleKey) -> bool) -> Vec<T> {
        let mut items: Vec<(CycleKey, T)> = map
            .iter()
            .filter(|entry| keep(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.into_iter().map(|(_, v)| v).collect()
    }
}

impl Store for MemoryStore {
    // =========================================================================
    // Usage Records
    // =========================================================================

    fn get_usage(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<UsageRecord>> {
        Ok(self
            .usage
            .get(&(cycle, tenant_id.clone()))
            .map(|r| r.value().clone()))
    }

    fn upsert_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut UsageRecord),
    ) -> Result<UsageRecord> {
        let mut entry = self
            .usage
            .entry((cycle, tenant_id.clone()))
            .or_insert_with(|| UsageRecord::empty(tenant_id.clone(), cycle, now));
        update(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn put_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage.insert(
            (record.billing_cycle, record.tenant_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn list_usage_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<UsageRecord>> {
        Ok(Self::sorted(&self.usage, |(c, _)| *c == cycle))
    }

    fn list_usage_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<UsageRecord>> {
        Ok(Self::sorted(&self.usage, |(_, t)| t == tenant_id))
    }

    fn archive_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .usage
            .get_mut(&(cycle, tenant_id.clone()))
            .map(|mut record| {
                record.archived_at.get_or_insert(at);
            })
            .is_some())
    }

    // =========================================================================
    // Bills
    // =========================================================================

    fn put_bill(&self, bill: &Bill) -> Result<()> {
        self.bills
            .insert((bill.billing_cycle, bill.tenant_id.clone()), bill.clone());
        Ok(())
    }

    fn create_bill(&self, bill: &Bill, credits: &CreditApplication) -> Result<()> {
        // Hold the credits shard until the bill is in.
        let mut pending = self.credits.entry(bill.tenant_id.clone()).or_default();
        let n = credits.consumed.min(pending.len());
        pending.drain(..n);
        if let Some(rest) = &credits.carry_over {
            pending.insert(0, rest.clone());
        }
        self.put_bill(bill)
    }

    fn get_bill(&self, tenant_id: &TenantId, cycle: BillingCycle) -> Result<Option<Bill>> {
        Ok(self
            .bills
            .get(&(cycle, tenant_id.clone()))
            .map(|b| b.value().clone()))
    }

    fn list_bills_by_cycle(&self, cycle: BillingCycle) -> Result<Vec<Bill>> {
        Ok(Self::sorted(&self.bills, |(c, _)| *c == cycle))
    }

    fn list_bills_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Bill>> {
        Ok(Self::sorted(&self.bills, |(_, t)| t == tenant_id))
    }

    fn list_bills_with_status(&self, status: BillStatus) -> Result<Vec<Bill>> {
        let mut bills = Self::sorted(&self.bills, |_| true);
        bills.retain(|b| b.status == status);
        Ok(bills)
    }

    // =========================================================================
    // Tier Changes & Credits
    // =========================================================================

    fn append_tier_change(&self, event: &TierChangeEvent) -> Result<()> {
        self.tier_changes
            .entry(event.tenant_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn list_tier_changes(&self, tenant_id: &TenantId) -> Result<Vec<TierChangeEvent>> {
        Ok(self
            .tier_changes
            .get(tenant_id)
            .map(|events| events.value().clone())
            .unwrap_or_default())
    }

    fn push_credit(&self, tenant_id: &TenantId, credit: &Discount) -> Result<()> {
        self.credits
            .entry(tenant_id.clone())
            .or_default()
            .push(credit.clone());
        Ok(())
    }

    fn pending_credits(&self, tenant_id: &TenantId) -> Result<Vec<Discount>> {
        Ok(self
            .credits
            .get(tenant_id)
            .map(|credits| credits.value().clone())
            .unwrap_or_default())
    }

    // =========================================================================
    // Singletons
    // =========================================================================

    fn get_revenue(&self) -> Result<Option<RevenueSnapshot>> {
        Ok(self.revenue.lock().clone())
    }

    fn update_revenue(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut RevenueSnapshot),
    ) -> Result<RevenueSnapshot> {
        let mut guard = self.revenue.lock();
        let snapshot = guard.get_or_insert_with(|| RevenueSnapshot::empty(now));
        update(snapshot);
        Ok(snapshot.clone())
    }

    fn get_scheduler_state(&self) -> Result<Option<SchedulerState>> {
        Ok(self.scheduler.lock().clone())
    }

    fn update_scheduler_state(
        &self,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut SchedulerState),
    ) -> Result<SchedulerState> {
        let mut guard = self.scheduler.lock();
        let state = guard.get_or_insert_with(|| SchedulerState::new(now));
        update(state);
        Ok(state.clone())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
