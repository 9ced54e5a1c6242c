//! Revenue analytics.

use std::sync::Arc;

use meterbill_core::{Bill, BillingCycle, RevenueSnapshot, Segmentation, TierCatalog};
use meterbill_store::{Store, StoreError};

use crate::collab::{Clock, DirectoryError, SubscriptionDirectory};

/// Errors from building a segmentation report.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Directory error.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Derives revenue metrics from paid bills.
pub struct RevenueAnalytics {
    store: Arc<dyn Store>,
    directory: Arc<dyn SubscriptionDirectory>,
    catalog: Arc<TierCatalog>,
    clock: Arc<dyn Clock>,
}

impl RevenueAnalytics {
    /// Create the analytics component.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn SubscriptionDirectory>,
        catalog: Arc<TierCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            catalog,
            clock,
        }
    }

    /// Fold a paid bill into the revenue snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn on_bill_paid(&self, bill: &Bill) -> Result<RevenueSnapshot, StoreError> {
        let now = self.clock.now();
        let snapshot = self
            .store
            .update_revenue(now, &mut |snapshot| snapshot.apply_paid_bill(bill, now))?;

        tracing::debug!(
            tenant_id = %bill.tenant_id,
            cycle = %bill.billing_cycle,
            mrr = %snapshot.mrr,
            overage_to_date = %snapshot.overage_revenue_to_date,
            "Revenue updated"
        );
        Ok(snapshot)
    }

    /// Current revenue snapshot (empty before the first paid bill).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn snapshot(&self) -> Result<RevenueSnapshot, StoreError> {
        Ok(self
            .store
            .get_revenue()?
            .unwrap_or_else(|| RevenueSnapshot::empty(self.clock.now())))
    }

    /// Segment active tenants by tier, current-cycle usage and latest bill.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the store fails.
    pub async fn segmentation(&self) -> Result<Segmentation, AnalyticsError> {
        let cycle = BillingCycle::from_datetime(self.clock.now());
        let tenants = self.directory.active_tenants().await?;

        let mut report = Segmentation::default();
        for subscription in tenants {
            let tier = self.catalog.resolve(Some(&subscription.tier));
            let weighted = self
                .store
                .get_usage(&subscription.tenant_id, cycle)?
                .map_or(0, |r| r.weighted_calls);
            let latest_total = self
                .store
                .list_bills_by_tenant(&subscription.tenant_id)?
                .last()
                .map(|b| b.total);
            report.add_tenant(tier, weighted, latest_total);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryDirectory, ManualClock, Subscription};
    use chrono::{TimeZone, Utc};
    use meterbill_core::{calculate_bill, RevenueBucket, TenantId, UsageBucket, UsageRecord};
    use meterbill_store::MemoryStore;
    use rust_decimal_macros::dec;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn setup() -> (RevenueAnalytics, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = InMemoryDirectory::with_subscriptions([
            Subscription::new(tenant("a"), "pro"),
            Subscription::new(tenant("b"), "pro"),
            Subscription::new(tenant("c"), "free"),
        ]);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap());
        let analytics = RevenueAnalytics::new(
            store.clone(),
            Arc::new(directory),
            Arc::new(TierCatalog::default()),
            Arc::new(clock),
        );
        (analytics, store)
    }

    fn bill(id: &str, cycle: BillingCycle, weighted: u64) -> Bill {
        let catalog = TierCatalog::default();
        let mut record = UsageRecord::empty(tenant(id), cycle, cycle.start());
        record.weighted_calls = weighted;
        calculate_bill(&record, catalog.get("pro").unwrap(), &[], cycle.end(), "USD")
    }

    #[test]
    fn paid_bills_accumulate_mrr_and_overage() {
        let (analytics, _) = setup();
        let april = BillingCycle::new(2024, 4).unwrap();
        analytics.on_bill_paid(&bill("a", april, 10_500)).unwrap();
        let snapshot = analytics.on_bill_paid(&bill("b", april, 0)).unwrap();

        assert_eq!(snapshot.mrr, dec!(598));
        assert_eq!(snapshot.arr, dec!(7176));
        assert_eq!(snapshot.overage_revenue_to_date, dec!(25.00));
        assert_eq!(analytics.snapshot().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn segmentation_buckets_active_tenants() {
        let (analytics, store) = setup();
        let may = BillingCycle::new(2024, 5).unwrap();
        let mut usage = UsageRecord::empty(tenant("a"), may, may.start());
        usage.weighted_calls = 9_000;
        store.put_usage(&usage).unwrap();
        store
            .put_bill(&bill("a", BillingCycle::new(2024, 4).unwrap(), 10_500))
            .unwrap();

        let report = analytics.segmentation().await.unwrap();
        assert_eq!(report.tenant_count(), 3);
        assert_eq!(report.by_tier["pro"].tenants, 2);
        assert_eq!(report.by_tier["pro"].weighted_calls, 9_000);
        assert_eq!(report.by_usage_bucket[&UsageBucket::Heavy], 1);
        assert_eq!(report.by_usage_bucket[&UsageBucket::Light], 2);
        assert_eq!(report.by_revenue_bucket[&RevenueBucket::From100To500], 1);
        assert_eq!(report.by_revenue_bucket.values().sum::<u64>(), 1);
    }
}
