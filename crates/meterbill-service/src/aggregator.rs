//! Usage aggregation and threshold monitoring.
//!
//! The hot path: classify the call, then fold it into the tenant's record for
//! the current cycle and evaluate thresholds, all inside one atomic store
//! upsert. No external I/O happens here; alerts are returned to the caller
//! for asynchronous delivery.

use std::sync::Arc;

use dashmap::DashMap;

use meterbill_core::{
    check_thresholds, AlertEvent, BillingCycle, CallEvent, EndpointClassifier, TenantId, Tier,
    TierCatalog, UsageRecord,
};
use meterbill_store::{Store, StoreError};

use crate::collab::Clock;

/// Tenant to tier name, kept in sync with the subscription directory.
pub type TierCache = Arc<DashMap<TenantId, String>>;

/// Outcome of recording a call.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// The record after the call was applied.
    pub record: UsageRecord,
    /// Alerts that fired because of this call.
    pub alerts: Vec<AlertEvent>,
}

/// Folds call events into per-cycle usage records.
pub struct UsageAggregator {
    store: Arc<dyn Store>,
    classifier: Arc<EndpointClassifier>,
    catalog: Arc<TierCatalog>,
    tiers: TierCache,
    clock: Arc<dyn Clock>,
}

impl UsageAggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Arc<EndpointClassifier>,
        catalog: Arc<TierCatalog>,
        tiers: TierCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            classifier,
            catalog,
            tiers,
            clock,
        }
    }

    /// The tier currently applied to a tenant. Unknown tenants get the
    /// catalog's default tier.
    #[must_use]
    pub fn tier_for(&self, tenant_id: &TenantId) -> Tier {
        let name = self.tiers.get(tenant_id).map(|t| t.value().clone());
        self.catalog.resolve(name.as_deref()).clone()
    }

    /// Record one call for the current cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn record_call(&self, event: &CallEvent) -> Result<Recorded, StoreError> {
        let now = self.clock.now();
        let cycle = BillingCycle::from_datetime(now);
        let classification = self.classifier.classify(&event.path);
        let tier = self.tier_for(&event.tenant_id);

        let mut alerts = Vec::new();
        let record = self
            .store
            .upsert_usage(&event.tenant_id, cycle, now, &mut |record| {
                record.apply_call(event, &classification, now);
                alerts = check_thresholds(record, &tier, now);
            })?;

        if !alerts.is_empty() {
            tracing::debug!(
                tenant_id = %event.tenant_id,
                cycle = %cycle,
                weighted_calls = record.weighted_calls,
                alerts = alerts.len(),
                "Usage thresholds crossed"
            );
        }

        Ok(Recorded { record, alerts })
    }
}
