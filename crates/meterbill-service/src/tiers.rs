//! Subscription tier changes with proration.

use std::sync::Arc;

use dashmap::DashMap;
use meterbill_core::{BillingError, Discount, TenantId, TierCatalog, TierChangeEvent};
use meterbill_store::Store;

use crate::aggregator::TierCache;
use crate::collab::{Clock, SubscriptionDirectory};
use crate::error::EngineError;
use crate::payments::PaymentProcessor;

/// Applies tier changes, charging or crediting the prorated difference.
///
/// Changes for one tenant are serialized so each event's `from_tier` is the
/// tier the previous change left behind.
pub struct TierManager {
    store: Arc<dyn Store>,
    directory: Arc<dyn SubscriptionDirectory>,
    catalog: Arc<TierCatalog>,
    tiers: TierCache,
    payments: Arc<PaymentProcessor>,
    clock: Arc<dyn Clock>,
    locks: DashMap<TenantId, Arc<tokio::sync::Mutex<()>>>,
}

impl TierManager {
    /// Create a tier manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn SubscriptionDirectory>,
        catalog: Arc<TierCatalog>,
        tiers: TierCache,
        payments: Arc<PaymentProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            catalog,
            tiers,
            payments,
            clock,
            locks: DashMap::new(),
        }
    }

    /// Move a tenant to another tier.
    ///
    /// An upgrade is charged immediately; a failed charge is recorded on the
    /// returned event rather than failing the change. A downgrade queues a
    /// credit for the tenant's next bill.
    ///
    /// # Errors
    ///
    /// Returns `TierNotFound` for an unknown tier, `TenantNotFound` for an
    /// unknown tenant and `InvalidTierChange` when the tier does not change.
    #[tracing::instrument(skip(self, tenant_id), fields(tenant_id = %tenant_id))]
    pub async fn change_tier(
        &self,
        tenant_id: &TenantId,
        new_tier: &str,
    ) -> Result<TierChangeEvent, EngineError> {
        let to = self.catalog.get(new_tier)?;

        let lock = self.locks.entry(tenant_id.clone()).or_default().clone();
        let _guard = lock.lock().await;

        let subscription = self
            .directory
            .get(tenant_id)
            .await?
            .ok_or_else(|| EngineError::TenantNotFound(tenant_id.clone()))?;
        let from = self.catalog.resolve(Some(&subscription.tier));

        if from.name == to.name {
            return Err(BillingError::InvalidTierChange {
                from: from.name.clone(),
                to: to.name.clone(),
            }
            .into());
        }

        let mut event = TierChangeEvent::new(tenant_id.clone(), from, to, self.clock.now());

        self.directory.set_tier(tenant_id, &to.name).await?;
        self.tiers.insert(tenant_id.clone(), to.name.clone());

        if event.is_charge() {
            match self.payments.charge_proration(&subscription, &event).await {
                Ok(charge) => event.charge_ref = Some(charge.reference),
                Err(e) => {
                    tracing::warn!(
                        amount = %event.proration_amount,
                        error = %e,
                        "Proration charge failed"
                    );
                    event.charge_error = Some(e.to_string());
                }
            }
        } else if event.is_credit() {
            let credit = Discount::new(
                format!("Proration credit: {} → {}", event.from_tier, event.to_tier),
                -event.proration_amount,
            );
            self.store.push_credit(tenant_id, &credit)?;
        }

        self.store.append_tier_change(&event)?;

        tracing::info!(
            from = %event.from_tier,
            to = %event.to_tier,
            proration = %event.proration_amount,
            "Tier changed"
        );
        Ok(event)
    }

    /// A tenant's tier changes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn tier_history(&self, tenant_id: &TenantId) -> Result<Vec<TierChangeEvent>, EngineError> {
        Ok(self.store.list_tier_changes(tenant_id)?)
    }
}
