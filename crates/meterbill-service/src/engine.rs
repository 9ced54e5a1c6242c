//! The metering engine.
//!
//! [`MeteringEngine`] owns the aggregator, scheduler, tier manager and
//! analytics, wired to the injected collaborators. It is the single entry
//! point used by the HTTP layer and by embedding applications.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use meterbill_core::{
    AlertEvent, Bill, BillingCycle, CallEvent, EndpointClassifier, ExportFormat, RevenueSnapshot,
    RunSummary, Segmentation, TenantId, Tier, TierCatalog, TierChangeEvent, UsageRecord,
};
use meterbill_store::Store;

use crate::aggregator::{Recorded, TierCache, UsageAggregator};
use crate::analytics::RevenueAnalytics;
use crate::billing::{BillingScheduler, DailyRollup, SchedulerSettings};
use crate::collab::{
    Clock, DiscountPolicy, Notifier, PaymentGateway, SubscriptionDirectory,
};
use crate::config::ServiceConfig;
use crate::error::EngineError;
use crate::payments::{PaymentProcessor, RetryPolicy};
use crate::tiers::TierManager;

/// The engine's external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Durable storage.
    pub store: Arc<dyn Store>,
    /// Payment gateway.
    pub gateway: Arc<dyn PaymentGateway>,
    /// Notification channel.
    pub notifier: Arc<dyn Notifier>,
    /// Subscription directory.
    pub directory: Arc<dyn SubscriptionDirectory>,
    /// Discount policy.
    pub discounts: Arc<dyn DiscountPolicy>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bill currency.
    pub currency: String,
    /// Gateway timeout and retry policy.
    pub retry: RetryPolicy,
    /// Scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Capacity of the ingest queue.
    pub ingest_queue_capacity: usize,
    /// Capacity of the alert queue.
    pub alert_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerSettings::default(),
            ingest_queue_capacity: 10_000,
            alert_queue_capacity: 1_024,
        }
    }
}

impl EngineSettings {
    /// Settings derived from the service configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let defaults = Self::default();
        Self {
            currency: config.currency.clone(),
            retry: RetryPolicy {
                attempt_timeout: Duration::from_secs(config.payment_timeout_seconds),
                max_retries: config.payment_max_retries,
                base_delay_ms: config.payment_retry_base_ms,
                ..defaults.retry
            },
            scheduler: SchedulerSettings {
                instance_id: config.instance_id.clone(),
                lease_ttl: chrono::Duration::from_std(Duration::from_secs(
                    config.run_lease_ttl_seconds,
                ))
                .unwrap_or(defaults.scheduler.lease_ttl),
                currency: config.currency.clone(),
                ..defaults.scheduler
            },
            ingest_queue_capacity: config.ingest_queue_capacity.max(1),
            alert_queue_capacity: defaults.alert_queue_capacity,
        }
    }
}

/// Metering and billing engine.
pub struct MeteringEngine {
    store: Arc<dyn Store>,
    directory: Arc<dyn SubscriptionDirectory>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    tier_cache: TierCache,
    aggregator: UsageAggregator,
    scheduler: Arc<BillingScheduler>,
    tier_manager: TierManager,
    analytics: Arc<RevenueAnalytics>,
    ingest_tx: mpsc::Sender<CallEvent>,
    ingest_rx: Mutex<Option<mpsc::Receiver<CallEvent>>>,
    alert_tx: mpsc::Sender<AlertEvent>,
    alert_rx: Mutex<Option<mpsc::Receiver<AlertEvent>>>,
}

impl MeteringEngine {
    /// Wire an engine. Call [`MeteringEngine::start`] before ingesting.
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        catalog: TierCatalog,
        classifier: EndpointClassifier,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let Collaborators {
            store,
            gateway,
            notifier,
            directory,
            discounts,
            clock,
        } = collaborators;

        let catalog = Arc::new(catalog);
        let tier_cache = TierCache::default();

        let aggregator = UsageAggregator::new(
            Arc::clone(&store),
            Arc::new(classifier),
            Arc::clone(&catalog),
            Arc::clone(&tier_cache),
            Arc::clone(&clock),
        );
        let payments = Arc::new(PaymentProcessor::new(
            gateway,
            Arc::clone(&directory),
            Arc::clone(&store),
            settings.retry.clone(),
            settings.currency.clone(),
        ));
        let analytics = Arc::new(RevenueAnalytics::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&catalog),
            Arc::clone(&clock),
        ));
        let scheduler = Arc::new(BillingScheduler::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&catalog),
            Arc::clone(&tier_cache),
            discounts,
            Arc::clone(&payments),
            Arc::clone(&analytics),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            settings.scheduler.clone(),
        ));
        let tier_manager = TierManager::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            catalog,
            Arc::clone(&tier_cache),
            payments,
            Arc::clone(&clock),
        );

        let (ingest_tx, ingest_rx) = mpsc::channel(settings.ingest_queue_capacity.max(1));
        let (alert_tx, alert_rx) = mpsc::channel(settings.alert_queue_capacity.max(1));

        Arc::new(Self {
            store,
            directory,
            notifier,
            clock,
            tier_cache,
            aggregator,
            scheduler,
            tier_manager,
            analytics,
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load tenant tiers and spawn the ingest and alert workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was already started or the directory
    /// cannot be read.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let (ingest_rx, alert_rx) = match (self.ingest_rx.lock().take(), self.alert_rx.lock().take()) {
            (Some(ingest), Some(alert)) => (ingest, alert),
            _ => return Err(EngineError::SchedulerStart("engine already started".into())),
        };

        let tenants = self.directory.active_tenants().await?;
        for subscription in &tenants {
            self.tier_cache
                .insert(subscription.tenant_id.clone(), subscription.tier.clone());
        }
        tracing::info!(tenants = tenants.len(), "Tier cache loaded");

        tokio::spawn(Arc::clone(self).ingest_worker(ingest_rx));
        tokio::spawn(Self::alert_worker(Arc::clone(&self.notifier), alert_rx));
        Ok(())
    }

    /// Spawn the billing scheduler loop.
    #[must_use]
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.scheduler).run(shutdown))
    }

    async fn ingest_worker(self: Arc<Self>, mut rx: mpsc::Receiver<CallEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.record_call(&event) {
                tracing::error!(tenant_id = %event.tenant_id, error = %e, "Failed to record call");
            }
        }
    }

    async fn alert_worker(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<AlertEvent>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(alert) = rx.try_recv() {
                batch.push(alert);
            }

            let results =
                futures::future::join_all(batch.iter().map(|a| notifier.notify_alert(a))).await;
            for (alert, result) in batch.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(
                        tenant_id = %alert.tenant_id,
                        threshold = alert.threshold.percent(),
                        error = %e,
                        "Alert delivery failed"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Record a call synchronously and queue any alerts it fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn record_call(&self, event: &CallEvent) -> Result<Recorded, EngineError> {
        let recorded = self.aggregator.record_call(event)?;
        for alert in &recorded.alerts {
            if self.alert_tx.try_send(alert.clone()).is_err() {
                tracing::warn!(
                    tenant_id = %alert.tenant_id,
                    threshold = alert.threshold.percent(),
                    "Alert queue full; alert dropped"
                );
            }
        }
        Ok(recorded)
    }

    /// Queue a call for recording without waiting. Returns `false` and drops
    /// the event if the queue is full.
    pub fn ingest(&self, event: CallEvent) -> bool {
        match self.ingest_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(tenant_id = %event.tenant_id, "Ingest queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(tenant_id = %event.tenant_id, "Ingest queue closed; event dropped");
                false
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The tier currently applied to a tenant.
    #[must_use]
    pub fn tier_for(&self, tenant_id: &TenantId) -> Tier {
        self.aggregator.tier_for(tenant_id)
    }

    /// A tenant's usage for a cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_usage(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
    ) -> Result<Option<UsageRecord>, EngineError> {
        Ok(self.store.get_usage(tenant_id, cycle)?)
    }

    /// A tenant's bill for a cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_bill(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
    ) -> Result<Option<Bill>, EngineError> {
        Ok(self.store.get_bill(tenant_id, cycle)?)
    }

    /// Current revenue metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_revenue_snapshot(&self) -> Result<RevenueSnapshot, EngineError> {
        Ok(self.analytics.snapshot()?)
    }

    /// Tenant segmentation for the current cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the store fails.
    pub async fn get_segmentation(&self) -> Result<Segmentation, EngineError> {
        Ok(self.analytics.segmentation().await?)
    }

    /// Export every usage record of a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or encoding fails.
    pub fn export_usage(
        &self,
        tenant_id: &TenantId,
        format: ExportFormat,
    ) -> Result<String, EngineError> {
        let records = self.store.list_usage_by_tenant(tenant_id)?;
        Ok(UsageRecord::export(&records, format)?)
    }

    /// Load records produced by a JSON export, replacing existing ones.
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input or if the store fails.
    pub fn import_usage(&self, data: &str) -> Result<usize, EngineError> {
        let records = UsageRecord::import(data, ExportFormat::Json)?;
        for record in &records {
            self.store.put_usage(record)?;
        }
        tracing::info!(records = records.len(), "Usage records imported");
        Ok(records.len())
    }

    /// A tenant's tier changes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn tier_history(&self, tenant_id: &TenantId) -> Result<Vec<TierChangeEvent>, EngineError> {
        self.tier_manager.tier_history(tenant_id)
    }

    /// Summary of the last completed monthly run.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn last_run_summary(&self) -> Result<Option<RunSummary>, EngineError> {
        Ok(self
            .store
            .get_scheduler_state()?
            .and_then(|state| state.last_summary))
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Move a tenant to another tier. See [`TierManager::change_tier`].
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tiers or tenants and no-op changes.
    pub async fn change_tier(
        &self,
        tenant_id: &TenantId,
        new_tier: &str,
    ) -> Result<TierChangeEvent, EngineError> {
        self.tier_manager.change_tier(tenant_id, new_tier).await
    }

    /// Bill a cycle now. See [`BillingScheduler::run_monthly`].
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot start.
    pub async fn run_monthly(&self, cycle: BillingCycle) -> Result<RunSummary, EngineError> {
        self.scheduler.run_monthly(cycle).await
    }

    /// Retry one unpaid bill. See [`BillingScheduler::retry_bill`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bill or tenant does not exist.
    pub async fn retry_bill(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
    ) -> Result<Bill, EngineError> {
        self.scheduler.retry_bill(tenant_id, cycle).await
    }

    /// Run whatever scheduled work is due now, returning one summary per
    /// monthly run performed.
    ///
    /// # Errors
    ///
    /// Returns an error if a due run cannot start.
    pub async fn tick(&self) -> Result<Vec<RunSummary>, EngineError> {
        self.scheduler.tick(self.clock.now()).await
    }

    /// Run the daily rollup now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn run_daily_rollup(&self) -> Result<DailyRollup, EngineError> {
        self.scheduler.run_daily_rollup(self.clock.now())
    }
}
