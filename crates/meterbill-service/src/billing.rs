//! Monthly billing scheduler.
//!
//! A run bills one cycle for every active tenant. The run holds a lease in
//! the persisted scheduler state so only one process bills a cycle at a time;
//! a lease older than its TTL is treated as abandoned and taken over. Runs are
//! idempotent: bills already paid are skipped, existing pending or failed bills
//! are settled again against the invoice they already have. Only cycles that
//! have ended can be billed, and only a run of the scheduled cycle moves the
//! schedule forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;

use meterbill_core::schedule::next_midnight;
use meterbill_core::{
    apply_credits, calculate_bill, Bill, BillStatus, BillingCycle, BillingError, RunId, RunLease,
    RunSummary, TenantId, Tier, TierCatalog, UsageRecord,
};
use meterbill_store::Store;

use crate::aggregator::TierCache;
use crate::analytics::RevenueAnalytics;
use crate::collab::{Clock, DiscountPolicy, Notifier, Subscription, SubscriptionDirectory};
use crate::error::EngineError;
use crate::payments::PaymentProcessor;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Identifies this process as lease owner.
    pub instance_id: String,
    /// Age after which a held lease may be taken over.
    pub lease_ttl: chrono::Duration,
    /// Tenants settled concurrently.
    pub concurrency: usize,
    /// Bill currency.
    pub currency: String,
    /// Longest sleep between scheduler ticks.
    pub max_sleep: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            instance_id: "meterbill".into(),
            lease_ttl: chrono::Duration::minutes(30),
            concurrency: 16,
            currency: "USD".into(),
            max_sleep: Duration::from_secs(60),
        }
    }
}

/// Result of the daily rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyRollup {
    /// Day rolled up.
    pub date: NaiveDate,
    /// Tenants with usage that day.
    pub tenants: u64,
    /// Weighted calls that day.
    pub weighted_calls: u64,
}

enum Outcome {
    AlreadyPaid(Decimal),
    Paid(Decimal),
    Failed {
        tenant_id: TenantId,
        cycle: BillingCycle,
        reason: String,
    },
}

/// Turns usage records into settled bills.
pub struct BillingScheduler {
    store: Arc<dyn Store>,
    directory: Arc<dyn SubscriptionDirectory>,
    catalog: Arc<TierCatalog>,
    tiers: TierCache,
    discounts: Arc<dyn DiscountPolicy>,
    payments: Arc<PaymentProcessor>,
    analytics: Arc<RevenueAnalytics>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl BillingScheduler {
    /// Create a scheduler.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn SubscriptionDirectory>,
        catalog: Arc<TierCatalog>,
        tiers: TierCache,
        discounts: Arc<dyn DiscountPolicy>,
        payments: Arc<PaymentProcessor>,
        analytics: Arc<RevenueAnalytics>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            directory,
            catalog,
            tiers,
            discounts,
            payments,
            analytics,
            notifier,
            clock,
            settings,
        }
    }

    // =========================================================================
    // Monthly run
    // =========================================================================

    /// Bill `cycle` for every active tenant.
    ///
    /// Individual tenant failures are recorded in the summary and never abort
    /// the run. Failed bills of earlier cycles are retried after the current
    /// cycle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCycle` if `cycle` has not ended yet, `AlreadyRunning`
    /// if another live run holds the lease, or an error if the run cannot
    /// start (directory or store unavailable).
    #[tracing::instrument(skip(self, cycle), fields(cycle = %cycle))]
    pub async fn run_monthly(&self, cycle: BillingCycle) -> Result<RunSummary, EngineError> {
        let started_at = self.clock.now();
        if cycle >= BillingCycle::from_datetime(started_at) {
            return Err(BillingError::InvalidCycle(format!("{cycle} has not ended")).into());
        }

        let lease = RunLease {
            run_id: RunId::generate(),
            cycle,
            owner: self.settings.instance_id.clone(),
            started_at,
        };
        let run_id = lease.run_id;

        let mut acquired = None;
        self.store.update_scheduler_state(started_at, &mut |state| {
            acquired = Some(state.acquire(lease.clone(), self.settings.lease_ttl));
        })?;
        match acquired {
            Some(Err(held)) => {
                return Err(EngineError::AlreadyRunning { owner: held.owner });
            }
            Some(Ok(Some(previous))) => {
                tracing::warn!(
                    previous_owner = %previous.owner,
                    previous_run = %previous.run_id,
                    "Took over abandoned billing run"
                );
            }
            _ => {}
        }

        let tenants = match self.directory.active_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                tracing::error!(error = %e, "Cannot list tenants; aborting billing run");
                self.release(run_id)?;
                return Err(e.into());
            }
        };
        for subscription in &tenants {
            self.tiers
                .insert(subscription.tenant_id.clone(), subscription.tier.clone());
        }

        tracing::info!(
            run_id = %run_id,
            tenants = tenants.len(),
            "Billing run started"
        );

        let mut summary = RunSummary::new(run_id, cycle, started_at);
        let concurrency = self.settings.concurrency.max(1);

        let billing: Vec<_> = tenants
            .iter()
            .map(|subscription| self.bill_tenant(subscription, cycle))
            .collect();
        let outcomes: Vec<Outcome> = stream::iter(billing)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            Self::record(&mut summary, outcome);
        }

        let by_tenant: HashMap<&TenantId, &Subscription> =
            tenants.iter().map(|s| (&s.tenant_id, s)).collect();
        let retrying: Vec<_> = self
            .store
            .list_bills_with_status(BillStatus::Failed)?
            .into_iter()
            .filter(|bill| bill.billing_cycle < cycle)
            .filter_map(|bill| {
                let subscription = by_tenant.get(&bill.tenant_id).copied()?;
                Some(self.settle(subscription, bill))
            })
            .collect();
        let retries: Vec<Outcome> = stream::iter(retrying)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in retries {
            Self::record(&mut summary, outcome);
        }

        let finished_at = self.clock.now();
        summary.finished_at = Some(finished_at);
        let mut completed = false;
        self.store.update_scheduler_state(finished_at, &mut |state| {
            if state.active_run.as_ref().is_some_and(|l| l.run_id == run_id) {
                state.complete(summary.clone(), finished_at);
                completed = true;
            }
        })?;
        if !completed {
            tracing::warn!(run_id = %run_id, "Lease lost before completion; summary not recorded");
        }

        tracing::info!(
            run_id = %run_id,
            total_bills = summary.total_bills,
            paid = summary.paid_count,
            failed = summary.failed_count,
            revenue = %summary.total_revenue,
            "Billing run completed"
        );
        Ok(summary)
    }

    fn record(summary: &mut RunSummary, outcome: Outcome) {
        match outcome {
            Outcome::AlreadyPaid(total) | Outcome::Paid(total) => summary.record_paid(total),
            Outcome::Failed {
                tenant_id,
                cycle,
                reason,
            } => summary.record_failed(tenant_id, cycle, reason),
        }
    }

    fn release(&self, run_id: RunId) -> Result<(), EngineError> {
        self.store
            .update_scheduler_state(self.clock.now(), &mut |state| state.release(run_id))?;
        Ok(())
    }

    async fn bill_tenant(&self, subscription: &Subscription, cycle: BillingCycle) -> Outcome {
        match self.prepare_bill(subscription, cycle) {
            Ok(bill) if bill.is_paid() => Outcome::AlreadyPaid(bill.total),
            Ok(bill) => self.settle(subscription, bill).await,
            Err(e) => {
                tracing::error!(
                    tenant_id = %subscription.tenant_id,
                    error = %e,
                    "Could not prepare bill"
                );
                Outcome::Failed {
                    tenant_id: subscription.tenant_id.clone(),
                    cycle,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// The tenant's bill for `cycle`: the stored one if any, otherwise a new
    /// one computed from usage, policy discounts and pending credits.
    ///
    /// The cycle is priced at the tier the tenant held when it began; changes
    /// made during the cycle were already settled by proration. Credits apply
    /// up to the bill's total and any remainder stays pending.
    fn prepare_bill(
        &self,
        subscription: &Subscription,
        cycle: BillingCycle,
    ) -> Result<Bill, EngineError> {
        let tenant_id = &subscription.tenant_id;
        if let Some(existing) = self.store.get_bill(tenant_id, cycle)? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let record = if let Some(record) = self.store.get_usage(tenant_id, cycle)? {
            record
        } else {
            tracing::warn!(
                tenant_id = %tenant_id,
                cycle = %cycle,
                "No usage record for cycle; billing base cost only"
            );
            UsageRecord::empty(tenant_id.clone(), cycle, now)
        };

        let tier = self.tier_at_cycle_start(subscription, cycle)?;
        let mut discounts = self.discounts.discounts(subscription, &record);
        let before_credits = calculate_bill(&record, tier, &discounts, now, &self.settings.currency);

        let credits = self.store.pending_credits(tenant_id)?;
        let applied = apply_credits(before_credits.total, &credits);
        discounts.extend(applied.applied.iter().cloned());

        let bill = calculate_bill(&record, tier, &discounts, now, &self.settings.currency);
        self.store.create_bill(&bill, &applied)?;

        tracing::debug!(
            tenant_id = %tenant_id,
            cycle = %cycle,
            tier = %bill.tier,
            total = %bill.total,
            credits = applied.consumed,
            carried_over = applied.carry_over.is_some(),
            "Bill generated"
        );
        Ok(bill)
    }

    /// Tier in effect at the first instant of `cycle`.
    fn tier_at_cycle_start(
        &self,
        subscription: &Subscription,
        cycle: BillingCycle,
    ) -> Result<&Tier, EngineError> {
        let start = cycle.start();
        let name = self
            .store
            .list_tier_changes(&subscription.tenant_id)?
            .into_iter()
            .filter(|change| change.occurred_at >= start)
            .min_by_key(|change| change.occurred_at)
            .map_or_else(|| subscription.tier.clone(), |change| change.from_tier);
        Ok(self.catalog.resolve(Some(&name)))
    }

    async fn settle(&self, subscription: &Subscription, mut bill: Bill) -> Outcome {
        let tenant_id = bill.tenant_id.clone();
        let cycle = bill.billing_cycle;

        let result = match self.payments.settle_bill(subscription, &mut bill).await {
            Ok(charge) => {
                let paid_at = charge.paid_at.unwrap_or_else(|| self.clock.now());
                self.finalize_paid(&mut bill, paid_at)
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => Outcome::Paid(bill.total),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    tenant_id = %tenant_id,
                    cycle = %cycle,
                    error = %reason,
                    "Bill payment failed"
                );
                if !bill.is_paid() {
                    let persisted = bill
                        .mark_failed(reason.clone())
                        .map_err(EngineError::from)
                        .and_then(|()| Ok(self.store.put_bill(&bill)?));
                    if let Err(e) = persisted {
                        tracing::error!(tenant_id = %tenant_id, error = %e, "Could not record failed bill");
                    }
                }
                Outcome::Failed {
                    tenant_id,
                    cycle,
                    reason,
                }
            }
        }
    }

    fn finalize_paid(&self, bill: &mut Bill, paid_at: DateTime<Utc>) -> Result<(), EngineError> {
        bill.mark_paid(paid_at)?;
        self.store.put_bill(bill)?;
        self.analytics.on_bill_paid(bill)?;
        self.store
            .archive_usage(&bill.tenant_id, bill.billing_cycle, paid_at)?;

        let notifier = Arc::clone(&self.notifier);
        let paid = bill.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_invoice(&paid).await {
                tracing::warn!(tenant_id = %paid.tenant_id, error = %e, "Invoice notification failed");
            }
        });

        tracing::info!(
            tenant_id = %bill.tenant_id,
            cycle = %bill.billing_cycle,
            total = %bill.total,
            "Bill paid"
        );
        Ok(())
    }

    /// Settle one unpaid bill again, outside the monthly run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such bill and `TenantNotFound` if the
    /// tenant left the directory. A failed payment is not an error; it is
    /// visible on the returned bill.
    pub async fn retry_bill(
        &self,
        tenant_id: &TenantId,
        cycle: BillingCycle,
    ) -> Result<Bill, EngineError> {
        let not_found = || EngineError::NotFound(format!("bill {tenant_id} {cycle}"));
        let bill = self.store.get_bill(tenant_id, cycle)?.ok_or_else(not_found)?;
        if bill.is_paid() {
            return Ok(bill);
        }

        let subscription = self
            .directory
            .get(tenant_id)
            .await?
            .ok_or_else(|| EngineError::TenantNotFound(tenant_id.clone()))?;
        self.settle(&subscription, bill).await;

        self.store.get_bill(tenant_id, cycle)?.ok_or_else(not_found)
    }

    // =========================================================================
    // Daily rollup
    // =========================================================================

    /// Checkpoint the store and report the day that just ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn run_daily_rollup(&self, now: DateTime<Utc>) -> Result<DailyRollup, EngineError> {
        self.store.flush()?;

        let date = (now - chrono::Duration::days(1)).date_naive();
        let records = self
            .store
            .list_usage_by_cycle(BillingCycle::from_date(date))?;
        let mut rollup = DailyRollup {
            date,
            tenants: 0,
            weighted_calls: 0,
        };
        for weighted in records.iter().filter_map(|r| r.daily_usage.get(&date)) {
            rollup.tenants += 1;
            rollup.weighted_calls += weighted;
        }

        self.store.update_scheduler_state(now, &mut |state| {
            state.next_daily_run = next_midnight(now);
        })?;

        tracing::info!(
            date = %rollup.date,
            tenants = rollup.tenants,
            weighted_calls = rollup.weighted_calls,
            "Daily usage rollup"
        );
        Ok(rollup)
    }

    // =========================================================================
    // Timer loop
    // =========================================================================

    /// Run whatever is due at `now`.
    ///
    /// Resumes an abandoned run first, then bills every scheduled cycle that
    /// has ended, oldest first, so a scheduler that was down for several
    /// months catches up one cycle at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if a due monthly run cannot start or the store fails.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunSummary>, EngineError> {
        let mut state = self.store.update_scheduler_state(now, &mut |_| {})?;
        let daily_due = state.daily_due(now);

        let mut summaries = Vec::new();
        if let Some(lease) = &state.active_run {
            if lease.is_expired(now, self.settings.lease_ttl) {
                tracing::info!(cycle = %lease.cycle, owner = %lease.owner, "Resuming abandoned billing run");
                summaries.push(self.run_monthly(lease.cycle).await?);
                state = self.store.update_scheduler_state(now, &mut |_| {})?;
            }
        }

        while state.active_run.is_none() && state.monthly_due(now) {
            let cycle = state.scheduled_cycle();
            summaries.push(self.run_monthly(cycle).await?);
            state = self.store.update_scheduler_state(now, &mut |_| {})?;
            if state.scheduled_cycle() == cycle {
                tracing::warn!(cycle = %cycle, "Schedule did not advance; stopping catch-up");
                break;
            }
        }

        if daily_due {
            self.run_daily_rollup(now)?;
        }
        Ok(summaries)
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(instance_id = %self.settings.instance_id, "Billing scheduler started");

        loop {
            let now = self.clock.now();
            if let Err(e) = self.tick(now).await {
                tracing::error!(error = %e, "Scheduler tick failed");
            }

            let wake = match self.store.get_scheduler_state() {
                Ok(Some(state)) => state.next_wakeup(),
                _ => now,
            };
            let sleep_for = (wake - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(Duration::from_secs(1), self.settings.max_sleep.max(Duration::from_secs(1)));

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Billing scheduler stopped");
    }
}
