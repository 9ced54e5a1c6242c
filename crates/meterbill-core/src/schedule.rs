//! Persisted billing scheduler state.
//!
//! The scheduler keeps its fire times and the in-progress run lease in the
//! store so a restarted process resumes where the previous one stopped, and
//! two processes never run the same monthly batch concurrently.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BillingCycle, RunId, TenantId};

/// Phase of the monthly run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// No run has started yet.
    Idle,
    /// A run holds the lease.
    Running,
    /// The last run finished.
    Completed,
}

/// Ownership of an in-progress monthly run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    /// Run identifier.
    pub run_id: RunId,
    /// Cycle being billed.
    pub cycle: BillingCycle,
    /// Instance that holds the lease.
    pub owner: String,
    /// When the lease was taken.
    pub started_at: DateTime<Utc>,
}

impl RunLease {
    /// Whether the lease is older than `ttl` and may be taken over.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.started_at >= ttl
    }
}

/// A tenant whose bill could not be settled in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantFailure {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Cycle of the failed bill.
    pub cycle: BillingCycle,
    /// Error message.
    pub reason: String,
}

/// Outcome of a monthly run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: RunId,
    /// Cycle billed.
    pub cycle: BillingCycle,
    /// Bills considered (including ones already paid on a previous attempt).
    pub total_bills: u64,
    /// Bills paid, including previously paid ones.
    pub paid_count: u64,
    /// Bills that failed.
    pub failed_count: u64,
    /// Sum of paid bill totals.
    pub total_revenue: Decimal,
    /// Tenants whose payment failed.
    pub failures: Vec<TenantFailure>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    /// An empty summary for a run.
    #[must_use]
    pub fn new(run_id: RunId, cycle: BillingCycle, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            cycle,
            total_bills: 0,
            paid_count: 0,
            failed_count: 0,
            total_revenue: Decimal::ZERO,
            failures: Vec::new(),
            started_at,
            finished_at: None,
        }
    }

    /// Count a paid bill.
    pub fn record_paid(&mut self, total: Decimal) {
        self.total_bills += 1;
        self.paid_count += 1;
        self.total_revenue += total;
    }

    /// Count a failed bill.
    pub fn record_failed(&mut self, tenant_id: TenantId, cycle: BillingCycle, reason: impl Into<String>) {
        self.total_bills += 1;
        self.failed_count += 1;
        self.failures.push(TenantFailure {
            tenant_id,
            cycle,
            reason: reason.into(),
        });
    }
}

/// Scheduler state persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Current phase.
    pub phase: RunPhase,
    /// Lease of the run in progress.
    pub active_run: Option<RunLease>,
    /// Next monthly run (first instant of a month).
    pub next_monthly_run: DateTime<Utc>,
    /// Next daily rollup (midnight UTC).
    pub next_daily_run: DateTime<Utc>,
    /// Last cycle whose run completed.
    pub last_completed_cycle: Option<BillingCycle>,
    /// Summary of the last completed run.
    pub last_summary: Option<RunSummary>,
}

impl SchedulerState {
    /// Fresh state with both jobs scheduled after `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: RunPhase::Idle,
            active_run: None,
            next_monthly_run: next_month_boundary(now),
            next_daily_run: next_midnight(now),
            last_completed_cycle: None,
            last_summary: None,
        }
    }

    /// Try to take the run lease.
    ///
    /// Succeeds when no lease is held or the held one is expired. Returns the
    /// previous lease holder on takeover.
    ///
    /// # Errors
    ///
    /// Returns the live lease when another run holds it.
    pub fn acquire(&mut self, lease: RunLease, ttl: Duration) -> Result<Option<RunLease>, RunLease> {
        if let Some(active) = &self.active_run {
            if !active.is_expired(lease.started_at, ttl) {
                return Err(active.clone());
            }
        }
        self.phase = RunPhase::Running;
        Ok(self.active_run.replace(lease))
    }

    /// Cycle the next monthly run bills: the one ending at `next_monthly_run`.
    #[must_use]
    pub fn scheduled_cycle(&self) -> BillingCycle {
        BillingCycle::from_datetime(self.next_monthly_run).previous()
    }

    /// Finish a run and release the lease.
    ///
    /// Only a run of the scheduled cycle advances the schedule, by exactly one
    /// cycle; runs of other cycles leave it untouched.
    pub fn complete(&mut self, mut summary: RunSummary, now: DateTime<Utc>) {
        summary.finished_at = Some(now);
        self.phase = RunPhase::Completed;
        self.active_run = None;
        if summary.cycle == self.scheduled_cycle() {
            self.last_completed_cycle = Some(summary.cycle);
            self.next_monthly_run = summary.cycle.next().end();
        }
        self.last_summary = Some(summary);
    }

    /// Release the lease without completing (run aborted).
    pub fn release(&mut self, run_id: RunId) {
        if self.active_run.as_ref().is_some_and(|l| l.run_id == run_id) {
            self.active_run = None;
            self.phase = if self.last_summary.is_some() {
                RunPhase::Completed
            } else {
                RunPhase::Idle
            };
        }
    }

    /// Whether the monthly run is due.
    #[must_use]
    pub fn monthly_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_monthly_run
    }

    /// Whether the daily rollup is due.
    #[must_use]
    pub fn daily_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_daily_run
    }

    /// Earliest upcoming fire time.
    #[must_use]
    pub fn next_wakeup(&self) -> DateTime<Utc> {
        self.next_monthly_run.min(self.next_daily_run)
    }
}

/// First instant of the month after `now`.
#[must_use]
pub fn next_month_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    BillingCycle::from_datetime(now).next().start()
}

/// Midnight UTC after `now`.
#[must_use]
pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Duration::days(1))
        .and_time(NaiveTime::MIN)
        .and_utc()
}
