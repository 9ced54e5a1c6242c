//! Revenue metrics and tenant segmentation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Bill, BillingCycle, Tier};

/// Running revenue metrics, updated as bills are paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSnapshot {
    /// Base revenue of bills paid for `billing_cycle`.
    pub mrr: Decimal,
    /// `mrr * 12`.
    pub arr: Decimal,
    /// Overage charges across every paid bill. Never reset.
    pub overage_revenue_to_date: Decimal,
    /// Cycle `mrr` accumulates for.
    pub billing_cycle: Option<BillingCycle>,
    /// Bills counted into `mrr`.
    pub paid_bills: u64,
    /// Last update time.
    pub computed_at: DateTime<Utc>,
}

impl RevenueSnapshot {
    /// A snapshot with no revenue.
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            mrr: Decimal::ZERO,
            arr: Decimal::ZERO,
            overage_revenue_to_date: Decimal::ZERO,
            billing_cycle: None,
            paid_bills: 0,
            computed_at: now,
        }
    }

    /// Fold a paid bill into the metrics.
    ///
    /// A bill for a newer cycle than the snapshot's restarts the `mrr`
    /// accumulation; a bill for an older cycle (a late retry) only adds
    /// to the overage total.
    pub fn apply_paid_bill(&mut self, bill: &Bill, now: DateTime<Utc>) {
        match self.billing_cycle {
            Some(current) if bill.billing_cycle < current => {}
            Some(current) if bill.billing_cycle == current => {
                self.mrr += bill.base_cost;
                self.paid_bills += 1;
            }
            _ => {
                self.billing_cycle = Some(bill.billing_cycle);
                self.mrr = bill.base_cost;
                self.paid_bills = 1;
            }
        }
        self.overage_revenue_to_date += bill.overage_charges;
        self.arr = self.mrr * Decimal::from(12);
        self.computed_at = now;
    }
}

/// Tenant bucket by share of the allowance used this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageBucket {
    /// Under 30 %.
    Light,
    /// 30 % to under 80 %.
    Moderate,
    /// 80 % and above.
    Heavy,
}

impl UsageBucket {
    /// Bucket for a tenant's weighted calls on a tier.
    ///
    /// Tiers without an allowance count any usage as heavy.
    #[must_use]
    pub fn classify(tier: &Tier, weighted_calls: u64) -> Self {
        match tier.usage_percent(weighted_calls) {
            Some(p) if p < 30.0 => Self::Light,
            Some(p) if p < 80.0 => Self::Moderate,
            Some(_) => Self::Heavy,
            None if weighted_calls == 0 => Self::Light,
            None => Self::Heavy,
        }
    }
}

/// Tenant bucket by latest bill total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RevenueBucket {
    /// Under 100.
    #[serde(rename = "under_100")]
    Under100,
    /// 100 to under 500.
    #[serde(rename = "100_to_500")]
    From100To500,
    /// 500 to under 2000.
    #[serde(rename = "500_to_2000")]
    From500To2000,
    /// 2000 and above.
    #[serde(rename = "2000_plus")]
    Over2000,
}

impl RevenueBucket {
    /// Bucket for a bill total.
    #[must_use]
    pub fn for_total(total: Decimal) -> Self {
        if total < Decimal::from(100) {
            Self::Under100
        } else if total < Decimal::from(500) {
            Self::From100To500
        } else if total < Decimal::from(2000) {
            Self::From500To2000
        } else {
            Self::Over2000
        }
    }
}

/// Per-tier aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSegment {
    /// Tenants on the tier.
    pub tenants: u64,
    /// Their combined weighted calls this cycle.
    pub weighted_calls: u64,
}

/// Tenant segmentation report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segmentation {
    /// Tenants and usage per tier.
    pub by_tier: BTreeMap<String, TierSegment>,
    /// Tenant counts per usage bucket.
    pub by_usage_bucket: BTreeMap<UsageBucket, u64>,
    /// Tenant counts per revenue bucket; tenants never billed are omitted.
    pub by_revenue_bucket: BTreeMap<RevenueBucket, u64>,
}

impl Segmentation {
    /// Count one tenant.
    pub fn add_tenant(&mut self, tier: &Tier, weighted_calls: u64, latest_bill_total: Option<Decimal>) {
        let segment = self.by_tier.entry(tier.name.clone()).or_default();
        segment.tenants += 1;
        segment.weighted_calls += weighted_calls;

        *self
            .by_usage_bucket
            .entry(UsageBucket::classify(tier, weighted_calls))
            .or_insert(0) += 1;

        if let Some(total) = latest_bill_total {
            *self
                .by_revenue_bucket
                .entry(RevenueBucket::for_total(total))
                .or_insert(0) += 1;
        }
    }

    /// Number of tenants counted.
    #[must_use]
    pub fn tenant_count(&self) -> u64 {
        self.by_tier.values().map(|s| s.tenants).sum()
    }
}
