//! Mid-cycle tier changes.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{round_money, BillingCycle, TenantId, Tier, TierChangeId};

/// Days left in the cycle, counting `now`'s day as remaining.
#[must_use]
pub fn remaining_days(now: DateTime<Utc>) -> u32 {
    let cycle = BillingCycle::from_datetime(now);
    cycle.days() - (now.day() - 1)
}

/// Price difference between two tiers for the rest of the current cycle.
///
/// Positive when upgrading (amount owed now), negative when downgrading
/// (amount credited). Rounded to cents.
#[must_use]
pub fn prorate(from: &Tier, to: &Tier, now: DateTime<Utc>) -> Decimal {
    let days_in_cycle = Decimal::from(BillingCycle::from_datetime(now).days());
    let remaining = Decimal::from(remaining_days(now));
    round_money((to.monthly_price - from.monthly_price) * remaining / days_in_cycle)
}

/// Audit record of a tier change. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierChangeEvent {
    /// Event ID; also the idempotency key of the proration charge.
    pub id: TierChangeId,
    /// Tenant whose tier changed.
    pub tenant_id: TenantId,
    /// Previous tier.
    pub from_tier: String,
    /// New tier.
    pub to_tier: String,
    /// Signed proration amount.
    pub proration_amount: Decimal,
    /// When the change happened.
    pub occurred_at: DateTime<Utc>,
    /// Gateway reference of the immediate charge, if one succeeded.
    #[serde(default)]
    pub charge_ref: Option<String>,
    /// Gateway error of the immediate charge, if it failed.
    #[serde(default)]
    pub charge_error: Option<String>,
}

impl TierChangeEvent {
    /// Build an event for a change happening at `now`.
    #[must_use]
    pub fn new(tenant_id: TenantId, from: &Tier, to: &Tier, now: DateTime<Utc>) -> Self {
        Self {
            id: TierChangeId::generate(),
            tenant_id,
            from_tier: from.name.clone(),
            to_tier: to.name.clone(),
            proration_amount: prorate(from, to, now),
            occurred_at: now,
            charge_ref: None,
            charge_error: None,
        }
    }

    /// Whether the change is owed immediately.
    #[must_use]
    pub fn is_charge(&self) -> bool {
        self.proration_amount > Decimal::ZERO
    }

    /// Whether the change produces a credit for the next cycle.
    #[must_use]
    pub fn is_credit(&self) -> bool {
        self.proration_amount < Decimal::ZERO
    }

    /// Cycle in which the change happened.
    #[must_use]
    pub fn cycle(&self) -> BillingCycle {
        BillingCycle::from_datetime(self.occurred_at)
    }
}
