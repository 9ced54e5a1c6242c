//! Usage threshold alerts.
//!
//! [`check_thresholds`] runs on the hot path right after a call is folded into
//! a record, inside the same atomic upsert, so each threshold fires at most
//! once per `(tenant, cycle)`.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::usage::AlertThreshold;
use crate::{round_money, BillingCycle, TenantId, Tier, UsageRecord};

/// Kind of alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Usage crossed 80, 90 or 100 percent of the allowance.
    UsageThreshold,
    /// Usage crossed 120 percent; suggest a larger tier.
    UpgradeSuggestion,
}

/// An alert handed to the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique alert ID, usable for deduplication downstream.
    pub alert_id: Uuid,
    /// Tenant the alert concerns.
    pub tenant_id: TenantId,
    /// Alert kind.
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Threshold crossed.
    pub threshold: AlertThreshold,
    /// Weighted calls so far this cycle.
    pub current_usage: u64,
    /// Allowance of the tenant's tier.
    pub included_calls: u64,
    /// Overage cost projected to the end of the cycle at the current daily rate.
    pub estimated_overage: Decimal,
    /// Cycle the alert belongs to.
    pub billing_cycle: BillingCycle,
    /// When the alert fired.
    pub timestamp: DateTime<Utc>,
}

/// Evaluate thresholds after a call and mark the ones that fire.
///
/// Returns alerts in threshold order. Thresholds already in
/// `record.alert_flags` (or an already-offered upgrade) never fire again.
/// Tiers with no allowance never alert.
pub fn check_thresholds(record: &mut UsageRecord, tier: &Tier, now: DateTime<Utc>) -> Vec<AlertEvent> {
    let Some(percent) = tier.usage_percent(record.weighted_calls) else {
        return Vec::new();
    };

    let mut fired = Vec::new();
    for threshold in AlertThreshold::USAGE {
        if percent >= f64::from(threshold.percent()) && record.alert_flags.insert(threshold) {
            fired.push((AlertKind::UsageThreshold, threshold));
        }
    }

    if percent >= f64::from(AlertThreshold::OneTwenty.percent()) && !record.upgrade_offered {
        record.upgrade_offered = true;
        record.alert_flags.insert(AlertThreshold::OneTwenty);
        fired.push((AlertKind::UpgradeSuggestion, AlertThreshold::OneTwenty));
    }

    if fired.is_empty() {
        return Vec::new();
    }

    let estimated_overage = projected_overage(record, tier, now);
    fired
        .into_iter()
        .map(|(kind, threshold)| AlertEvent {
            alert_id: Uuid::new_v4(),
            tenant_id: record.tenant_id.clone(),
            kind,
            threshold,
            current_usage: record.weighted_calls,
            included_calls: tier.included_weighted_calls,
            estimated_overage,
            billing_cycle: record.billing_cycle,
            timestamp: now,
        })
        .collect()
}

/// Overage cost if the cycle continues at the average daily rate seen so far.
fn projected_overage(record: &UsageRecord, tier: &Tier, now: DateTime<Utc>) -> Decimal {
    let cycle = record.billing_cycle;
    let elapsed_days = if cycle.contains(now.date_naive()) {
        u64::from(now.day())
    } else {
        u64::from(cycle.days())
    };
    let projected = record
        .weighted_calls
        .saturating_mul(u64::from(cycle.days()))
        / elapsed_days.max(1);
    round_money(tier.overage_cost(tier.overage_calls(projected)))
}
