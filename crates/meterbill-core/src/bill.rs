//! Bills and the bill calculator.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BillingError, Result};
use crate::{BillingCycle, TenantId, Tier, UsageRecord};

/// Days between bill generation and due date.
pub const PAYMENT_TERMS_DAYS: i64 = 30;

/// Round a monetary amount to cents, midpoint away from zero.
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A discount supplied by an external policy (or a carried-over credit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    /// Why the discount applies.
    pub reason: String,
    /// Amount subtracted from the subtotal.
    pub amount: Decimal,
}

impl Discount {
    /// Create a discount.
    #[must_use]
    pub fn new(reason: impl Into<String>, amount: Decimal) -> Self {
        Self {
            reason: reason.into(),
            amount,
        }
    }
}

/// Payment status of a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    /// Generated, not yet settled.
    Pending,
    /// Settled by the payment gateway.
    Paid,
    /// Payment attempt failed; retried on the next run.
    Failed,
}

impl BillStatus {
    /// Status name as used in APIs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }
}

/// Per-category line of a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCharge {
    /// Raw calls.
    pub calls: u64,
    /// Weighted calls.
    pub weight: u64,
    /// Mean response time.
    pub avg_response_time_ms: f64,
    /// Errors divided by calls.
    pub error_rate: f64,
    /// Portion of the category's weight beyond the whole-tier allowance, priced
    /// at the overage rate. Illustrative; not billed separately.
    pub cost: Decimal,
}

/// An invoice for one tenant and cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    /// Tenant billed.
    pub tenant_id: TenantId,
    /// Cycle billed.
    pub billing_cycle: BillingCycle,
    /// Tier the bill was priced with.
    pub tier: String,
    /// Monthly tier price.
    pub base_cost: Decimal,
    /// Weighted calls beyond the allowance.
    pub overage_calls: u64,
    /// `overage_calls * overage_rate_per_call`.
    pub overage_charges: Decimal,
    /// Breakdown by category.
    pub usage_breakdown: BTreeMap<String, CategoryCharge>,
    /// `base_cost + overage_charges`.
    pub subtotal: Decimal,
    /// Discounts applied.
    pub discounts: Vec<Discount>,
    /// `max(0, subtotal - sum(discounts))`.
    pub total: Decimal,
    /// ISO currency code.
    pub currency: String,
    /// Payment status.
    pub status: BillStatus,
    /// Last gateway error, for failed bills.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Number of settlement attempts across runs.
    #[serde(default)]
    pub payment_attempts: u32,
    /// When the bill was generated.
    pub generated_at: DateTime<Utc>,
    /// Payment due date.
    pub due_at: DateTime<Utc>,
    /// When the gateway confirmed payment.
    pub paid_at: Option<DateTime<Utc>>,
    /// Gateway invoice reference.
    pub external_invoice_ref: Option<String>,
}

impl Bill {
    /// Sum of all discounts.
    #[must_use]
    pub fn discount_total(&self) -> Decimal {
        self.discounts.iter().map(|d| d.amount).sum()
    }

    /// Idempotency key forwarded to the payment gateway.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.billing_cycle)
    }

    /// Whether the bill has been settled.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.status == BillStatus::Paid
    }

    /// Record the gateway invoice reference.
    pub fn set_invoice_ref(&mut self, invoice_ref: impl Into<String>) {
        self.external_invoice_ref = Some(invoice_ref.into());
    }

    /// Transition to `Paid`.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidBillTransition` if the bill is already paid.
    pub fn mark_paid(&mut self, paid_at: DateTime<Utc>) -> Result<()> {
        self.transition(BillStatus::Paid)?;
        self.paid_at = Some(paid_at);
        self.failure_reason = None;
        Ok(())
    }

    /// Transition to `Failed` with the gateway error attached.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidBillTransition` if the bill is already paid.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(BillStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, to: BillStatus) -> Result<()> {
        if self.status == BillStatus::Paid {
            return Err(BillingError::InvalidBillTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.payment_attempts += 1;
        Ok(())
    }
}

/// Pending credits split against the amount a bill can absorb.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreditApplication {
    /// Credits (or the part of one) to put on the bill.
    pub applied: Vec<Discount>,
    /// Pending credits used up, counted from the front of the queue.
    pub consumed: usize,
    /// Unused part of the last credit touched, to stay pending.
    pub carry_over: Option<Discount>,
}

/// Apply pending credits in order until `capacity` is used up.
///
/// A credit larger than the remaining capacity is split: the part that fits
/// is applied and the rest is carried over to a later bill.
#[must_use]
pub fn apply_credits(capacity: Decimal, credits: &[Discount]) -> CreditApplication {
    let mut remaining = capacity.max(Decimal::ZERO);
    let mut application = CreditApplication::default();

    for credit in credits {
        if remaining <= Decimal::ZERO {
            break;
        }
        application.consumed += 1;
        if credit.amount <= remaining {
            remaining -= credit.amount;
            application.applied.push(credit.clone());
        } else {
            application
                .applied
                .push(Discount::new(credit.reason.clone(), remaining));
            application.carry_over = Some(Discount::new(
                credit.reason.clone(),
                credit.amount - remaining,
            ));
            break;
        }
    }
    application
}

/// Compute the bill for a cycle's usage.
///
/// Pure and deterministic: identical inputs produce identical bills.
#[must_use]
pub fn calculate_bill(
    record: &UsageRecord,
    tier: &Tier,
    discounts: &[Discount],
    generated_at: DateTime<Utc>,
    currency: &str,
) -> Bill {
    let base_cost = round_money(tier.monthly_price);
    let overage_calls = tier.overage_calls(record.weighted_calls);
    let overage_charges = round_money(tier.overage_cost(overage_calls));

    let usage_breakdown = record
        .endpoint_breakdown
        .iter()
        .map(|(category, usage)| {
            let charge = CategoryCharge {
                calls: usage.calls,
                weight: usage.weight,
                avg_response_time_ms: usage.avg_response_time_ms,
                error_rate: usage.error_rate(),
                cost: round_money(tier.overage_cost(tier.overage_calls(usage.weight))),
            };
            (category.clone(), charge)
        })
        .collect();

    let subtotal = base_cost + overage_charges;
    let discount_total: Decimal = discounts.iter().map(|d| d.amount).sum();
    let total = round_money((subtotal - discount_total).max(Decimal::ZERO));

    Bill {
        tenant_id: record.tenant_id.clone(),
        billing_cycle: record.billing_cycle,
        tier: tier.name.clone(),
        base_cost,
        overage_calls,
        overage_charges,
        usage_breakdown,
        subtotal,
        discounts: discounts.to_vec(),
        total,
        currency: currency.to_string(),
        status: BillStatus::Pending,
        failure_reason: None,
        payment_attempts: 0,
        generated_at,
        due_at: generated_at + Duration::days(PAYMENT_TERMS_DAYS),
        paid_at: None,
        external_invoice_ref: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classification;
    use crate::CallEvent;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn pro() -> Tier {
        Tier::new("pro", dec!(299), 10_000, dec!(0.05))
    }

    fn record(weighted: u64) -> UsageRecord {
        let now = Utc.with_ymd_and_hms(2024, 4, 30, 12, 0, 0).unwrap();
        let mut record = UsageRecord::empty(
            TenantId::new("acme").unwrap(),
            BillingCycle::from_datetime(now),
            now,
        );
        record.weighted_calls = weighted;
        record
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn pro_tier_with_500_overage() {
        let bill = calculate_bill(&record(10_500), &pro(), &[], at(), "USD");
        assert_eq!(bill.overage_calls, 500);
        assert_eq!(bill.overage_charges, dec!(25.00));
        assert_eq!(bill.subtotal, dec!(324.00));
        assert_eq!(bill.total, dec!(324.00));
        assert_eq!(bill.status, BillStatus::Pending);
        assert_eq!(bill.due_at, at() + Duration::days(30));
    }

    #[test]
    fn usage_within_allowance_has_no_overage() {
        let bill = calculate_bill(&record(9_000), &pro(), &[], at(), "USD");
        assert_eq!(bill.overage_calls, 0);
        assert_eq!(bill.overage_charges, Decimal::ZERO);
        assert_eq!(bill.total, dec!(299));
    }

    #[test]
    fn discounts_clamp_total_at_zero() {
        let discounts = [
            Discount::new("loyalty", dec!(200)),
            Discount::new("credit", dec!(150)),
        ];
        let bill = calculate_bill(&record(0), &pro(), &discounts, at(), "USD");
        assert_eq!(bill.discount_total(), dec!(350));
        assert_eq!(bill.total, Decimal::ZERO);
    }

    #[test]
    fn category_cost_only_above_whole_tier_allowance() {
        let now = at();
        let mut rec = UsageRecord::empty(
            TenantId::new("acme").unwrap(),
            BillingCycle::new(2024, 4).unwrap(),
            now,
        );
        let ai = Classification {
            weight: 10,
            category: "ai".into(),
        };
        let plain = Classification::default();
        let call = CallEvent {
            tenant_id: rec.tenant_id.clone(),
            path: "/api/v1/ai/x".into(),
            response_time_ms: 10,
            status_code: 200,
            bytes_transferred: 0,
        };
        for _ in 0..1_100 {
            rec.apply_call(&call, &ai, now);
        }
        for _ in 0..50 {
            rec.apply_call(&call, &plain, now);
        }

        let bill = calculate_bill(&rec, &pro(), &[], now, "USD");
        assert_eq!(bill.usage_breakdown["ai"].cost, dec!(50.00));
        assert_eq!(bill.usage_breakdown["general"].cost, Decimal::ZERO);
        assert_eq!(bill.overage_calls, 1_050);
    }

    #[test]
    fn calculation_is_deterministic() {
        let rec = record(12_345);
        let discounts = [Discount::new("promo", dec!(10))];
        let a = calculate_bill(&rec, &pro(), &discounts, at(), "USD");
        let b = calculate_bill(&rec, &pro(), &discounts, at(), "USD");
        assert_eq!(a, b);
    }

    #[test]
    fn fractional_rates_round_to_cents() {
        let tier = Tier::new("micro", dec!(0), 0, dec!(0.0015));
        let bill = calculate_bill(&record(3), &tier, &[], at(), "USD");
        // 3 * 0.0015 = 0.0045 -> 0.00
        assert_eq!(bill.overage_charges, dec!(0.00));
        let bill = calculate_bill(&record(5), &tier, &[], at(), "USD");
        // 0.0075 -> 0.01
        assert_eq!(bill.overage_charges, dec!(0.01));
    }

    #[test]
    fn paid_is_terminal() {
        let mut bill = calculate_bill(&record(0), &pro(), &[], at(), "USD");
        bill.mark_failed("card declined").unwrap();
        assert_eq!(bill.failure_reason.as_deref(), Some("card declined"));
        bill.mark_paid(at()).unwrap();
        assert!(bill.is_paid());
        assert!(bill.failure_reason.is_none());
        assert_eq!(bill.payment_attempts, 2);
        assert!(matches!(
            bill.mark_failed("late"),
            Err(BillingError::InvalidBillTransition { .. })
        ));
    }

    #[test]
    fn credits_apply_in_order_up_to_capacity() {
        let credits = [
            Discount::new("Proration credit: pro → starter", dec!(30)),
            Discount::new("Proration credit: starter → free", dec!(40)),
            Discount::new("goodwill", dec!(5)),
        ];

        let all = apply_credits(dec!(100), &credits);
        assert_eq!(all.consumed, 3);
        assert_eq!(all.applied, credits.to_vec());
        assert!(all.carry_over.is_none());

        let split = apply_credits(dec!(49), &credits);
        assert_eq!(split.consumed, 2);
        assert_eq!(split.applied[0].amount, dec!(30));
        assert_eq!(split.applied[1].amount, dec!(19));
        let rest = split.carry_over.unwrap();
        assert_eq!(rest.amount, dec!(21));
        assert_eq!(rest.reason, "Proration credit: starter → free");
    }

    #[test]
    fn nothing_applies_to_a_free_bill() {
        let credits = [Discount::new("credit", dec!(10))];
        assert_eq!(apply_credits(Decimal::ZERO, &credits), CreditApplication::default());
    }

    #[test]
    fn idempotency_key_is_tenant_and_cycle() {
        let bill = calculate_bill(&record(0), &pro(), &[], at(), "USD");
        assert_eq!(bill.idempotency_key(), "acme:2024-04");
    }
}
