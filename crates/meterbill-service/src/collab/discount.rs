//! Discount policy.

use meterbill_core::{Discount, UsageRecord};

use super::Subscription;

/// Supplies discounts for a tenant's bill.
///
/// Called once per bill, before pending proration credits are appended.
pub trait DiscountPolicy: Send + Sync {
    /// Discounts for the bill computed from `record`.
    fn discounts(&self, subscription: &Subscription, record: &UsageRecord) -> Vec<Discount>;
}

/// No discounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscounts;

impl DiscountPolicy for NoDiscounts {
    fn discounts(&self, _subscription: &Subscription, _record: &UsageRecord) -> Vec<Discount> {
        Vec::new()
    }
}
