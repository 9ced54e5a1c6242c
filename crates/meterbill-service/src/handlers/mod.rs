//! API handlers.

pub mod analytics;
pub mod billing;
pub mod events;
pub mod health;
pub mod tenants;
pub mod usage;

use meterbill_core::{BillingCycle, TenantId};

use crate::error::ApiError;

/// Parse a tenant path segment.
fn parse_tenant(value: &str) -> Result<TenantId, ApiError> {
    TenantId::new(value).map_err(|_| ApiError::BadRequest("Invalid tenant ID".into()))
}

/// Parse a `YYYY-MM` path segment.
fn parse_cycle(value: &str) -> Result<BillingCycle, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid billing cycle, expected YYYY-MM".into()))
}
