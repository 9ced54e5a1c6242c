//! Key encoding utilities for `RocksDB`.
//!
//! Tenant IDs never contain a NUL byte, so `0x00` separates composite key
//! parts and a `part || 0x00` prefix never matches a longer tenant ID.

use meterbill_core::{BillingCycle, TenantId, TierChangeId};

const SEP: u8 = 0x00;

/// Encoded length of a billing cycle (`YYYY-MM`).
pub const CYCLE_LEN: usize = 7;

fn cycle_bytes(cycle: BillingCycle) -> [u8; CYCLE_LEN] {
    let mut out = [b'0'; CYCLE_LEN];
    let text = cycle.to_string();
    out.copy_from_slice(&text.as_bytes()[..CYCLE_LEN]);
    out
}

/// Primary key of a per-cycle record.
///
/// Format: `cycle (7 bytes) || 0x00 || tenant_id`
///
/// Records of one cycle are contiguous, so a cycle's batch is a prefix scan.
#[must_use]
pub fn cycle_tenant_key(cycle: BillingCycle, tenant_id: &TenantId) -> Vec<u8> {
    let mut key = Vec::with_capacity(CYCLE_LEN + 1 + tenant_id.as_str().len());
    key.extend_from_slice(&cycle_bytes(cycle));
    key.push(SEP);
    key.extend_from_slice(tenant_id.as_ref());
    key
}

/// Prefix for iterating all records of a cycle.
#[must_use]
pub fn cycle_prefix(cycle: BillingCycle) -> Vec<u8> {
    let mut key = cycle_bytes(cycle).to_vec();
    key.push(SEP);
    key
}

/// Tenant index key.
///
/// Format: `tenant_id || 0x00 || cycle (7 bytes)`
///
/// Cycles sort chronologically within a tenant.
#[must_use]
pub fn tenant_cycle_key(tenant_id: &TenantId, cycle: BillingCycle) -> Vec<u8> {
    let mut key = tenant_prefix(tenant_id);
    key.extend_from_slice(&cycle_bytes(cycle));
    key
}

/// Prefix for iterating everything indexed under a tenant.
#[must_use]
pub fn tenant_prefix(tenant_id: &TenantId) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant_id.as_str().len() + 1 + 16);
    key.extend_from_slice(tenant_id.as_ref());
    key.push(SEP);
    key
}

/// Extract the cycle from a tenant index key.
#[must_use]
pub fn extract_cycle_from_tenant_key(key: &[u8]) -> Option<BillingCycle> {
    let start = key.len().checked_sub(CYCLE_LEN)?;
    std::str::from_utf8(&key[start..]).ok()?.parse().ok()
}

/// Tier change key.
///
/// Format: `tenant_id || 0x00 || change_id (16 bytes)`
///
/// Since ULIDs are time-ordered, a tenant's changes sort oldest first.
#[must_use]
pub fn tier_change_key(tenant_id: &TenantId, change_id: &TierChangeId) -> Vec<u8> {
    let mut key = tenant_prefix(tenant_id);
    key.extend_from_slice(&change_id.as_ulid().to_bytes());
    key
}

/// Pending credits key.
#[must_use]
pub fn credit_key(tenant_id: &TenantId) -> Vec<u8> {
    tenant_id.as_ref().to_vec()
}
