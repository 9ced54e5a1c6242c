//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Usage records, keyed by `cycle || 0x00 || tenant_id`.
    pub const USAGE: &str = "usage";

    /// Index: usage records by tenant, keyed by `tenant_id || 0x00 || cycle`.
    /// Value is empty (index only).
    pub const USAGE_BY_TENANT: &str = "usage_by_tenant";

    /// Bills, keyed by `cycle || 0x00 || tenant_id`.
    pub const BILLS: &str = "bills";

    /// Index: bills by tenant, keyed by `tenant_id || 0x00 || cycle`.
    /// Value is empty (index only).
    pub const BILLS_BY_TENANT: &str = "bills_by_tenant";

    /// Tier change audit trail, keyed by `tenant_id || 0x00 || change_id` (ULID).
    pub const TIER_CHANGES: &str = "tier_changes";

    /// Pending proration credits, keyed by `tenant_id`.
    pub const CREDITS: &str = "credits";

    /// Singleton documents (revenue snapshot, scheduler state).
    pub const META: &str = "meta";
}

/// Keys in the `meta` column family.
pub mod meta {
    /// Current revenue snapshot.
    pub const REVENUE: &[u8] = b"revenue";

    /// Billing scheduler state.
    pub const SCHEDULER: &[u8] = b"scheduler";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::USAGE,
        cf::USAGE_BY_TENANT,
        cf::BILLS,
        cf::BILLS_BY_TENANT,
        cf::TIER_CHANGES,
        cf::CREDITS,
        cf::META,
    ]
}
