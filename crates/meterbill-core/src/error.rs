//! Error types for meterbill.

use crate::ids::IdError;

/// Result type for meterbill core operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in core billing operations.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Tier name is not present in the catalog.
    #[error("tier not found: {name}")]
    TierNotFound {
        /// The tier name that was not found.
        name: String,
    },

    /// Requested tier change is not allowed.
    #[error("invalid tier change from {from} to {to}")]
    InvalidTierChange {
        /// The current tier.
        from: String,
        /// The requested tier.
        to: String,
    },

    /// Endpoint rule rejected by the registry.
    #[error("invalid endpoint rule {prefix:?}: {reason}")]
    InvalidEndpointRule {
        /// The offending path prefix.
        prefix: String,
        /// Why the rule was rejected.
        reason: String,
    },

    /// Bill status transition is not allowed.
    #[error("invalid bill transition from {from:?} to {to:?}")]
    InvalidBillTransition {
        /// The current status.
        from: crate::BillStatus,
        /// The requested status.
        to: crate::BillStatus,
    },

    /// Billing cycle string could not be parsed.
    #[error("invalid billing cycle: {0}")]
    InvalidCycle(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Export/import format not supported for the operation.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}
