//! Payment gateway abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterbill_core::Bill;

use super::Subscription;

/// Error type for payment gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway returned an error.
    #[error("gateway API error ({status}): {error_type} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },

    /// The charge was declined.
    #[error("payment declined: {0}")]
    Declined(String),

    /// The call did not complete in time.
    #[error("payment gateway timed out")]
    Timeout,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Returns true if this error is transient and should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Declined(_) | Self::Serialization(_) | Self::Configuration(_) => false,
        }
    }
}

/// Outcome of a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// Funds captured.
    Succeeded,
    /// The gateway refused the charge.
    Failed,
}

/// Result of charging an invoice or an amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeResult {
    /// Gateway reference of the charged object.
    pub reference: String,
    /// Charge outcome.
    pub status: ChargeStatus,
    /// When the gateway recorded the payment.
    pub paid_at: Option<DateTime<Utc>>,
    /// Gateway message for failed charges.
    pub failure_message: Option<String>,
}

impl ChargeResult {
    /// A successful charge.
    #[must_use]
    pub fn succeeded(reference: impl Into<String>, paid_at: Option<DateTime<Utc>>) -> Self {
        Self {
            reference: reference.into(),
            status: ChargeStatus::Succeeded,
            paid_at,
            failure_message: None,
        }
    }

    /// A refused charge.
    #[must_use]
    pub fn failed(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            status: ChargeStatus::Failed,
            paid_at: None,
            failure_message: Some(message.into()),
        }
    }
}

/// Payment gateway used to settle bills and proration charges.
///
/// Every mutating call carries an idempotency key; repeating a call with the
/// same key must not create a second invoice or charge.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Register the tenant as a customer. Returns the customer reference.
    async fn create_customer(&self, subscription: &Subscription) -> Result<String, GatewayError>;

    /// Create an invoice for a bill. Returns the invoice reference.
    async fn create_invoice(
        &self,
        customer_ref: &str,
        bill: &Bill,
        idempotency_key: &str,
    ) -> Result<String, GatewayError>;

    /// Collect payment for an invoice.
    ///
    /// `idempotency_key` is unique per attempt and starts with the bill's
    /// `tenant:cycle` key.
    async fn charge_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError>;

    /// Charge an amount immediately, outside any invoice.
    async fn charge_immediate(
        &self,
        customer_ref: &str,
        amount: Decimal,
        currency: &str,
        description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError>;
}

/// Gateway used when no payment provider is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGateway;

impl DisabledGateway {
    fn error() -> GatewayError {
        GatewayError::Configuration("payment gateway not configured".into())
    }
}

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_customer(&self, _subscription: &Subscription) -> Result<String, GatewayError> {
        Err(Self::error())
    }

    async fn create_invoice(
        &self,
        _customer_ref: &str,
        _bill: &Bill,
        _idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        Err(Self::error())
    }

    async fn charge_invoice(
        &self,
        _invoice_ref: &str,
        _idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        Err(Self::error())
    }

    async fn charge_immediate(
        &self,
        _customer_ref: &str,
        _amount: Decimal,
        _currency: &str,
        _description: &str,
        _idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        Err(Self::error())
    }
}
