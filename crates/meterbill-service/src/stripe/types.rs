//! Stripe API types.

use serde::Deserialize;

/// Stripe customer object.
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    /// Stripe customer ID.
    pub id: String,
    /// Customer email.
    #[serde(default)]
    pub email: Option<String>,
    /// Metadata attached to the customer.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Stripe invoice item object.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceItem {
    /// Invoice item ID.
    pub id: String,
    /// Amount in cents.
    #[serde(default)]
    pub amount: i64,
    /// Invoice the item is attached to.
    #[serde(default)]
    pub invoice: Option<String>,
}

/// Timestamps of invoice status changes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusTransitions {
    /// When the invoice was paid (Unix).
    #[serde(default)]
    pub paid_at: Option<i64>,
}

/// Stripe invoice object.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    /// Invoice ID.
    pub id: String,
    /// Status (draft, open, paid, uncollectible, void).
    #[serde(default)]
    pub status: Option<String>,
    /// Whether the invoice has been paid.
    #[serde(default)]
    pub paid: bool,
    /// Amount due in cents.
    #[serde(default)]
    pub amount_due: i64,
    /// Status change timestamps.
    #[serde(default)]
    pub status_transitions: StatusTransitions,
}

/// Error attached to a failed payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    /// Error message.
    #[serde(default)]
    pub message: Option<String>,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
}

/// Stripe `PaymentIntent` object.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID.
    pub id: String,
    /// Amount in cents.
    #[serde(default)]
    pub amount: i64,
    /// Status (succeeded, processing, `requires_payment_method`, ...).
    #[serde(default)]
    pub status: String,
    /// Created timestamp (Unix).
    #[serde(default)]
    pub created: i64,
    /// Error from the last payment attempt.
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// Stripe error response.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorResponse {
    /// Error details.
    pub error: StripeErrorDetail,
}

/// Stripe error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetail {
    /// Error type (`card_error`, `invalid_request_error`, `api_error`, ...).
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
}
