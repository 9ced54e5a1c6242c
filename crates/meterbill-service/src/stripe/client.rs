//! Stripe API client implementing [`PaymentGateway`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use meterbill_core::Bill;

use super::types::{Customer, Invoice, InvoiceItem, PaymentIntent, StripeErrorResponse};
use crate::collab::{ChargeResult, GatewayError, PaymentGateway, Subscription};

/// Stripe error type for declined cards.
const CARD_ERROR: &str = "card_error";

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl StripeGateway {
    /// Stripe API base URL.
    pub const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    /// * `base_url` - API base URL; `None` uses [`StripeGateway::BASE_URL`]
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| Self::BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(params);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| GatewayError::Serialization(e.to_string()));
        }

        // Try to parse error response
        let error_body: Result<StripeErrorResponse, _> = response.json().await;

        match error_body {
            Ok(stripe_error) if stripe_error.error.error_type == CARD_ERROR => {
                Err(GatewayError::Declined(stripe_error.error.message))
            }
            Ok(stripe_error) => Err(GatewayError::Api {
                status: status.as_u16(),
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(GatewayError::Api {
                status: status.as_u16(),
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

/// Convert a major-unit amount to integer cents.
fn to_cents(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| GatewayError::Serialization(format!("amount out of range: {amount}")))
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, subscription: &Subscription) -> Result<String, GatewayError> {
        let mut params = vec![("metadata[tenant_id]", subscription.tenant_id.to_string())];
        if let Some(email) = &subscription.email {
            params.push(("email", email.clone()));
        }
        if let Some(name) = &subscription.name {
            params.push(("name", name.clone()));
        }

        let key = format!("customer:{}", subscription.tenant_id);
        let customer: Customer = self.post_form("/customers", &params, Some(&key)).await?;

        tracing::info!(
            tenant_id = %subscription.tenant_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(customer.id)
    }

    async fn create_invoice(
        &self,
        customer_ref: &str,
        bill: &Bill,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        let currency = bill.currency.to_ascii_lowercase();
        let description = format!("API usage {} ({} tier)", bill.billing_cycle, bill.tier);

        let invoice_params = [
            ("customer", customer_ref.to_string()),
            ("currency", currency.clone()),
            ("collection_method", "charge_automatically".to_string()),
            ("auto_advance", "false".to_string()),
            ("pending_invoice_items_behavior", "exclude".to_string()),
            ("description", description.clone()),
            ("metadata[tenant_id]", bill.tenant_id.to_string()),
            ("metadata[billing_cycle]", bill.billing_cycle.to_string()),
        ];
        let invoice: Invoice = self
            .post_form(
                "/invoices",
                &invoice_params,
                Some(&format!("{idempotency_key}:invoice")),
            )
            .await?;

        let item_params = [
            ("customer", customer_ref.to_string()),
            ("invoice", invoice.id.clone()),
            ("currency", currency),
            ("amount", to_cents(bill.total)?.to_string()),
            ("description", description),
        ];
        let item: InvoiceItem = self
            .post_form(
                "/invoiceitems",
                &item_params,
                Some(&format!("{idempotency_key}:item")),
            )
            .await?;

        tracing::debug!(
            tenant_id = %bill.tenant_id,
            invoice_id = %invoice.id,
            invoice_item_id = %item.id,
            amount_cents = item.amount,
            "Created Stripe invoice"
        );
        Ok(invoice.id)
    }

    async fn charge_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let paying = self
            .post_form(
                &format!("/invoices/{invoice_ref}/pay"),
                &[],
                Some(idempotency_key),
            )
            .await;
        let invoice: Invoice = match paying {
            Ok(invoice) => invoice,
            // Paying twice is refused; an earlier attempt may have gone through.
            Err(e @ GatewayError::Api { status: 400, .. }) => {
                let current: Invoice = self.get_json(&format!("/invoices/{invoice_ref}")).await?;
                if !(current.paid || current.status.as_deref() == Some("paid")) {
                    return Err(e);
                }
                current
            }
            Err(e) => return Err(e),
        };

        if invoice.paid || invoice.status.as_deref() == Some("paid") {
            let paid_at = invoice.status_transitions.paid_at.and_then(from_unix);
            Ok(ChargeResult::succeeded(invoice.id, paid_at))
        } else {
            let status = invoice.status.unwrap_or_else(|| "unknown".into());
            Ok(ChargeResult::failed(
                invoice.id,
                format!("invoice not paid (status {status})"),
            ))
        }
    }

    async fn charge_immediate(
        &self,
        customer_ref: &str,
        amount: Decimal,
        currency: &str,
        description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let params = [
            ("customer", customer_ref.to_string()),
            ("amount", to_cents(amount)?.to_string()),
            ("currency", currency.to_ascii_lowercase()),
            ("description", description.to_string()),
            ("confirm", "true".to_string()),
            ("off_session", "true".to_string()),
        ];
        let intent: PaymentIntent = self
            .post_form("/payment_intents", &params, Some(idempotency_key))
            .await?;

        if intent.status == "succeeded" {
            Ok(ChargeResult::succeeded(intent.id, from_unix(intent.created)))
        } else {
            let message = intent
                .last_payment_error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("payment intent {}", intent.status));
            Ok(ChargeResult::failed(intent.id, message))
        }
    }
}
