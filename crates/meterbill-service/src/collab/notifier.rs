//! Notification channel for alerts and invoices.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use meterbill_core::{AlertEvent, Bill};

/// Errors returned by a notifier.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The receiver rejected the notification.
    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// Delivers alerts and invoice notices to tenants.
///
/// Called off the hot path; slow implementations delay only other
/// notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a usage alert.
    async fn notify_alert(&self, alert: &AlertEvent) -> Result<(), NotifyError>;

    /// Deliver a paid-invoice notice.
    async fn notify_invoice(&self, bill: &Bill) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_alert(&self, alert: &AlertEvent) -> Result<(), NotifyError> {
        tracing::info!(
            tenant_id = %alert.tenant_id,
            kind = ?alert.kind,
            threshold = alert.threshold.percent(),
            current_usage = alert.current_usage,
            included_calls = alert.included_calls,
            estimated_overage = %alert.estimated_overage,
            "Usage alert"
        );
        Ok(())
    }

    async fn notify_invoice(&self, bill: &Bill) -> Result<(), NotifyError> {
        tracing::info!(
            tenant_id = %bill.tenant_id,
            cycle = %bill.billing_cycle,
            total = %bill.total,
            currency = %bill.currency,
            "Invoice paid"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Alert(&'a AlertEvent),
    InvoicePaid(&'a Bill),
}

/// POSTs notifications as JSON to a webhook URL.
///
/// Body: `{"event": "alert" | "invoice_paid", "data": {...}}`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(status.as_u16()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_alert(&self, alert: &AlertEvent) -> Result<(), NotifyError> {
        self.post(&WebhookPayload::Alert(alert)).await
    }

    async fn notify_invoice(&self, bill: &Bill) -> Result<(), NotifyError> {
        self.post(&WebhookPayload::InvoicePaid(bill)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meterbill_core::{check_thresholds, BillingCycle, TenantId, Tier, UsageRecord};
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> AlertEvent {
        let now = Utc::now();
        let mut record =
            UsageRecord::empty(TenantId::new("acme").unwrap(), BillingCycle::from_datetime(now), now);
        record.weighted_calls = 85;
        let tier = Tier::new("t", dec!(0), 100, dec!(0.1));
        check_thresholds(&mut record, &tier, now).remove(0)
    }

    #[tokio::test]
    async fn webhook_posts_alert_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/billing"))
            .and(body_partial_json(serde_json::json!({
                "event": "alert",
                "data": {"tenant_id": "acme", "type": "usage_threshold", "threshold": 80}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hooks/billing", server.uri())).unwrap();
        notifier.notify_alert(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        assert!(matches!(
            notifier.notify_alert(&alert()).await,
            Err(NotifyError::Rejected(500))
        ));
    }
}
