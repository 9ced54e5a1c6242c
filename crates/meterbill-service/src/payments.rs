//! Payment settlement with bounded timeouts and retries.
//!
//! Every gateway call is wrapped in a per-attempt timeout. Transient failures
//! (network errors, timeouts, 5xx/429 answers) are retried with jittered
//! exponential backoff; permanent ones (declines, bad requests) fail at once.
//! Customer, invoice and proration calls reuse one idempotency key across
//! retries so the gateway never creates or charges twice. Paying an invoice
//! uses a fresh key per attempt: the invoice itself can only be paid once, and
//! a reused key would replay the gateway's cached answer to the first attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use meterbill_core::{Bill, TierChangeEvent};
use meterbill_store::{Store, StoreError};

use crate::collab::{
    ChargeResult, ChargeStatus, DirectoryError, GatewayError, PaymentGateway, Subscription,
    SubscriptionDirectory,
};

/// Timeout and backoff applied to gateway calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Base backoff delay; attempt `n` waits about `base * 2^n`.
    pub base_delay_ms: u64,
    /// Longest wait between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay_ms: 250,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Errors from settling a payment.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The gateway call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The customer reference could not be saved.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The invoice reference could not be saved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The gateway answered but refused the charge.
    #[error("charge failed: {0}")]
    Refused(String),
}

/// Run a gateway call under the retry policy.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// permanent error.
pub async fn call_gateway<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    idempotency_key: &str,
    call: F,
) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(policy.base_delay_ms.max(1) / 2 + 1)
        .max_delay(policy.max_delay)
        .take(policy.max_retries)
        .map(jitter);

    Retry::start(strategy, || async {
        let result = match tokio::time::timeout(policy.attempt_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_transient() => {
                tracing::debug!(
                    operation,
                    idempotency_key,
                    error = %e,
                    "Transient gateway error - will retry"
                );
                Err(result)
            }
            Err(e) => {
                tracing::debug!(
                    operation,
                    idempotency_key,
                    error = %e,
                    "Permanent gateway error - will not retry"
                );
                Ok(result)
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

/// Settles bills and proration charges through the payment gateway.
pub struct PaymentProcessor {
    gateway: Arc<dyn PaymentGateway>,
    directory: Arc<dyn SubscriptionDirectory>,
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    currency: String,
}

impl PaymentProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn SubscriptionDirectory>,
        store: Arc<dyn Store>,
        policy: RetryPolicy,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            directory,
            store,
            policy,
            currency: currency.into(),
        }
    }

    /// The tenant's gateway customer reference, registering the tenant first
    /// if it has none.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails or the reference cannot be saved.
    pub async fn ensure_customer(&self, subscription: &Subscription) -> Result<String, PaymentError> {
        if let Some(customer_ref) = &subscription.customer_ref {
            return Ok(customer_ref.clone());
        }

        let key = format!("customer:{}", subscription.tenant_id);
        let customer_ref = call_gateway(&self.policy, "create_customer", &key, || {
            self.gateway.create_customer(subscription)
        })
        .await?;

        self.directory
            .set_customer_ref(&subscription.tenant_id, &customer_ref)
            .await?;
        Ok(customer_ref)
    }

    /// Invoice and collect a bill.
    ///
    /// The invoice reference is persisted on the bill before charging, so a
    /// resumed run charges the same invoice instead of creating another.
    ///
    /// # Errors
    ///
    /// Returns an error if any gateway step fails or the charge is refused.
    pub async fn settle_bill(
        &self,
        subscription: &Subscription,
        bill: &mut Bill,
    ) -> Result<ChargeResult, PaymentError> {
        let key = bill.idempotency_key();
        let customer_ref = self.ensure_customer(subscription).await?;

        let invoice_ref = if let Some(existing) = bill.external_invoice_ref.clone() {
            existing
        } else {
            let snapshot: &Bill = bill;
            let created = call_gateway(&self.policy, "create_invoice", &key, || {
                self.gateway.create_invoice(&customer_ref, snapshot, &key)
            })
            .await?;
            bill.set_invoice_ref(created.clone());
            self.store.put_bill(bill)?;
            created
        };

        let settlement = bill.payment_attempts;
        let attempt = AtomicU32::new(0);
        let result = call_gateway(&self.policy, "charge_invoice", &key, || {
            let n = attempt.fetch_add(1, Ordering::Relaxed);
            let pay_key = format!("{key}:pay:{settlement}:{n}");
            let gateway = &self.gateway;
            let invoice_ref = &invoice_ref;
            async move { gateway.charge_invoice(invoice_ref, &pay_key).await }
        })
        .await?;

        match result.status {
            ChargeStatus::Succeeded => Ok(result),
            ChargeStatus::Failed => Err(PaymentError::Refused(
                result
                    .failure_message
                    .unwrap_or_else(|| "charge failed".to_string()),
            )),
        }
    }

    /// Charge the positive proration of a tier change immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the charge fails or is refused.
    pub async fn charge_proration(
        &self,
        subscription: &Subscription,
        event: &TierChangeEvent,
    ) -> Result<ChargeResult, PaymentError> {
        let customer_ref = self.ensure_customer(subscription).await?;
        let key = event.id.to_string();
        let description = format!(
            "Proration {} → {} ({})",
            event.from_tier,
            event.to_tier,
            event.cycle()
        );

        let result = call_gateway(&self.policy, "charge_immediate", &key, || {
            self.gateway.charge_immediate(
                &customer_ref,
                event.proration_amount,
                &self.currency,
                &description,
                &key,
            )
        })
        .await?;

        match result.status {
            ChargeStatus::Succeeded => Ok(result),
            ChargeStatus::Failed => Err(PaymentError::Refused(
                result
                    .failure_message
                    .unwrap_or_else(|| "charge failed".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(50),
            max_retries,
            base_delay_ms: 1,
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = call_gateway(&fast_policy(3), "test", "k", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Timeout)
            } else {
                Ok("in_1")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "in_1");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = call_gateway(&fast_policy(3), "test", "k", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Declined("card_declined".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Declined(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = call_gateway(&fast_policy(2), "test", "k", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Timeout)
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let result: Result<(), _> = call_gateway(&fast_policy(0), "test", "k", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }
}
