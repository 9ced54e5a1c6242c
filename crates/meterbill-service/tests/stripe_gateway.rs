//! Stripe gateway tests against a mock Stripe API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use meterbill_core::{calculate_bill, Bill, BillingCycle, TenantId, TierCatalog, UsageRecord};
use meterbill_service::collab::{
    ChargeStatus, GatewayError, InMemoryDirectory, PaymentGateway, Subscription,
    SubscriptionDirectory,
};
use meterbill_service::{PaymentError, PaymentProcessor, RetryPolicy, StripeGateway};
use meterbill_store::MemoryStore;

fn acme() -> TenantId {
    TenantId::new("acme").unwrap()
}

/// Pro bill for June 2024 with 500 overage calls: 324.00.
fn june_bill() -> Bill {
    let cycle = BillingCycle::new(2024, 6).unwrap();
    let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
    let mut record = UsageRecord::empty(acme(), cycle, now);
    record.weighted_calls = 10_500;
    let catalog = TierCatalog::default();
    calculate_bill(&record, catalog.get("pro").unwrap(), &[], now, "USD")
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        attempt_timeout: Duration::from_secs(5),
        max_retries: 2,
        base_delay_ms: 1,
        max_delay: Duration::from_millis(5),
    }
}

fn stripe_processor(
    server: &MockServer,
    subscription: Subscription,
) -> (PaymentProcessor, Arc<InMemoryDirectory>) {
    let gateway = StripeGateway::new("sk_test_123", Some(server.uri())).unwrap();
    let directory = Arc::new(InMemoryDirectory::with_subscriptions([subscription]));
    let processor = PaymentProcessor::new(
        Arc::new(gateway),
        directory.clone(),
        Arc::new(MemoryStore::new()),
        fast_policy(),
        "USD",
    );
    (processor, directory)
}

fn card_declined() -> ResponseTemplate {
    ResponseTemplate::new(402).set_body_json(json!({
        "error": {
            "type": "card_error",
            "code": "card_declined",
            "message": "Your card was declined."
        }
    }))
}

#[tokio::test]
async fn bill_is_invoiced_and_paid() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/customers"))
        .and(header("Idempotency-Key", "customer:acme"))
        .and(body_string_contains("metadata%5Btenant_id%5D=acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/invoices"))
        .and(header("Idempotency-Key", "acme:2024-06:invoice"))
        .and(body_string_contains("customer=cus_1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "in_1", "status": "draft"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/invoiceitems"))
        .and(header("Idempotency-Key", "acme:2024-06:item"))
        .and(body_string_contains("amount=32400"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "ii_1", "amount": 32400})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/invoices/in_1/pay"))
        .and(header("Idempotency-Key", "acme:2024-06:pay:0:0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "in_1",
            "status": "paid",
            "paid": true,
            "amount_due": 32400,
            "status_transitions": {"paid_at": 1_719_792_000}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (processor, directory) = stripe_processor(&server, Subscription::new(acme(), "pro"));
    let subscription = directory.get(&acme()).await.unwrap().unwrap();
    let mut bill = june_bill();

    let charge = processor.settle_bill(&subscription, &mut bill).await.unwrap();

    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(
        charge.paid_at,
        Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap())
    );
    assert_eq!(bill.external_invoice_ref.as_deref(), Some("in_1"));
    let saved = directory.get(&acme()).await.unwrap().unwrap();
    assert_eq!(saved.customer_ref.as_deref(), Some("cus_1"));
}

#[tokio::test]
async fn declined_card_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoices/in_7/pay"))
        .respond_with(card_declined())
        .expect(1)
        .mount(&server)
        .await;

    let mut subscription = Subscription::new(acme(), "pro");
    subscription.customer_ref = Some("cus_1".into());
    let (processor, _) = stripe_processor(&server, subscription.clone());
    let mut bill = june_bill();
    bill.set_invoice_ref("in_7");

    let result = processor.settle_bill(&subscription, &mut bill).await;

    assert!(matches!(
        result,
        Err(PaymentError::Gateway(GatewayError::Declined(message))) if message.contains("declined")
    ));
}

#[tokio::test]
async fn server_errors_are_retried_with_fresh_keys() {
    let server = MockServer::start().await;
    for key in ["acme:2024-06:pay:0:0", "acme:2024-06:pay:0:1"] {
        Mock::given(method("POST"))
            .and(path("/invoices/in_8/pay"))
            .and(header("Idempotency-Key", key))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/invoices/in_8/pay"))
        .and(header("Idempotency-Key", "acme:2024-06:pay:0:2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_8", "paid": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut subscription = Subscription::new(acme(), "pro");
    subscription.customer_ref = Some("cus_1".into());
    let (processor, _) = stripe_processor(&server, subscription.clone());
    let mut bill = june_bill();
    bill.set_invoice_ref("in_8");

    let charge = processor.settle_bill(&subscription, &mut bill).await.unwrap();
    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(charge.reference, "in_8");
}

#[tokio::test]
async fn later_settlement_does_not_replay_earlier_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoices/in_5/pay"))
        .and(header("Idempotency-Key", "acme:2024-06:pay:1:0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_5", "paid": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut subscription = Subscription::new(acme(), "pro");
    subscription.customer_ref = Some("cus_1".into());
    let (processor, _) = stripe_processor(&server, subscription.clone());
    let mut bill = june_bill();
    bill.set_invoice_ref("in_5");
    bill.mark_failed("card declined").unwrap();

    let charge = processor.settle_bill(&subscription, &mut bill).await.unwrap();
    assert_eq!(charge.status, ChargeStatus::Succeeded);
}

#[tokio::test]
async fn invoice_paid_by_an_earlier_attempt_counts_as_paid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoices/in_6/pay"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "Invoice is already paid"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/invoices/in_6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "in_6",
            "status": "paid",
            "paid": true,
            "status_transitions": {"paid_at": 1_719_792_000}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = StripeGateway::new("sk_test_123", Some(server.uri())).unwrap();
    let charge = gateway
        .charge_invoice("in_6", "acme:2024-06:pay:1:0")
        .await
        .unwrap();

    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(
        charge.paid_at,
        Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn unpaid_invoice_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoices/in_9/pay"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "in_9", "status": "open"})),
        )
        .mount(&server)
        .await;

    let mut subscription = Subscription::new(acme(), "pro");
    subscription.customer_ref = Some("cus_1".into());
    let (processor, _) = stripe_processor(&server, subscription.clone());
    let mut bill = june_bill();
    bill.set_invoice_ref("in_9");

    let result = processor.settle_bill(&subscription, &mut bill).await;
    assert!(matches!(result, Err(PaymentError::Refused(message)) if message.contains("open")));
}

#[tokio::test]
async fn immediate_charge_reports_payment_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .and(header("Idempotency-Key", "tc_1"))
        .and(body_string_contains("amount=12500"))
        .and(body_string_contains("off_session=true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_1",
            "amount": 12500,
            "status": "requires_payment_method",
            "created": 1_718_528_400,
            "last_payment_error": {"message": "Insufficient funds", "code": "card_declined"}
        })))
        .mount(&server)
        .await;

    let gateway = StripeGateway::new("sk_test_123", Some(server.uri())).unwrap();
    let result = gateway
        .charge_immediate("cus_1", dec!(125.00), "USD", "Proration pro → enterprise", "tc_1")
        .await
        .unwrap();

    assert_eq!(result.status, ChargeStatus::Failed);
    assert_eq!(result.reference, "pi_1");
    assert_eq!(result.failure_message.as_deref(), Some("Insufficient funds"));
}

#[tokio::test]
async fn api_errors_carry_status_and_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/customers"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "Invalid email"}
        })))
        .mount(&server)
        .await;

    let gateway = StripeGateway::new("sk_test_123", Some(server.uri())).unwrap();
    let err = gateway
        .create_customer(&Subscription::new(acme(), "pro"))
        .await
        .unwrap_err();

    assert!(matches!(
        &err,
        GatewayError::Api { status: 400, error_type, .. } if error_type == "invalid_request_error"
    ));
    assert!(!err.is_transient());
}
