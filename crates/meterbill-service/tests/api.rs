//! HTTP API integration tests.

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use common::{at, call, eventually, tenant, TestHarness};
use meterbill_core::BillingCycle;
use meterbill_service::collab::Subscription;

fn authed(harness: &TestHarness, request: TestRequest) -> TestRequest {
    request.add_header(
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_str(&harness.service_api_key).unwrap(),
    )
}

fn money(value: &serde_json::Value) -> Decimal {
    value.as_str().unwrap().parse().unwrap()
}

async fn pro_tenant() -> TestHarness {
    TestHarness::with_subscriptions(
        at(2024, 6, 16, 9),
        vec![Subscription::new(tenant("acme"), "pro")],
    )
    .await
}

// ============================================================================
// Health and auth
// ============================================================================

#[tokio::test]
async fn health_needs_no_key() {
    let harness = TestHarness::new(at(2024, 6, 1, 0)).await;

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "meterbill");
}

#[tokio::test]
async fn v1_routes_require_the_service_key() {
    let harness = TestHarness::new(at(2024, 6, 1, 0)).await;

    harness
        .server
        .get("/v1/analytics/revenue")
        .await
        .assert_status_unauthorized();

    let response = harness
        .server
        .get("/v1/analytics/revenue")
        .add_header(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static("wrong-key"),
        )
        .await;
    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "unauthorized");
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn reported_call_shows_up_in_usage() {
    let harness = TestHarness::new(at(2024, 6, 10, 0)).await;

    let response = authed(&harness, harness.server.post("/v1/events"))
        .json(&json!({
            "tenant_id": "acme",
            "path": "/api/v1/analytics/daily",
            "response_time_ms": 120,
            "status_code": 200,
            "bytes_transferred": 2048
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);

    let cycle = BillingCycle::new(2024, 6).unwrap();
    assert!(
        eventually(|| harness
            .engine
            .get_usage(&tenant("acme"), cycle)
            .unwrap()
            .is_some())
        .await
    );

    let response = authed(&harness, harness.server.get("/v1/tenants/acme/usage/2024-06")).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["total_calls"], 1);
    assert_eq!(body["weighted_calls"], 5);
    assert_eq!(body["endpoint_breakdown"]["analytics"]["calls"], 1);
}

#[tokio::test]
async fn batch_is_rejected_whole_on_a_bad_tenant() {
    let harness = TestHarness::new(at(2024, 6, 10, 0)).await;

    let response = authed(&harness, harness.server.post("/v1/events/batch"))
        .json(&json!({
            "events": [
                {"tenant_id": "acme", "path": "/api/v1/users", "status_code": 200},
                {"tenant_id": "not a tenant", "path": "/api/v1/users", "status_code": 200}
            ]
        }))
        .await;

    response.assert_status_bad_request();
}

#[tokio::test]
async fn batch_reports_accepted_events() {
    let harness = TestHarness::new(at(2024, 6, 10, 0)).await;

    let response = authed(&harness, harness.server.post("/v1/events/batch"))
        .json(&json!({
            "events": [
                {"tenant_id": "acme", "path": "/api/v1/users", "status_code": 200},
                {"tenant_id": "acme", "path": "/api/v1/users", "status_code": 500},
                {"tenant_id": "globex", "path": "/other", "status_code": 404}
            ]
        }))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["accepted"], 3);
    assert_eq!(body["dropped"], 0);
}

// ============================================================================
// Usage
// ============================================================================

#[tokio::test]
async fn usage_lookups_validate_the_path() {
    let harness = TestHarness::new(at(2024, 6, 10, 0)).await;

    authed(&harness, harness.server.get("/v1/tenants/acme/usage/2024-06"))
        .await
        .assert_status_not_found();
    authed(&harness, harness.server.get("/v1/tenants/acme/usage/2024-13"))
        .await
        .assert_status_bad_request();
    authed(&harness, harness.server.get("/v1/tenants/acme/usage/june"))
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn export_and_import_over_http() {
    let harness = TestHarness::new(at(2024, 6, 10, 0)).await;
    harness
        .engine
        .record_call(&call(&tenant("acme"), "/api/v1/users"))
        .unwrap();

    let csv = authed(&harness, harness.server.get("/v1/tenants/acme/export?format=csv")).await;
    csv.assert_status_ok();
    assert_eq!(csv.header("content-type"), "text/csv");
    assert!(csv.text().starts_with("tenant_id,"));

    authed(&harness, harness.server.get("/v1/tenants/acme/export?format=xml"))
        .await
        .assert_status_bad_request();

    let exported = authed(&harness, harness.server.get("/v1/tenants/acme/export")).await;
    exported.assert_status_ok();
    assert_eq!(exported.header("content-type"), "application/json");

    let other = TestHarness::new(at(2024, 6, 10, 0)).await;
    let response = authed(&other, other.server.post("/v1/usage/import"))
        .text(exported.text())
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["imported"], 1);
}

// ============================================================================
// Tiers
// ============================================================================

#[tokio::test]
async fn tier_change_over_http() {
    let harness = pro_tenant().await;

    let response = authed(&harness, harness.server.post("/v1/tenants/acme/tier"))
        .json(&json!({"tier": "starter"}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["from_tier"], "pro");
    assert_eq!(body["to_tier"], "starter");
    assert_eq!(money(&body["proration_amount"]), dec!(-125));

    let history = authed(&harness, harness.server.get("/v1/tenants/acme/tier-history")).await;
    history.assert_status_ok();
    let body: serde_json::Value = history.json();
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_tier_changes_map_to_client_errors() {
    let harness = pro_tenant().await;

    authed(&harness, harness.server.post("/v1/tenants/acme/tier"))
        .json(&json!({"tier": "pro"}))
        .await
        .assert_status(StatusCode::CONFLICT);
    authed(&harness, harness.server.post("/v1/tenants/acme/tier"))
        .json(&json!({"tier": "platinum"}))
        .await
        .assert_status_not_found();
    authed(&harness, harness.server.post("/v1/tenants/ghost/tier"))
        .json(&json!({"tier": "starter"}))
        .await
        .assert_status_not_found();
}

// ============================================================================
// Billing and analytics
// ============================================================================

#[tokio::test]
async fn manual_run_then_query_results() {
    let harness = pro_tenant().await;

    authed(&harness, harness.server.get("/v1/billing/last-run"))
        .await
        .assert_status_not_found();

    harness.clock.set(at(2024, 7, 1, 0));
    let run = authed(&harness, harness.server.post("/v1/billing/runs/2024-06")).await;
    run.assert_status_ok();
    let summary: serde_json::Value = run.json();
    assert_eq!(summary["paid_count"], 1);
    assert_eq!(summary["failed_count"], 0);

    let last = authed(&harness, harness.server.get("/v1/billing/last-run")).await;
    last.assert_status_ok();
    let body: serde_json::Value = last.json();
    assert_eq!(body["run_id"], summary["run_id"]);

    let bill = authed(&harness, harness.server.get("/v1/tenants/acme/bills/2024-06")).await;
    bill.assert_status_ok();
    let body: serde_json::Value = bill.json();
    assert_eq!(body["status"], "paid");
    assert_eq!(money(&body["total"]), dec!(299));

    let revenue = authed(&harness, harness.server.get("/v1/analytics/revenue")).await;
    revenue.assert_status_ok();
    let body: serde_json::Value = revenue.json();
    assert_eq!(money(&body["mrr"]), dec!(299));

    let segments = authed(&harness, harness.server.get("/v1/analytics/segmentation")).await;
    segments.assert_status_ok();
}

#[tokio::test]
async fn open_cycle_cannot_be_billed() {
    let harness = pro_tenant().await;

    authed(&harness, harness.server.post("/v1/billing/runs/2024-06"))
        .await
        .assert_status_bad_request();
    authed(&harness, harness.server.post("/v1/billing/runs/2024-09"))
        .await
        .assert_status_bad_request();
    authed(&harness, harness.server.get("/v1/tenants/acme/bills/2024-06"))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn retrying_a_missing_bill_is_not_found() {
    let harness = pro_tenant().await;

    authed(&harness, harness.server.post("/v1/billing/retry/acme/2024-06"))
        .await
        .assert_status_not_found();
}
