//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{analytics, billing, events, health, tenants, usage};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for event ingest endpoints.
const EVENTS_MAX_CONCURRENT_REQUESTS: usize = 200;

/// Maximum concurrent requests for query and admin endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Events (Service API Key auth)
/// - `POST /v1/events` - Report one call
/// - `POST /v1/events/batch` - Report several calls
///
/// ## Tenants (Service API Key auth)
/// - `GET /v1/tenants/:tenant/usage/:cycle` - Usage record
/// - `GET /v1/tenants/:tenant/bills/:cycle` - Bill
/// - `GET /v1/tenants/:tenant/export?format=json|csv` - Usage export
/// - `POST /v1/tenants/:tenant/tier` - Change tier
/// - `GET /v1/tenants/:tenant/tier-history` - Tier changes
/// - `POST /v1/usage/import` - Import a JSON usage export
///
/// ## Analytics (Service API Key auth)
/// - `GET /v1/analytics/revenue` - Revenue snapshot
/// - `GET /v1/analytics/segmentation` - Tenant segmentation
///
/// ## Billing (Service API Key auth)
/// - `GET /v1/billing/last-run` - Last run summary
/// - `POST /v1/billing/runs/:cycle` - Bill a cycle now
/// - `POST /v1/billing/retry/:tenant/:cycle` - Retry an unpaid bill
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    // Build CORS layer
    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Ingest is high volume and gets its own, larger limit.
    let event_routes = Router::new()
        .route("/", post(events::report_call))
        .route("/batch", post(events::report_calls))
        .layer(ConcurrencyLimitLayer::new(EVENTS_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Tenants
        .route("/tenants/:tenant/usage/:cycle", get(usage::get_usage))
        .route("/tenants/:tenant/export", get(usage::export_usage))
        .route("/tenants/:tenant/bills/:cycle", get(tenants::get_bill))
        .route("/tenants/:tenant/tier", post(tenants::change_tier))
        .route("/tenants/:tenant/tier-history", get(tenants::tier_history))
        .route("/usage/import", post(usage::import_usage))
        // Analytics
        .route("/analytics/revenue", get(analytics::revenue))
        .route("/analytics/segmentation", get(analytics::segmentation))
        // Billing
        .route("/billing/last-run", get(billing::last_run))
        .route("/billing/runs/:cycle", post(billing::run_cycle))
        .route("/billing/retry/:tenant/:cycle", post(billing::retry_bill))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        // Events (with their own concurrency limit)
        .nest("/events", event_routes);

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes
        .nest("/v1", api_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
