//! Common test utilities for meterbill integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use meterbill_core::{AlertEvent, Bill, CallEvent, EndpointClassifier, TenantId, TierCatalog};
use meterbill_service::collab::{
    ChargeResult, GatewayError, InMemoryDirectory, ManualClock, NoDiscounts, NotifyError,
    Notifier, PaymentGateway, Subscription,
};
use meterbill_service::{
    create_router, AppState, Collaborators, EngineSettings, MeteringEngine, RetryPolicy,
    ServiceConfig,
};
use meterbill_store::MemoryStore;

// ============================================================================
// Mock gateway
// ============================================================================

/// Payment gateway double.
///
/// Invoices are keyed by idempotency key, so repeating a request returns the
/// same invoice. Tenants in `declined` have their charges refused.
#[derive(Default)]
pub struct MockGateway {
    declined: Mutex<HashSet<TenantId>>,
    customers: Mutex<Vec<TenantId>>,
    invoices: Mutex<HashMap<String, String>>,
    charges: Mutex<HashMap<String, usize>>,
    immediate: Mutex<Vec<(String, Decimal)>>,
}

impl MockGateway {
    /// Refuse every charge for `tenant`.
    pub fn decline(&self, tenant: &TenantId) {
        self.declined.lock().insert(tenant.clone());
    }

    /// Accept charges for every tenant again.
    pub fn accept_all(&self) {
        self.declined.lock().clear();
    }

    /// Customers registered, in order.
    pub fn customer_count(&self) -> usize {
        self.customers.lock().len()
    }

    /// Distinct invoices created.
    pub fn invoice_count(&self) -> usize {
        self.invoices.lock().len()
    }

    /// Successful charges for a bill, by its `tenant:cycle` key.
    pub fn successful_charges(&self, key: &str) -> usize {
        self.charges.lock().get(key).copied().unwrap_or(0)
    }

    /// Immediate charges as `(customer_ref, amount)`.
    pub fn immediate_charges(&self) -> Vec<(String, Decimal)> {
        self.immediate.lock().clone()
    }

    fn is_declined(&self, tenant: &str) -> bool {
        self.declined
            .lock()
            .iter()
            .any(|declined| declined.as_str() == tenant)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_customer(&self, subscription: &Subscription) -> Result<String, GatewayError> {
        self.customers.lock().push(subscription.tenant_id.clone());
        Ok(format!("cus_{}", subscription.tenant_id))
    }

    async fn create_invoice(
        &self,
        _customer_ref: &str,
        _bill: &Bill,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        let mut invoices = self.invoices.lock();
        let next = invoices.len();
        Ok(invoices
            .entry(idempotency_key.to_string())
            .or_insert_with(|| format!("in_{next}"))
            .clone())
    }

    async fn charge_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let bill_key: Vec<&str> = idempotency_key.splitn(3, ':').take(2).collect();
        if self.is_declined(bill_key[0]) {
            return Ok(ChargeResult::failed(invoice_ref, "card declined"));
        }
        *self.charges.lock().entry(bill_key.join(":")).or_default() += 1;
        Ok(ChargeResult::succeeded(invoice_ref, None))
    }

    async fn charge_immediate(
        &self,
        customer_ref: &str,
        amount: Decimal,
        _currency: &str,
        _description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let tenant = customer_ref.trim_start_matches("cus_");
        if self.is_declined(tenant) {
            return Err(GatewayError::Declined("card declined".into()));
        }
        self.immediate
            .lock()
            .push((customer_ref.to_string(), amount));
        Ok(ChargeResult::succeeded(format!("pi_{idempotency_key}"), None))
    }
}

// ============================================================================
// Recording notifier
// ============================================================================

/// Notifier that keeps everything it is sent.
#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<AlertEvent>>,
    pub invoices: Mutex<Vec<Bill>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_alert(&self, alert: &AlertEvent) -> Result<(), NotifyError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    async fn notify_invoice(&self, bill: &Bill) -> Result<(), NotifyError> {
        self.invoices.lock().push(bill.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The engine behind the server.
    pub engine: Arc<MeteringEngine>,
    /// Backing store.
    pub store: Arc<MemoryStore>,
    /// Subscription directory.
    pub directory: Arc<InMemoryDirectory>,
    /// Payment gateway double.
    pub gateway: Arc<MockGateway>,
    /// Notification sink.
    pub notifier: Arc<RecordingNotifier>,
    /// Controlled time source.
    pub clock: Arc<ManualClock>,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
}

impl TestHarness {
    /// Create a harness with no tenants, starting at `start`.
    pub async fn new(start: DateTime<Utc>) -> Self {
        Self::with_subscriptions(start, Vec::new()).await
    }

    /// Create a started harness whose directory holds `subscriptions`.
    pub async fn with_subscriptions(
        start: DateTime<Utc>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::with_subscriptions(subscriptions));
        let gateway = Arc::new(MockGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(start));

        let settings = EngineSettings {
            retry: RetryPolicy {
                attempt_timeout: Duration::from_secs(5),
                max_retries: 1,
                base_delay_ms: 1,
                max_delay: Duration::from_millis(5),
            },
            ..EngineSettings::default()
        };

        let engine = MeteringEngine::new(
            Collaborators {
                store: store.clone(),
                gateway: gateway.clone(),
                notifier: notifier.clone(),
                directory: directory.clone(),
                discounts: Arc::new(NoDiscounts),
                clock: clock.clone(),
            },
            TierCatalog::default(),
            EndpointClassifier::default(),
            settings,
        );
        engine.start().await.expect("Failed to start engine");

        let service_api_key = "test-service-key".to_string();
        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            ..ServiceConfig::default()
        };

        let router: Router = create_router(AppState::new(Arc::clone(&engine), config));
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            engine,
            store,
            directory,
            gateway,
            notifier,
            clock,
            service_api_key,
        }
    }
}

/// A UTC instant.
pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// Tenant ID from a string literal.
pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

/// A successful call.
pub fn call(tenant_id: &TenantId, path: &str) -> CallEvent {
    CallEvent {
        tenant_id: tenant_id.clone(),
        path: path.to_string(),
        response_time_ms: 40,
        status_code: 200,
        bytes_transferred: 512,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
