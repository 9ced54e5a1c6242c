//! Service configuration.

use serde::Deserialize;
use std::path::Path;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process maps; data is lost on restart.
    Memory,
    /// `RocksDB` under `data_dir` (feature `rocksdb-backend`).
    Rocksdb,
}

impl StoreBackend {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("rocksdb") {
            Self::Rocksdb
        } else {
            Self::Memory
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/meterbill").
    pub data_dir: String,

    /// Storage backend (default: memory).
    pub store_backend: StoreBackend,

    /// Service API key required on `/v1` routes.
    pub service_api_key: Option<String>,

    /// Currency of all bills (default: "USD").
    pub currency: String,

    /// JSON tier catalog overriding the built-in tiers (optional).
    pub tiers_file: Option<String>,

    /// JSON array of subscriptions seeding the directory (optional).
    pub tenants_file: Option<String>,

    /// Stripe API key (optional; payments are disabled without it).
    pub stripe_api_key: Option<String>,

    /// Stripe API base URL override (optional).
    pub stripe_api_base: Option<String>,

    /// Webhook receiving alerts and invoice notices (optional; logged otherwise).
    pub alert_webhook_url: Option<String>,

    /// Per-attempt payment timeout in seconds.
    pub payment_timeout_seconds: u64,

    /// Payment retries after the first attempt.
    pub payment_max_retries: usize,

    /// Base payment backoff in milliseconds.
    pub payment_retry_base_ms: u64,

    /// Age in seconds after which a billing run lease may be taken over.
    pub run_lease_ttl_seconds: u64,

    /// Capacity of the ingest queue.
    pub ingest_queue_capacity: usize,

    /// Lease owner name of this process.
    pub instance_id: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    api_key: String,
    #[serde(default)]
    api_base: Option<String>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // Try to load Stripe secrets from file first, then fall back to env vars
        let (stripe_api_key, stripe_api_base) = load_stripe_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            store_backend: std::env::var("STORE_BACKEND")
                .map_or(defaults.store_backend, |v| StoreBackend::parse(&v)),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            currency: std::env::var("CURRENCY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or(defaults.currency),
            tiers_file: std::env::var("TIERS_FILE").ok(),
            tenants_file: std::env::var("TENANTS_FILE").ok(),
            stripe_api_key,
            stripe_api_base,
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok(),
            payment_timeout_seconds: env_or(
                "PAYMENT_TIMEOUT_SECONDS",
                defaults.payment_timeout_seconds,
            ),
            payment_max_retries: env_or("PAYMENT_MAX_RETRIES", defaults.payment_max_retries),
            payment_retry_base_ms: env_or("PAYMENT_RETRY_BASE_MS", defaults.payment_retry_base_ms),
            run_lease_ttl_seconds: env_or("RUN_LEASE_TTL_SECONDS", defaults.run_lease_ttl_seconds),
            ingest_queue_capacity: env_or("INGEST_QUEUE_CAPACITY", defaults.ingest_queue_capacity),
            instance_id: std::env::var("INSTANCE_ID").unwrap_or(defaults.instance_id),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_or(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
        }
    }
}

/// Load Stripe secrets from file or environment.
fn load_stripe_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [".secrets/stripe.json", "../.secrets/stripe.json"];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return (Some(secrets.api_key), secrets.api_base);
        }
    }

    // Fall back to environment variables
    tracing::debug!("Stripe secrets file not found, using environment variables");
    (
        std::env::var("STRIPE_API_KEY").ok(),
        std::env::var("STRIPE_API_BASE").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/meterbill".into(),
            store_backend: StoreBackend::Memory,
            service_api_key: None,
            currency: "USD".into(),
            tiers_file: None,
            tenants_file: None,
            stripe_api_key: None,
            stripe_api_base: None,
            alert_webhook_url: None,
            payment_timeout_seconds: 30,
            payment_max_retries: 2,
            payment_retry_base_ms: 250,
            run_lease_ttl_seconds: 1_800,
            ingest_queue_capacity: 10_000,
            instance_id: "meterbill".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
