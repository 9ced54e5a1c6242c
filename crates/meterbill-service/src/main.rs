//! Meterbill Service - metering, billing and payments for a multi-tenant API.
//!
//! This is the main entry point for the meterbill service.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meterbill_core::{EndpointClassifier, TierCatalog};
use meterbill_service::collab::{
    DisabledGateway, InMemoryDirectory, LogNotifier, NoDiscounts, Notifier, PaymentGateway,
    SystemClock, WebhookNotifier,
};
use meterbill_service::{
    create_router, AppState, Collaborators, EngineSettings, MeteringEngine, ServiceConfig,
    StoreBackend, StripeGateway,
};
use meterbill_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meterbill=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Meterbill Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        currency = %config.currency,
        instance_id = %config.instance_id,
        stripe_configured = %config.stripe_api_key.is_some(),
        webhook_configured = %config.alert_webhook_url.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config)?;

    let catalog = match &config.tiers_file {
        Some(path) => {
            tracing::info!(path = %path, "Loading tier catalog");
            TierCatalog::from_json(&std::fs::read_to_string(path)?)?
        }
        None => TierCatalog::default(),
    };

    let directory = match &config.tenants_file {
        Some(path) => {
            tracing::info!(path = %path, "Loading tenant subscriptions");
            InMemoryDirectory::from_file(path)?
        }
        None => InMemoryDirectory::new(),
    };

    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_api_key {
        Some(key) => Arc::new(StripeGateway::new(key.clone(), config.stripe_api_base.clone())?),
        None => {
            tracing::warn!("STRIPE_API_KEY not set; bills will fail to settle");
            Arc::new(DisabledGateway)
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let engine = MeteringEngine::new(
        Collaborators {
            store,
            gateway,
            notifier,
            directory: Arc::new(directory),
            discounts: Arc::new(NoDiscounts),
            clock: Arc::new(SystemClock),
        },
        catalog,
        EndpointClassifier::default(),
        EngineSettings::from_config(&config),
    );
    engine.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.spawn_scheduler(shutdown_rx);

    // Create the router
    let app = create_router(AppState::new(Arc::clone(&engine), config.clone()));
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    scheduler.await?;

    tracing::info!("Meterbill Service stopped");
    Ok(())
}

fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        #[cfg(feature = "rocksdb-backend")]
        StoreBackend::Rocksdb => {
            tracing::info!(path = %config.data_dir, "Opening RocksDB store");
            Ok(Arc::new(meterbill_store::RocksStore::open(&config.data_dir)?))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StoreBackend::Rocksdb => {
            tracing::warn!("Built without rocksdb-backend; falling back to the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
