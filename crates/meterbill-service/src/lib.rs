//! Meterbill metering engine and HTTP API.
//!
//! This crate wires the pure billing logic of `meterbill-core` to storage,
//! payments and notifications:
//!
//! - Call ingestion and per-tenant usage aggregation
//! - Usage threshold alerts
//! - Monthly billing runs with payment retries
//! - Mid-cycle tier changes with proration
//! - Revenue analytics
//!
//! # Authentication
//!
//! Every `/v1` route requires a service API key in the `x-api-key` header.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for the router

pub mod aggregator;
pub mod analytics;
pub mod auth;
pub mod billing;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod payments;
pub mod routes;
pub mod state;
pub mod stripe;
pub mod tiers;

pub use billing::{BillingScheduler, DailyRollup, SchedulerSettings};
pub use config::{ServiceConfig, StoreBackend};
pub use engine::{Collaborators, EngineSettings, MeteringEngine};
pub use error::{ApiError, EngineError};
pub use payments::{PaymentError, PaymentProcessor, RetryPolicy};
pub use routes::create_router;
pub use state::AppState;
pub use stripe::StripeGateway;
