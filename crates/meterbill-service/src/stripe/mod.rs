//! Stripe integration for invoicing and charges.
//!
//! Stripe handles:
//! - Customer registration
//! - Monthly invoices (one invoice item per bill)
//! - Invoice collection
//! - Immediate proration charges

pub mod client;
pub mod types;

pub use client::StripeGateway;
pub use types::*;
