//! Core types and pure billing logic for meterbill.
//!
//! This crate provides the foundational types used throughout the metering platform:
//!
//! - **Identifiers**: `TenantId`, `RunId`, `TierChangeId`
//! - **Cycles**: `BillingCycle` (calendar month, `YYYY-MM`)
//! - **Tiers**: `Tier`, `TierCatalog`
//! - **Classification**: `EndpointRule`, `EndpointClassifier`
//! - **Usage**: `UsageRecord`, `CallEvent`, `CategoryUsage`
//! - **Alerts**: `AlertEvent`, `AlertThreshold`, `check_thresholds`
//! - **Bills**: `Bill`, `BillStatus`, `Discount`, `calculate_bill`
//! - **Tier changes**: `TierChangeEvent`, `prorate`
//! - **Revenue**: `RevenueSnapshot`, `Segmentation`
//! - **Scheduling**: `SchedulerState`, `RunLease`, `RunSummary`
//!
//! # Money
//!
//! All monetary amounts are `rust_decimal::Decimal` in the configured currency's
//! major unit (e.g. dollars). Amounts on a finished `Bill` are rounded to two
//! decimal places, midpoint away from zero.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod bill;
pub mod classifier;
pub mod cycle;
pub mod error;
pub mod ids;
pub mod proration;
pub mod revenue;
pub mod schedule;
pub mod tier;
pub mod usage;

pub use alert::{check_thresholds, AlertEvent, AlertKind};
pub use bill::{
    apply_credits, calculate_bill, round_money, Bill, BillStatus, CategoryCharge,
    CreditApplication, Discount, PAYMENT_TERMS_DAYS,
};
pub use classifier::{Classification, EndpointClassifier, EndpointRule, DEFAULT_CATEGORY};
pub use cycle::BillingCycle;
pub use error::{BillingError, Result};
pub use ids::{IdError, RunId, TenantId, TierChangeId};
pub use proration::{prorate, remaining_days, TierChangeEvent};
pub use revenue::{
    RevenueBucket, RevenueSnapshot, Segmentation, TierSegment, UsageBucket,
};
pub use schedule::{RunLease, RunPhase, RunSummary, SchedulerState, TenantFailure};
pub use tier::{Tier, TierCatalog};
pub use usage::{AlertThreshold, CallEvent, CategoryUsage, ExportFormat, UsageRecord};
