//! External collaborators of the metering engine.
//!
//! Each collaborator is a trait so deployments and tests can inject their own
//! implementation:
//!
//! - [`PaymentGateway`]: invoices and charges (`StripeGateway` in production)
//! - [`Notifier`]: alert and invoice notifications
//! - [`SubscriptionDirectory`]: which tenants exist and which tier they are on
//! - [`DiscountPolicy`]: per-bill discounts
//! - [`Clock`]: the current time

pub mod clock;
pub mod directory;
pub mod discount;
pub mod gateway;
pub mod notifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{DirectoryError, InMemoryDirectory, Subscription, SubscriptionDirectory};
pub use discount::{DiscountPolicy, NoDiscounts};
pub use gateway::{ChargeResult, ChargeStatus, DisabledGateway, GatewayError, PaymentGateway};
pub use notifier::{LogNotifier, NotifyError, Notifier, WebhookNotifier};
