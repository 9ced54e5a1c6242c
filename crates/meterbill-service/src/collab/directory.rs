//! Subscription directory.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use meterbill_core::TenantId;

/// Errors returned by a subscription directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory could not be reached.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// The tenant is not known to the directory.
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// The directory seed could not be loaded.
    #[error("invalid directory data: {0}")]
    InvalidData(String),
}

fn default_active() -> bool {
    true
}

/// A tenant's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Current tier name.
    pub tier: String,
    /// Billing contact email.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Customer reference at the payment gateway, once registered.
    #[serde(default)]
    pub customer_ref: Option<String>,
    /// Inactive tenants are not billed.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Subscription {
    /// An active subscription with no contact details.
    #[must_use]
    pub fn new(tenant_id: TenantId, tier: impl Into<String>) -> Self {
        Self {
            tenant_id,
            tier: tier.into(),
            email: None,
            name: None,
            customer_ref: None,
            active: true,
        }
    }
}

/// Source of truth for tenants and their tiers.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// All active subscriptions, ordered by tenant.
    async fn active_tenants(&self) -> Result<Vec<Subscription>, DirectoryError>;

    /// Look up one tenant.
    async fn get(&self, tenant_id: &TenantId) -> Result<Option<Subscription>, DirectoryError>;

    /// Persist a tenant's new tier.
    async fn set_tier(&self, tenant_id: &TenantId, tier: &str) -> Result<(), DirectoryError>;

    /// Persist the tenant's payment gateway customer reference.
    async fn set_customer_ref(
        &self,
        tenant_id: &TenantId,
        customer_ref: &str,
    ) -> Result<(), DirectoryError>;
}

/// Directory held in memory, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    subscriptions: DashMap<TenantId, Subscription>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from subscriptions.
    #[must_use]
    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let directory = Self::new();
        for subscription in subscriptions {
            directory.upsert(subscription);
        }
        directory
    }

    /// Parse a JSON array of subscriptions.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidData` if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        let subscriptions: Vec<Subscription> =
            serde_json::from_str(json).map_err(|e| DirectoryError::InvalidData(e.to_string()))?;
        Ok(Self::with_subscriptions(subscriptions))
    }

    /// Load a JSON array of subscriptions from a file.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidData` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DirectoryError::InvalidData(e.to_string()))?;
        Self::from_json(&contents)
    }

    /// Insert or replace a subscription.
    pub fn upsert(&self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.tenant_id.clone(), subscription);
    }

    /// Number of subscriptions, active or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[async_trait]
impl SubscriptionDirectory for InMemoryDirectory {
    async fn active_tenants(&self) -> Result<Vec<Subscription>, DirectoryError> {
        let mut active: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.value().clone())
            .collect();
        active.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(active)
    }

    async fn get(&self, tenant_id: &TenantId) -> Result<Option<Subscription>, DirectoryError> {
        Ok(self.subscriptions.get(tenant_id).map(|s| s.value().clone()))
    }

    async fn set_tier(&self, tenant_id: &TenantId, tier: &str) -> Result<(), DirectoryError> {
        let mut subscription = self
            .subscriptions
            .get_mut(tenant_id)
            .ok_or_else(|| DirectoryError::TenantNotFound(tenant_id.clone()))?;
        subscription.tier = tier.to_string();
        Ok(())
    }

    async fn set_customer_ref(
        &self,
        tenant_id: &TenantId,
        customer_ref: &str,
    ) -> Result<(), DirectoryError> {
        let mut subscription = self
            .subscriptions
            .get_mut(tenant_id)
            .ok_or_else(|| DirectoryError::TenantNotFound(tenant_id.clone()))?;
        subscription.customer_ref = Some(customer_ref.to_string());
        Ok(())
    }
}
