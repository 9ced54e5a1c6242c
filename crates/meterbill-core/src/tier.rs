//! Subscription tiers and the tier catalog.
//!
//! Tiers are immutable reference data looked up by name.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BillingError, Result};

/// Name of the tier assigned to tenants the directory does not know about.
pub const DEFAULT_TIER: &str = "free";

/// A named pricing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Tier name (catalog key).
    pub name: String,

    /// Fixed monthly price.
    pub monthly_price: Decimal,

    /// Weighted calls included in the monthly price.
    pub included_weighted_calls: u64,

    /// Price per weighted call beyond the allowance.
    pub overage_rate_per_call: Decimal,

    /// Feature flags advertised for the tier.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Tier {
    /// Create a tier without features.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        monthly_price: Decimal,
        included_weighted_calls: u64,
        overage_rate_per_call: Decimal,
    ) -> Self {
        Self {
            name: name.into(),
            monthly_price,
            included_weighted_calls,
            overage_rate_per_call,
            features: Vec::new(),
        }
    }

    /// Attach feature flags.
    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Weighted calls beyond the allowance.
    #[must_use]
    pub fn overage_calls(&self, weighted_calls: u64) -> u64 {
        weighted_calls.saturating_sub(self.included_weighted_calls)
    }

    /// Cost of the given number of overage calls (unrounded).
    #[must_use]
    pub fn overage_cost(&self, overage_calls: u64) -> Decimal {
        Decimal::from(overage_calls) * self.overage_rate_per_call
    }

    /// Usage as a percentage of the allowance, or `None` for a zero allowance.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percent(&self, weighted_calls: u64) -> Option<f64> {
        if self.included_weighted_calls == 0 {
            return None;
        }
        Some(weighted_calls as f64 / self.included_weighted_calls as f64 * 100.0)
    }
}

/// The set of tiers available for subscription.
#[derive(Debug, Clone, Serialize)]
pub struct TierCatalog {
    tiers: BTreeMap<String, Tier>,
    default_tier: Tier,
}

impl Default for TierCatalog {
    fn default() -> Self {
        let tiers = [
            Tier::new(DEFAULT_TIER, Decimal::ZERO, 1_000, Decimal::new(10, 2))
                .with_features(["community_support"]),
            Tier::new("starter", Decimal::new(49, 0), 5_000, Decimal::new(8, 2))
                .with_features(["email_support", "usage_alerts"]),
            Tier::new("pro", Decimal::new(299, 0), 10_000, Decimal::new(5, 2)).with_features([
                "priority_support",
                "usage_alerts",
                "analytics",
            ]),
            Tier::new("enterprise", Decimal::new(999, 0), 100_000, Decimal::new(2, 2))
                .with_features(["dedicated_support", "usage_alerts", "analytics", "sla"]),
        ];

        let default_tier = tiers[0].clone();
        Self {
            tiers: tiers.into_iter().map(|t| (t.name.clone(), t)).collect(),
            default_tier,
        }
    }
}

impl TierCatalog {
    /// Build a catalog from tiers.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::TierNotFound` if `default_tier` is not among `tiers`.
    pub fn new(tiers: Vec<Tier>, default_tier: impl Into<String>) -> Result<Self> {
        let default_name = default_tier.into();
        let tiers: BTreeMap<_, _> = tiers.into_iter().map(|t| (t.name.clone(), t)).collect();
        let default_tier = tiers
            .get(&default_name)
            .cloned()
            .ok_or(BillingError::TierNotFound { name: default_name })?;
        Ok(Self {
            tiers,
            default_tier,
        })
    }

    /// Parse a catalog from JSON: `{"default_tier": "...", "tiers": [...]}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the default tier is missing.
    pub fn from_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct CatalogFile {
            default_tier: String,
            tiers: Vec<Tier>,
        }

        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| BillingError::Serialization(e.to_string()))?;
        Self::new(file.tiers, file.default_tier)
    }

    /// Look up a tier by name.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::TierNotFound` for unknown names.
    pub fn get(&self, name: &str) -> Result<&Tier> {
        self.tiers.get(name).ok_or_else(|| BillingError::TierNotFound {
            name: name.to_string(),
        })
    }

    /// The tier applied when a tenant's tier is unknown.
    #[must_use]
    pub fn default_tier(&self) -> &Tier {
        &self.default_tier
    }

    /// Look up a tier, falling back to the default tier.
    #[must_use]
    pub fn resolve(&self, name: Option<&str>) -> &Tier {
        name.and_then(|n| self.tiers.get(n))
            .unwrap_or_else(|| self.default_tier())
    }

    /// Iterate tiers ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_catalog_has_pro() {
        let catalog = TierCatalog::default();
        let pro = catalog.get("pro").unwrap();
        assert_eq!(pro.monthly_price, dec!(299));
        assert_eq!(pro.included_weighted_calls, 10_000);
        assert_eq!(pro.overage_rate_per_call, dec!(0.05));
    }

    #[test]
    fn unknown_tier_is_an_error_but_resolves_to_default() {
        let catalog = TierCatalog::default();
        assert!(matches!(
            catalog.get("platinum"),
            Err(BillingError::TierNotFound { .. })
        ));
        assert_eq!(catalog.resolve(Some("platinum")).name, DEFAULT_TIER);
        assert_eq!(catalog.resolve(None).name, DEFAULT_TIER);
    }

    #[test]
    fn overage_saturates_at_zero() {
        let tier = Tier::new("t", dec!(10), 100, dec!(0.5));
        assert_eq!(tier.overage_calls(40), 0);
        assert_eq!(tier.overage_calls(130), 30);
        assert_eq!(tier.overage_cost(30), dec!(15.0));
    }

    #[test]
    fn zero_allowance_has_no_usage_percent() {
        let tier = Tier::new("metered", dec!(0), 0, dec!(0.01));
        assert!(tier.usage_percent(10).is_none());
    }

    #[test]
    fn catalog_from_json() {
        let json = r#"{
            "default_tier": "basic",
            "tiers": [
                {"name": "basic", "monthly_price": "0", "included_weighted_calls": 50, "overage_rate_per_call": "0.2"},
                {"name": "plus", "monthly_price": "20", "included_weighted_calls": 500, "overage_rate_per_call": "0.1", "features": ["alerts"]}
            ]
        }"#;
        let catalog = TierCatalog::from_json(json).unwrap();
        assert_eq!(catalog.default_tier().name, "basic");
        assert_eq!(catalog.get("plus").unwrap().features, vec!["alerts"]);
    }

    #[test]
    fn catalog_requires_default_tier() {
        let result = TierCatalog::new(vec![Tier::new("a", dec!(1), 1, dec!(1))], "b");
        assert!(result.is_err());
    }
}
