//! Endpoint classification.
//!
//! Maps a raw call path to the `(weight, category)` pair used for metering.
//! Rules are matched by longest prefix, so registration order never matters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BillingError, Result};

/// Category assigned to paths no rule matches.
pub const DEFAULT_CATEGORY: &str = "general";

/// A registered path prefix with its metering weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Path prefix the rule applies to.
    pub path_prefix: String,
    /// Weighted calls charged per call (at least 1).
    pub weight: u32,
    /// Category used for the usage breakdown.
    pub category: String,
}

impl EndpointRule {
    /// Create a rule.
    #[must_use]
    pub fn new(path_prefix: impl Into<String>, weight: u32, category: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            weight,
            category: category.into(),
        }
    }
}

/// Result of classifying a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Weighted calls for this call.
    pub weight: u32,
    /// Breakdown category.
    pub category: String,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            weight: 1,
            category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<u8, usize>,
    rule: Option<usize>,
}

/// Longest-prefix-match registry of endpoint rules.
///
/// Nodes live in a flat arena and refer to each other by index.
#[derive(Debug)]
pub struct EndpointClassifier {
    nodes: Vec<TrieNode>,
    rules: Vec<EndpointRule>,
}

impl Default for EndpointClassifier {
    fn default() -> Self {
        let rules = vec![
            EndpointRule::new("/api/v1/", 1, "standard"),
            EndpointRule::new("/api/v1/ai/", 10, "ai"),
            EndpointRule::new("/api/v1/analytics/", 5, "analytics"),
            EndpointRule::new("/api/v1/reports/", 5, "reports"),
            EndpointRule::new("/api/v1/export/", 3, "export"),
            EndpointRule::new("/api/v1/search", 2, "search"),
            EndpointRule::new("/api/v1/webhooks/", 2, "webhooks"),
        ];
        let mut classifier = Self::empty();
        for rule in rules {
            // Built-in rules are distinct and weighted >= 1.
            let _ = classifier.insert(rule);
        }
        classifier
    }
}

impl EndpointClassifier {
    /// A registry with no rules; every path classifies to the default.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            rules: Vec::new(),
        }
    }

    /// Build a registry from rules.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidEndpointRule` for a zero weight, an empty
    /// prefix or a prefix registered twice.
    pub fn new(rules: impl IntoIterator<Item = EndpointRule>) -> Result<Self> {
        let mut classifier = Self::empty();
        for rule in rules {
            classifier.insert(rule)?;
        }
        Ok(classifier)
    }

    /// Register a rule.
    ///
    /// # Errors
    ///
    /// See [`EndpointClassifier::new`].
    pub fn insert(&mut self, rule: EndpointRule) -> Result<()> {
        let reject = |reason: &str| BillingError::InvalidEndpointRule {
            prefix: rule.path_prefix.clone(),
            reason: reason.to_string(),
        };
        if rule.weight == 0 {
            return Err(reject("weight must be at least 1"));
        }
        if rule.path_prefix.is_empty() {
            return Err(reject("prefix must not be empty"));
        }

        let mut node = 0;
        for byte in rule.path_prefix.bytes() {
            node = match self.nodes[node].children.get(&byte) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(byte, child);
                    child
                }
            };
        }

        if self.nodes[node].rule.is_some() {
            return Err(reject("prefix already registered"));
        }
        self.nodes[node].rule = Some(self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Classify a call path. Never fails; unmatched paths get weight 1 in
    /// the `general` category.
    #[must_use]
    pub fn classify(&self, path: &str) -> Classification {
        self.longest_match(path)
            .map_or_else(Classification::default, |rule| Classification {
                weight: rule.weight,
                category: rule.category.clone(),
            })
    }

    /// The rule with the longest prefix of `path`, if any.
    #[must_use]
    pub fn longest_match(&self, path: &str) -> Option<&EndpointRule> {
        let mut node = 0;
        let mut best = self.nodes[0].rule;
        for byte in path.bytes() {
            match self.nodes[node].children.get(&byte) {
                Some(&child) => node = child,
                None => break,
            }
            if let Some(rule) = self.nodes[node].rule {
                best = Some(rule);
            }
        }
        best.map(|idx| &self.rules[idx])
    }

    /// Registered rules in insertion order.
    #[must_use]
    pub fn rules(&self) -> &[EndpointRule] {
        &self.rules
    }
}
