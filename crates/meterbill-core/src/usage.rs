//! Usage records and inbound call events.
//!
//! One `UsageRecord` exists per `(tenant, billing cycle)`. Records are only
//! mutated through [`UsageRecord::apply_call`] and the threshold flags, both of
//! which the store applies inside a single atomic upsert.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::str::FromStr;

use crate::classifier::Classification;
use crate::error::{BillingError, Result};
use crate::{BillingCycle, TenantId};

/// A call event reported by the routing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Tenant that made the call.
    pub tenant_id: TenantId,
    /// Raw request path.
    pub path: String,
    /// Response time in milliseconds.
    pub response_time_ms: u64,
    /// HTTP status code returned to the caller.
    pub status_code: u16,
    /// Bytes transferred (request + response).
    pub bytes_transferred: u64,
}

impl CallEvent {
    /// Whether the call counts as an error (`status >= 400`).
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Usage alert thresholds, as a percentage of the tier allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum AlertThreshold {
    /// 80 % of the allowance.
    Eighty,
    /// 90 % of the allowance.
    Ninety,
    /// 100 % of the allowance.
    Hundred,
    /// 120 % of the allowance (upgrade suggestion).
    OneTwenty,
}

impl AlertThreshold {
    /// Thresholds that produce a `usage_threshold` alert, in firing order.
    pub const USAGE: [Self; 3] = [Self::Eighty, Self::Ninety, Self::Hundred];

    /// The threshold as a percentage.
    #[must_use]
    pub const fn percent(self) -> u16 {
        match self {
            Self::Eighty => 80,
            Self::Ninety => 90,
            Self::Hundred => 100,
            Self::OneTwenty => 120,
        }
    }
}

impl TryFrom<u16> for AlertThreshold {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            80 => Ok(Self::Eighty),
            90 => Ok(Self::Ninety),
            100 => Ok(Self::Hundred),
            120 => Ok(Self::OneTwenty),
            other => Err(format!("unknown alert threshold: {other}")),
        }
    }
}

impl From<AlertThreshold> for u16 {
    fn from(threshold: AlertThreshold) -> Self {
        threshold.percent()
    }
}

/// Per-category usage within a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    /// Raw calls.
    pub calls: u64,
    /// Weighted calls.
    pub weight: u64,
    /// Running mean of response time.
    pub avg_response_time_ms: f64,
    /// Calls with `status >= 400`.
    pub errors: u64,
}

impl CategoryUsage {
    /// Fold one call into the category.
    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, weight: u64, response_time_ms: u64, is_error: bool) {
        self.calls += 1;
        self.weight += weight;
        let sample = response_time_ms as f64;
        self.avg_response_time_ms += (sample - self.avg_response_time_ms) / self.calls as f64;
        if is_error {
            self.errors += 1;
        }
    }

    /// Fraction of calls that errored.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

/// Aggregated usage for one tenant in one billing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Tenant the record belongs to.
    pub tenant_id: TenantId,
    /// Cycle the record covers.
    pub billing_cycle: BillingCycle,
    /// Raw call count.
    pub total_calls: u64,
    /// Weighted call count (the billable unit).
    pub weighted_calls: u64,
    /// Bytes transferred.
    pub data_transferred_bytes: u64,
    /// Sum of response times.
    pub response_time_sum_ms: u64,
    /// Calls with `status >= 400`.
    pub error_count: u64,
    /// Usage by endpoint category.
    pub endpoint_breakdown: BTreeMap<String, CategoryUsage>,
    /// Weighted calls per day.
    pub daily_usage: BTreeMap<NaiveDate, u64>,
    /// Thresholds already alerted this cycle.
    pub alert_flags: BTreeSet<AlertThreshold>,
    /// Whether the upgrade suggestion has been emitted.
    pub upgrade_offered: bool,
    /// Last mutation time.
    pub last_updated: DateTime<Utc>,
    /// Set once the cycle's bill is paid; archived records are kept, never deleted.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    /// An empty record for a tenant and cycle.
    #[must_use]
    pub fn empty(tenant_id: TenantId, billing_cycle: BillingCycle, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            billing_cycle,
            total_calls: 0,
            weighted_calls: 0,
            data_transferred_bytes: 0,
            response_time_sum_ms: 0,
            error_count: 0,
            endpoint_breakdown: BTreeMap::new(),
            daily_usage: BTreeMap::new(),
            alert_flags: BTreeSet::new(),
            upgrade_offered: false,
            last_updated: now,
            archived_at: None,
        }
    }

    /// Fold a classified call into the record.
    pub fn apply_call(
        &mut self,
        call: &CallEvent,
        classification: &Classification,
        now: DateTime<Utc>,
    ) {
        let weight = u64::from(classification.weight);
        let is_error = call.is_error();

        self.total_calls += 1;
        self.weighted_calls += weight;
        self.data_transferred_bytes += call.bytes_transferred;
        self.response_time_sum_ms += call.response_time_ms;
        if is_error {
            self.error_count += 1;
        }

        self.endpoint_breakdown
            .entry(classification.category.clone())
            .or_default()
            .record(weight, call.response_time_ms, is_error);

        *self.daily_usage.entry(now.date_naive()).or_insert(0) += weight;
        self.last_updated = now;
    }

    /// Mean response time across all calls.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.response_time_sum_ms as f64 / self.total_calls as f64
        }
    }

    /// Whether the cycle's bill has been finalized.
    #[must_use]
    pub const fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Serialize records in the given format.
    ///
    /// JSON carries every field and can be fed back to [`UsageRecord::import`].
    /// CSV is a flat per-category report for spreadsheets.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Serialization` if JSON encoding fails.
    pub fn export(records: &[Self], format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(records)
                .map_err(|e| BillingError::Serialization(e.to_string())),
            ExportFormat::Csv => Ok(Self::to_csv(records)),
        }
    }

    /// Parse records previously produced by [`UsageRecord::export`].
    ///
    /// # Errors
    ///
    /// Returns `BillingError::UnsupportedFormat` for CSV (lossy) and
    /// `BillingError::Serialization` for malformed JSON.
    pub fn import(data: &str, format: ExportFormat) -> Result<Vec<Self>> {
        match format {
            ExportFormat::Json => {
                serde_json::from_str(data).map_err(|e| BillingError::Serialization(e.to_string()))
            }
            ExportFormat::Csv => Err(BillingError::UnsupportedFormat(
                "csv export is a report and cannot be imported".into(),
            )),
        }
    }

    fn to_csv(records: &[Self]) -> String {
        let mut out = String::from(
            "tenant_id,billing_cycle,category,calls,weighted_calls,avg_response_time_ms,errors,data_transferred_bytes\n",
        );
        for record in records {
            for (category, usage) in &record.endpoint_breakdown {
                let _ = writeln!(
                    out,
                    "{},{},{},{},{},{:.2},{},",
                    record.tenant_id,
                    record.billing_cycle,
                    csv_field(category),
                    usage.calls,
                    usage.weight,
                    usage.avg_response_time_ms,
                    usage.errors,
                );
            }
            let _ = writeln!(
                out,
                "{},{},TOTAL,{},{},{:.2},{},{}",
                record.tenant_id,
                record.billing_cycle,
                record.total_calls,
                record.weighted_calls,
                record.avg_response_time_ms(),
                record.error_count,
                record.data_transferred_bytes,
            );
        }
        out
    }
}

/// Quote a CSV field when it contains separators or quotes.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Usage export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Full-fidelity JSON array of records.
    Json,
    /// Flat per-category CSV report.
    Csv,
}

impl FromStr for ExportFormat {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(BillingError::UnsupportedFormat(other.to_string())),
        }
    }
}
