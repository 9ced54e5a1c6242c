//! Billing cycle identity.
//!
//! A cycle is a calendar month in UTC, rendered as `YYYY-MM`.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BillingError;

/// A billing cycle (calendar month).
///
/// Internally the first day of the month; ordering is chronological.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingCycle(NaiveDate);

impl BillingCycle {
    /// Create a cycle from a year and month (1-12).
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidCycle` if the month is out of range or the
    /// year is not representable.
    pub fn new(year: i32, month: u32) -> Result<Self, BillingError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| BillingError::InvalidCycle(format!("{year:04}-{month:02}")))
    }

    /// The cycle containing the given date.
    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date - Days::new(u64::from(date.day0())))
    }

    /// The cycle containing the given instant (UTC).
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self::from_date(at.date_naive())
    }

    /// Calendar year of the cycle.
    #[must_use]
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Calendar month of the cycle (1-12).
    #[must_use]
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// First day of the cycle.
    #[must_use]
    pub const fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// First instant of the cycle.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.0.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant of the following cycle.
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    /// The following cycle.
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0 + Months::new(1))
    }

    /// The preceding cycle.
    #[must_use]
    pub fn previous(&self) -> Self {
        Self(self.0 - Months::new(1))
    }

    /// Number of days in the cycle.
    #[must_use]
    pub fn days(&self) -> u32 {
        let days = (self.next().0 - self.0).num_days();
        u32::try_from(days).unwrap_or(31)
    }

    /// Whether the date falls inside this cycle.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        Self::from_date(date) == *self
    }
}

impl FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BillingError::InvalidCycle(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl fmt::Debug for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BillingCycle({self})")
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl TryFrom<String> for BillingCycle {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillingCycle> for String {
    fn from(cycle: BillingCycle) -> Self {
        cycle.to_string()
    }
}
