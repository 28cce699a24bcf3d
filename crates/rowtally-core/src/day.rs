//! Calendar days, day buckets and inclusive day ranges

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;

/// Parse a calendar day written as `YYYYMMDD` or `YYYY-MM-DD`
pub fn parse_day(text: &str) -> Result<NaiveDate, ConfigError> {
    let text = text.trim();
    let format = if text.contains('-') { "%Y-%m-%d" } else { "%Y%m%d" };
    NaiveDate::parse_from_str(text, format).map_err(|e| ConfigError::InvalidDay {
        value: text.to_string(),
        reason: e.to_string(),
    })
}

/// A day truncated to its 8-digit `YYYYMMDD` form
///
/// This is the join key between two count series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayBucket(u32);

impl DayBucket {
    /// Bucket for a calendar date
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.year() as u32 * 10_000 + date.month() * 100 + date.day())
    }

    /// Parse `YYYYMMDD` or `YYYY-MM-DD`
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        parse_day(text).map(Self::from_date)
    }

    /// Numeric `YYYYMMDD` value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Calendar date of this bucket
    pub fn to_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt((self.0 / 10_000) as i32, self.0 / 100 % 100, self.0 % 100)
    }
}

impl fmt::Display for DayBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

impl From<NaiveDate> for DayBucket {
    fn from(date: NaiveDate) -> Self {
        Self::from_date(date)
    }
}

/// Inclusive range of calendar days, `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DayRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::InvertedDayRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds from text
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_day(start)?, parse_day(end)?)
    }

    /// A range covering a single day
    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Days in the range, in order
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Number of days in the range
    pub fn len(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// A range always holds at least one day
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for DayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}
