//! Validators and per-record classification
//!
//! Threshold validators never keep a row with a missing side: NaN fails
//! every comparison. Only [`Validator::Missing`] selects those rows.

use serde::{Deserialize, Serialize};

use crate::reconcile::{DiffRecord, Side};

/// Default threshold of [`Validator::TableRelative`], in percent
pub const TABLE_RELATIVE_THRESHOLD: f64 = 1.0;

/// Selects the rows of a diff that need attention
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validator {
    /// `|absolute_diff| > threshold`
    Absolute(f64),

    /// `|relative_diff| >= threshold`
    Relative(f64),

    /// `relative_table_diff < -threshold`: warehouse B undercounts the
    /// table. Overcounts are never flagged.
    TableRelative(f64),

    /// Rows where one side has no entry
    Missing,

    /// Totals over the whole diff, no rows
    Summary,
}

impl Validator {
    /// Validator by name with its default threshold
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "absolute" => Some(Self::Absolute(0.0)),
            "relative" => Some(Self::Relative(0.0)),
            "table-relative" | "table_relative" => Some(Self::TableRelative(TABLE_RELATIVE_THRESHOLD)),
            "missing" | "rerun" => Some(Self::Missing),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }

    /// Same validator with another threshold; `Missing` and `Summary` take none
    pub fn with_threshold(self, threshold: f64) -> Self {
        match self {
            Self::Absolute(_) => Self::Absolute(threshold),
            Self::Relative(_) => Self::Relative(threshold),
            Self::TableRelative(_) => Self::TableRelative(threshold),
            other => other,
        }
    }

    /// Relative threshold, in percent, for [`DiffStatus::classify`]
    ///
    /// Only the percent validators carry one; the others classify against
    /// [`TABLE_RELATIVE_THRESHOLD`].
    pub fn classification_threshold(&self) -> f64 {
        match *self {
            Self::Relative(threshold) | Self::TableRelative(threshold) => threshold,
            Self::Absolute(_) | Self::Missing | Self::Summary => TABLE_RELATIVE_THRESHOLD,
        }
    }

    /// Whether one row is kept; `Summary` keeps every row
    pub fn keeps(&self, record: &DiffRecord) -> bool {
        match *self {
            Self::Absolute(threshold) => record.absolute_diff.abs() > threshold,
            Self::Relative(threshold) => record.relative_diff.abs() >= threshold,
            Self::TableRelative(threshold) => record.relative_table_diff < -threshold,
            Self::Missing => !record.is_comparable(),
            Self::Summary => true,
        }
    }

    /// Kept rows, or the totals for `Summary`
    pub fn apply<'a>(&self, records: &'a [DiffRecord]) -> Validated<'a> {
        match self {
            Self::Summary => Validated::Summary(DiffSummary::from_records(records)),
            _ => Validated::Rows(records.iter().filter(|r| self.keeps(r)).collect()),
        }
    }
}

/// Output of a validator
#[derive(Debug, Clone, PartialEq)]
pub enum Validated<'a> {
    Rows(Vec<&'a DiffRecord>),
    Summary(DiffSummary),
}

/// Totals over a diff, skipping missing values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Rows counted in warehouse B
    pub total_rows_b: f64,

    /// Sum of the absolute differences
    pub diff_total: f64,

    /// `100 * diff_total / total rows of A`
    pub diff_relative: f64,
}

impl DiffSummary {
    pub fn from_records(records: &[DiffRecord]) -> Self {
        let total_rows_a: f64 = records.iter().filter_map(|r| r.count_a).map(|c| c as f64).sum();
        let total_rows_b: f64 = records.iter().filter_map(|r| r.count_b).map(|c| c as f64).sum();
        let diff_total: f64 = records
            .iter()
            .map(|r| r.absolute_diff)
            .filter(|d| !d.is_nan())
            .sum();

        Self {
            total_rows_b,
            diff_total,
            diff_relative: if total_rows_a == 0.0 {
                f64::NAN
            } else {
                diff_total * 100.0 / total_rows_a
            },
        }
    }
}

/// Outcome of one joined row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "side", rename_all = "snake_case")]
pub enum DiffStatus {
    Match,

    /// The side that has no entry
    MissingPartition(Side),

    Divergent,
}

impl DiffStatus {
    /// Classify a row against a relative threshold in percent
    ///
    /// Equal counts always match, including two zero counts.
    pub fn classify(record: &DiffRecord, threshold: f64) -> Self {
        if let Some(side) = record.missing_side() {
            return DiffStatus::MissingPartition(side);
        }
        if record.absolute_diff == 0.0 {
            return DiffStatus::Match;
        }
        if record.relative_diff.abs() < threshold {
            DiffStatus::Match
        } else {
            DiffStatus::Divergent
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiffStatus::Match => "match",
            DiffStatus::MissingPartition(_) => "missing",
            DiffStatus::Divergent => "divergent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use pretty_assertions::assert_eq;
    use rowtally_core::{CountEntry, DayBucket};

    fn day(text: &str) -> DayBucket {
        DayBucket::parse(text).unwrap()
    }

    fn diff(a: &[(&str, &str, u64)], b: &[(&str, &str, u64)]) -> Vec<DiffRecord> {
        let series = |rows: &[(&str, &str, u64)]| -> Vec<CountEntry> {
            rows.iter().map(|(t, d, c)| CountEntry::daily(*t, day(d), *c)).collect()
        };
        reconcile(&series(a), &series(b)).unwrap()
    }

    #[test]
    fn names_and_defaults() {
        assert_eq!(Validator::from_name("absolute"), Some(Validator::Absolute(0.0)));
        assert_eq!(Validator::from_name("table-relative"), Some(Validator::TableRelative(1.0)));
        assert_eq!(Validator::from_name("rerun"), Some(Validator::Missing));
        assert_eq!(Validator::from_name("pp"), None);
        assert_eq!(Validator::Missing.with_threshold(3.0), Validator::Missing);
    }

    #[test]
    fn classification_threshold_stays_in_percent() {
        assert_eq!(Validator::Absolute(500.0).classification_threshold(), TABLE_RELATIVE_THRESHOLD);
        assert_eq!(Validator::Relative(2.5).classification_threshold(), 2.5);
        assert_eq!(Validator::TableRelative(3.0).classification_threshold(), 3.0);
        assert_eq!(Validator::Missing.classification_threshold(), TABLE_RELATIVE_THRESHOLD);

        // 10 of 100 rows differ: divergent in percent, even under a row count threshold of 500
        let rows = diff(&[("t", "20200101", 100)], &[("t", "20200101", 90)]);
        let threshold = Validator::Absolute(500.0).classification_threshold();
        assert_eq!(DiffStatus::classify(&rows[0], threshold), DiffStatus::Divergent);
    }

    #[test]
    fn absolute_skips_equal_rows() {
        let rows = diff(
            &[("t", "20200101", 10), ("t", "20200102", 10)],
            &[("t", "20200101", 10), ("t", "20200102", 11)],
        );
        match Validator::Absolute(0.0).apply(&rows) {
            Validated::Rows(kept) => {
                assert_eq!(kept.len(), 1);
                assert_eq!(kept[0].day, Some(day("20200102")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn relative_threshold_is_inclusive() {
        let rows = diff(&[("t", "20200101", 100)], &[("t", "20200101", 95)]);
        assert!(Validator::Relative(5.0).keeps(&rows[0]));
        assert!(!Validator::Relative(5.1).keeps(&rows[0]));
    }

    #[test]
    fn table_relative_ignores_overcounts() {
        let rows = diff(&[("t", "20200101", 100)], &[("t", "20200101", 200)]);
        assert!(!Validator::TableRelative(1.0).keeps(&rows[0]));
    }

    #[test]
    fn summary_skips_missing_values() {
        let rows = diff(
            &[("t", "20200101", 100), ("t", "20200102", 100)],
            &[("t", "20200101", 90)],
        );
        let summary = DiffSummary::from_records(&rows);
        assert_eq!(summary.total_rows_b, 90.0);
        assert_eq!(summary.diff_total, -10.0);
        assert_eq!(summary.diff_relative, -5.0);
    }

    #[test]
    fn classification() {
        let rows = diff(
            &[("t", "20200101", 100), ("t", "20200102", 100), ("t", "20200103", 0)],
            &[("t", "20200101", 99), ("t", "20200102", 50), ("t", "20200103", 0), ("t", "20200104", 1)],
        );
        let statuses: Vec<DiffStatus> = rows.iter().map(|r| DiffStatus::classify(r, 2.0)).collect();
        assert_eq!(
            statuses,
            vec![
                DiffStatus::Match,
                DiffStatus::Divergent,
                DiffStatus::Match,
                DiffStatus::MissingPartition(Side::A),
            ]
        );
    }
}
