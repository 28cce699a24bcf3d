//! Joining two count series
//!
//! Series A is the reference warehouse and series B the one being checked.
//! The join is a full outer join on `(table, day)`. A side without an entry
//! stays `None` and every value derived from it is NaN, so the validators
//! can tell an incomparable row from a zero difference.

use std::collections::{BTreeMap, HashMap, HashSet};

use rowtally_core::{check_unique_counts, CountEntry, DayBucket, PartitionEntry, SeriesError};
use serde::{Deserialize, Serialize};

/// Errors raised while joining two series
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Series {side}: {source}")]
    Series { side: Side, source: SeriesError },

    #[error("Invalid partition '{partition}' of table '{table}'")]
    InvalidPartition { table: String, partition: String },
}

/// One of the two compared series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// One joined `(table, day)` row with its differences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub table: String,

    /// Absent for whole-table counts
    pub day: Option<DayBucket>,

    pub count_a: Option<u64>,
    pub count_b: Option<u64>,

    /// Days of the table present in series A
    pub day_count: usize,

    /// Table totals over the present days
    pub total_table_a: f64,
    pub total_table_b: f64,

    /// `count_b - count_a`
    pub absolute_diff: f64,

    /// `100 * absolute_diff / count_a`, NaN when `count_a` is 0
    pub relative_diff: f64,

    /// `100 * absolute_diff / total_table_a`
    pub relative_table_diff: f64,

    /// The day is a physical partition of the table in warehouse B
    pub is_partition: bool,
}

impl DiffRecord {
    /// The side without an entry, if any
    pub fn missing_side(&self) -> Option<Side> {
        match (self.count_a, self.count_b) {
            (None, _) => Some(Side::A),
            (_, None) => Some(Side::B),
            _ => None,
        }
    }

    pub fn is_comparable(&self) -> bool {
        self.missing_side().is_none()
    }
}

/// Joins two count series
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    ignore_tables: Vec<String>,
    partitions: HashSet<(String, DayBucket)>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop these tables from both series before joining
    pub fn with_ignored_tables(mut self, tables: Vec<String>) -> Self {
        if !tables.is_empty() {
            tracing::info!(tables = %tables.join(","), "skip tables");
        }
        self.ignore_tables = tables;
        self
    }

    /// Mark joined rows that are daily partitions of warehouse B
    pub fn with_partitions(mut self, partitions: &[PartitionEntry]) -> Result<Self, ReconcileError> {
        for entry in partitions {
            let day = DayBucket::parse(&entry.partition_id).map_err(|_| ReconcileError::InvalidPartition {
                table: entry.table.clone(),
                partition: entry.partition_id.clone(),
            })?;
            self.partitions.insert((entry.table.clone(), day));
        }
        Ok(self)
    }

    /// Join both series and compute every difference
    ///
    /// Rows come out ordered by table, then day.
    pub fn reconcile(&self, series_a: &[CountEntry], series_b: &[CountEntry]) -> Result<Vec<DiffRecord>, ReconcileError> {
        check_unique_counts(series_a).map_err(|source| ReconcileError::Series { side: Side::A, source })?;
        check_unique_counts(series_b).map_err(|source| ReconcileError::Series { side: Side::B, source })?;

        let mut joined: BTreeMap<(&str, Option<DayBucket>), (Option<u64>, Option<u64>)> = BTreeMap::new();
        for entry in series_a.iter().filter(|e| self.keeps(&e.table)) {
            joined.entry((entry.table.as_str(), entry.day)).or_default().0 = Some(entry.count);
        }
        for entry in series_b.iter().filter(|e| self.keeps(&e.table)) {
            joined.entry((entry.table.as_str(), entry.day)).or_default().1 = Some(entry.count);
        }

        let mut totals: HashMap<&str, TableTotals> = HashMap::new();
        for (&(table, _), &(a, b)) in &joined {
            let total = totals.entry(table).or_default();
            if let Some(a) = a {
                total.a += a as f64;
                total.days += 1;
            }
            if let Some(b) = b {
                total.b += b as f64;
            }
        }

        Ok(joined
            .into_iter()
            .map(|((table, day), (count_a, count_b))| {
                let total = totals.get(table).copied().unwrap_or_default();
                let absolute_diff = as_float(count_b) - as_float(count_a);
                DiffRecord {
                    table: table.to_string(),
                    day,
                    count_a,
                    count_b,
                    day_count: total.days,
                    total_table_a: total.a,
                    total_table_b: total.b,
                    absolute_diff,
                    relative_diff: percent(absolute_diff, as_float(count_a)),
                    relative_table_diff: percent(absolute_diff, total.a),
                    is_partition: day.is_some_and(|d| self.partitions.contains(&(table.to_string(), d))),
                }
            })
            .collect())
    }

    fn keeps(&self, table: &str) -> bool {
        !self.ignore_tables.iter().any(|t| t == table)
    }
}

/// Join two series with no ignore list and no partitions
pub fn reconcile(series_a: &[CountEntry], series_b: &[CountEntry]) -> Result<Vec<DiffRecord>, ReconcileError> {
    Reconciler::new().reconcile(series_a, series_b)
}

#[derive(Debug, Clone, Copy, Default)]
struct TableTotals {
    a: f64,
    b: f64,
    days: usize,
}

fn as_float(count: Option<u64>) -> f64 {
    count.map(|c| c as f64).unwrap_or(f64::NAN)
}

/// `100 * part / whole`, NaN when `whole` is 0
fn percent(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        f64::NAN
    } else {
        part * 100.0 / whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day(text: &str) -> DayBucket {
        DayBucket::parse(text).unwrap()
    }

    #[test]
    fn one_day_difference() {
        let rows = reconcile(
            &[CountEntry::daily("t", day("20200101"), 100)],
            &[CountEntry::daily("t", day("20200101"), 90)],
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].absolute_diff, -10.0);
        assert_eq!(rows[0].relative_diff, -10.0);
        assert_eq!(rows[0].relative_table_diff, -10.0);
        assert_eq!(rows[0].day_count, 1);
    }

    #[test]
    fn missing_side_is_nan() {
        let rows = reconcile(
            &[
                CountEntry::daily("t", day("20200101"), 100),
                CountEntry::daily("t", day("20200102"), 50),
            ],
            &[CountEntry::daily("t", day("20200101"), 100)],
        )
        .unwrap();
        let missing = &rows[1];
        assert_eq!(missing.missing_side(), Some(Side::B));
        assert!(missing.absolute_diff.is_nan());
        assert!(missing.relative_diff.is_nan());
        assert!(missing.relative_table_diff.is_nan());
        assert_eq!(missing.total_table_a, 150.0);
        assert_eq!(missing.total_table_b, 100.0);
        assert_eq!(missing.day_count, 2);
    }

    #[test]
    fn zero_reference_count() {
        let rows = reconcile(
            &[CountEntry::daily("t", day("20200101"), 0)],
            &[CountEntry::daily("t", day("20200101"), 5)],
        )
        .unwrap();
        assert_eq!(rows[0].absolute_diff, 5.0);
        assert!(rows[0].relative_diff.is_nan());
    }

    #[test]
    fn ignored_tables_leave_both_series() {
        let rows = Reconciler::new()
            .with_ignored_tables(vec!["storm_warn".to_string()])
            .reconcile(
                &[CountEntry::whole("storm_warn", 1), CountEntry::whole("t", 1)],
                &[CountEntry::whole("storm_warn", 2)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table, "t");
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let a = vec![CountEntry::whole("t", 1), CountEntry::whole("t", 2)];
        assert!(matches!(
            reconcile(&a, &[]),
            Err(ReconcileError::Series { side: Side::A, .. })
        ));
    }

    #[test]
    fn partitions_are_marked() {
        let partitions = vec![PartitionEntry {
            table: "t".to_string(),
            partition_id: "20200102".to_string(),
        }];
        let rows = Reconciler::new()
            .with_partitions(&partitions)
            .unwrap()
            .reconcile(
                &[
                    CountEntry::daily("t", day("20200101"), 1),
                    CountEntry::daily("t", day("20200102"), 1),
                ],
                &[],
            )
            .unwrap();
        assert!(!rows[0].is_partition);
        assert!(rows[1].is_partition);
    }
}
