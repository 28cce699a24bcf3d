//! Diff report schema (stable v1)
//!
//! This schema is VERSIONED. Breaking changes require a new major version.
//! Missing values serialize as `null`.

use serde::Serialize;

use crate::reconcile::DiffRecord;
use crate::validate::{DiffStatus, DiffSummary};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Summary statistics for a report
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReportSummary {
    /// Number of joined rows
    pub total: usize,

    pub matched: usize,
    pub missing: usize,
    pub divergent: usize,

    /// Row totals over the whole diff
    pub totals: DiffSummary,
}

/// A joined row with its outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedRecord {
    #[serde(flatten)]
    pub record: DiffRecord,

    pub status: DiffStatus,
}

/// Reconciliation report (diff-report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffReport {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Relative threshold used for classification, in percent
    pub threshold: f64,

    pub summary: ReportSummary,

    pub records: Vec<ClassifiedRecord>,

    /// Metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DiffReport {
    /// Classify every record against `threshold`
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DiffRecord>, threshold: f64) -> Self {
        let records: Vec<ClassifiedRecord> = records
            .into_iter()
            .map(|record| ClassifiedRecord {
                status: DiffStatus::classify(record, threshold),
                record: record.clone(),
            })
            .collect();

        let plain: Vec<DiffRecord> = records.iter().map(|r| r.record.clone()).collect();
        let count = |f: fn(&DiffStatus) -> bool| records.iter().filter(|r| f(&r.status)).count();

        let summary = ReportSummary {
            total: records.len(),
            matched: count(|s| matches!(s, DiffStatus::Match)),
            missing: count(|s| matches!(s, DiffStatus::MissingPartition(_))),
            divergent: count(|s| matches!(s, DiffStatus::Divergent)),
            totals: DiffSummary::from_records(&plain),
        };

        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            threshold,
            summary,
            records,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether any row is missing or divergent
    pub fn has_findings(&self) -> bool {
        self.summary.missing + self.summary.divergent > 0
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use rowtally_core::{CountEntry, DayBucket};

    fn day(text: &str) -> DayBucket {
        DayBucket::parse(text).unwrap()
    }

    #[test]
    fn report_counts_statuses() {
        let rows = reconcile(
            &[
                CountEntry::daily("t", day("20200101"), 100),
                CountEntry::daily("t", day("20200102"), 100),
            ],
            &[CountEntry::daily("t", day("20200101"), 80)],
        )
        .unwrap();

        let report = DiffReport::from_records(&rows, 1.0);
        assert_eq!(report.version, ReportVersion::CURRENT);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.divergent, 1);
        assert_eq!(report.summary.missing, 1);
        assert!(report.has_findings());
    }

    #[test]
    fn missing_values_serialize_as_null() {
        let rows = reconcile(&[CountEntry::daily("t", day("20200101"), 100)], &[]).unwrap();
        let json = DiffReport::from_records(&rows, 1.0).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let record = &value["records"][0];
        assert_eq!(record["table"], "t");
        assert_eq!(record["count_b"], serde_json::Value::Null);
        assert_eq!(record["absolute_diff"], serde_json::Value::Null);
        assert_eq!(record["status"]["kind"], "missing_partition");
        assert_eq!(record["status"]["side"], "B");
    }

    #[test]
    fn empty_report() {
        let rows: Vec<DiffRecord> = Vec::new();
        let report = DiffReport::from_records(&rows, 1.0);
        assert_eq!(report.summary.total, 0);
        assert!(!report.has_findings());
        assert!(report.to_json().unwrap().contains("\"version\""));
    }
}
