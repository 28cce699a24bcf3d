//! Persisted series and their delimited-file layouts
//!
//! Every artifact is a comma separated file without a header row. The
//! column order of each record kind is fixed and consumers rely on it:
//!
//! | record             | fields                                                |
//! |--------------------|-------------------------------------------------------|
//! | [`CountEntry`]     | `table,day,count` or `table,count`                    |
//! | [`BasicStatRecord`]| `table,column,min,max,non_null,null,distinct`         |
//! | [`PercentileRecord`]| `table,column,ptile,ptile_value`                     |
//! | [`DayRangeEntry`]  | `table,start,end` or `table,column,start,end`         |
//! | [`TableColumn`]    | `table,column`                                        |
//! | [`PartitionEntry`] | `table,partition_id`                                  |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;

use crate::day::DayBucket;

/// A record kind with a fixed field layout
pub trait SeriesRecord: Sized {
    /// Fields in persisted order
    fn to_fields(&self) -> Vec<String>;

    /// Decode one record; `line` is 1-based and used for error context
    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError>;

    /// Order used when a series is written sorted
    fn sort_key(&self) -> Vec<String> {
        self.to_fields()
    }
}

/// Read all records of one kind
pub fn read_series<T: SeriesRecord, R: Read>(reader: R) -> Result<Vec<T>, SeriesError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut out = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index as u64 + 1;
        let record = record.map_err(|e| SeriesError::Csv {
            line,
            message: e.to_string(),
        })?;
        out.push(T::from_fields(&record, line)?);
    }
    Ok(out)
}

/// Write records in the order given
pub fn write_series<T: SeriesRecord, W: Write>(writer: W, rows: &[T]) -> Result<(), SeriesError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(writer);

    for row in rows {
        writer
            .write_record(row.to_fields())
            .map_err(|e| SeriesError::Io(e.to_string()))?;
    }
    writer.flush().map_err(|e| SeriesError::Io(e.to_string()))?;
    Ok(())
}

/// Load a series from a file
pub fn load_series<T: SeriesRecord>(path: &Path) -> Result<Vec<T>, SeriesError> {
    let file = std::fs::File::open(path)
        .map_err(|e| SeriesError::Io(format!("{}: {}", path.display(), e)))?;
    read_series(file)
}

/// Persist a series to a file, replacing it
pub fn persist_series<T: SeriesRecord>(rows: &[T], path: &Path) -> Result<(), SeriesError> {
    let file = std::fs::File::create(path)
        .map_err(|e| SeriesError::Io(format!("{}: {}", path.display(), e)))?;
    write_series(file, rows)
}

/// Sort records by their persisted fields so reruns are byte-identical
pub fn sort_series<T: SeriesRecord>(rows: &mut [T]) {
    rows.sort_by_cached_key(|r| r.sort_key());
}

fn field<'a>(fields: &'a csv::StringRecord, index: usize, line: u64) -> Result<&'a str, SeriesError> {
    fields.get(index).ok_or(SeriesError::FieldCount {
        line,
        found: fields.len(),
    })
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str, line: u64) -> Result<T, SeriesError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| SeriesError::InvalidField {
        line,
        field: name.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional<T: std::str::FromStr>(value: &str, name: &str, line: u64) -> Result<Option<T>, SeriesError>
where
    T::Err: std::fmt::Display,
{
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_field(value, name, line).map(Some)
    }
}

fn parse_day_field(value: &str, line: u64) -> Result<Option<DayBucket>, SeriesError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    DayBucket::parse(value)
        .map(Some)
        .map_err(|e| SeriesError::InvalidField {
            line,
            field: "day".to_string(),
            reason: e.to_string(),
        })
}

fn optional_text<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Row count for a table, per day or for the whole table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountEntry {
    pub table: String,

    /// Absent for whole-table totals
    pub day: Option<DayBucket>,

    pub count: u64,
}

impl CountEntry {
    pub fn daily(table: impl Into<String>, day: DayBucket, count: u64) -> Self {
        Self {
            table: table.into(),
            day: Some(day),
            count,
        }
    }

    pub fn whole(table: impl Into<String>, count: u64) -> Self {
        Self {
            table: table.into(),
            day: None,
            count,
        }
    }
}

impl SeriesRecord for CountEntry {
    fn to_fields(&self) -> Vec<String> {
        match self.day {
            Some(day) => vec![self.table.clone(), day.to_string(), self.count.to_string()],
            None => vec![self.table.clone(), self.count.to_string()],
        }
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        match fields.len() {
            2 => Ok(Self::whole(
                field(fields, 0, line)?,
                parse_field(field(fields, 1, line)?, "count", line)?,
            )),
            3 => Ok(Self {
                table: field(fields, 0, line)?.to_string(),
                day: parse_day_field(field(fields, 1, line)?, line)?,
                count: parse_field(field(fields, 2, line)?, "count", line)?,
            }),
            found => Err(SeriesError::FieldCount { line, found }),
        }
    }
}

/// Reject a series holding two entries for the same `(table, day)`
pub fn check_unique_counts(entries: &[CountEntry]) -> Result<(), SeriesError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert((entry.table.as_str(), entry.day)) {
            return Err(SeriesError::Duplicate {
                table: entry.table.clone(),
                day: optional_text(&entry.day),
            });
        }
    }
    Ok(())
}

/// Load a count series, enforcing one entry per `(table, day)`
pub fn load_counts(path: &Path) -> Result<Vec<CountEntry>, SeriesError> {
    let entries: Vec<CountEntry> = load_series(path)?;
    check_unique_counts(&entries)?;
    Ok(entries)
}

/// Basic statistics of one column
///
/// All value fields are `None` for a missing record (the query returned an
/// unexpected shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicStatRecord {
    pub table: String,
    pub column: String,
    pub min: Option<String>,
    pub max: Option<String>,
    pub non_null: Option<u64>,
    pub null: Option<u64>,
    pub distinct: Option<u64>,
}

impl BasicStatRecord {
    /// Record for a column whose statistics could not be read
    pub fn missing(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            min: None,
            max: None,
            non_null: None,
            null: None,
            distinct: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.non_null.is_none() && self.null.is_none() && self.distinct.is_none()
    }
}

impl SeriesRecord for BasicStatRecord {
    fn to_fields(&self) -> Vec<String> {
        vec![
            self.table.clone(),
            self.column.clone(),
            optional_text(&self.min),
            optional_text(&self.max),
            optional_text(&self.non_null),
            optional_text(&self.null),
            optional_text(&self.distinct),
        ]
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        if fields.len() != 7 {
            return Err(SeriesError::FieldCount { line, found: fields.len() });
        }
        let text = |i: usize| -> Result<Option<String>, SeriesError> {
            let value = field(fields, i, line)?;
            Ok((!value.is_empty()).then(|| value.to_string()))
        };
        Ok(Self {
            table: field(fields, 0, line)?.to_string(),
            column: field(fields, 1, line)?.to_string(),
            min: text(2)?,
            max: text(3)?,
            non_null: parse_optional(field(fields, 4, line)?, "non_null", line)?,
            null: parse_optional(field(fields, 5, line)?, "null", line)?,
            distinct: parse_optional(field(fields, 6, line)?, "distinct", line)?,
        })
    }

    fn sort_key(&self) -> Vec<String> {
        vec![self.table.clone(), self.column.clone()]
    }
}

/// Sentinel for a quantile that is undefined on the slice
pub const UNDEFINED_QUANTILE: f64 = -1.0;

/// One quantile of a column's normalized value distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileRecord {
    pub table: String,
    pub column: String,

    /// Percentile point in `[0, 1]`
    pub ptile: f64,

    /// Normalized value in `[0, 1]` or [`UNDEFINED_QUANTILE`]
    pub value: f64,
}

impl PercentileRecord {
    /// Percentile points `0.0, 1/n, ..., 1.0`
    pub fn points(intervals: u32) -> Vec<f64> {
        let intervals = intervals.max(1);
        (0..=intervals).map(|i| i as f64 / intervals as f64).collect()
    }

    /// A full set of undefined quantiles for one column
    pub fn missing(table: &str, column: &str, intervals: u32) -> Vec<Self> {
        Self::points(intervals)
            .into_iter()
            .map(|ptile| Self {
                table: table.to_string(),
                column: column.to_string(),
                ptile,
                value: UNDEFINED_QUANTILE,
            })
            .collect()
    }

    pub fn is_undefined(&self) -> bool {
        self.value == UNDEFINED_QUANTILE
    }
}

impl SeriesRecord for PercentileRecord {
    fn to_fields(&self) -> Vec<String> {
        vec![
            self.table.clone(),
            self.column.clone(),
            format!("{:.2}", self.ptile),
            format!("{:.12}", self.value),
        ]
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        if fields.len() != 4 {
            return Err(SeriesError::FieldCount { line, found: fields.len() });
        }
        Ok(Self {
            table: field(fields, 0, line)?.to_string(),
            column: field(fields, 1, line)?.to_string(),
            ptile: parse_field(field(fields, 2, line)?, "ptile", line)?,
            value: parse_field(field(fields, 3, line)?, "ptile_value", line)?,
        })
    }
}

/// Day bounds of a table, or of one column of a table
///
/// An empty start marks a table whose day bounds could not be found; such
/// entries are skipped by the extractors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRangeEntry {
    pub table: String,
    pub column: Option<String>,
    pub start: Option<DayBucket>,
    pub end: Option<DayBucket>,
}

impl SeriesRecord for DayRangeEntry {
    fn to_fields(&self) -> Vec<String> {
        let mut fields = vec![self.table.clone()];
        if let Some(column) = &self.column {
            fields.push(column.clone());
        }
        fields.push(optional_text(&self.start));
        fields.push(optional_text(&self.end));
        fields
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        let (column, offset) = match fields.len() {
            3 => (None, 1),
            4 => (Some(field(fields, 1, line)?.to_string()), 2),
            found => return Err(SeriesError::FieldCount { line, found }),
        };
        Ok(Self {
            table: field(fields, 0, line)?.to_string(),
            column,
            start: parse_day_field(field(fields, offset, line)?, line)?,
            end: parse_day_field(field(fields, offset + 1, line)?, line)?,
        })
    }
}

/// A table paired with one of its columns
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableColumn {
    pub table: String,
    pub column: String,
}

impl SeriesRecord for TableColumn {
    fn to_fields(&self) -> Vec<String> {
        vec![self.table.clone(), self.column.clone()]
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        if fields.len() != 2 {
            return Err(SeriesError::FieldCount { line, found: fields.len() });
        }
        Ok(Self {
            table: field(fields, 0, line)?.to_string(),
            column: field(fields, 1, line)?.to_string(),
        })
    }
}

/// A physical partition of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub table: String,

    /// Partition identifier, `YYYYMMDD` for daily partitions
    pub partition_id: String,
}

impl SeriesRecord for PartitionEntry {
    fn to_fields(&self) -> Vec<String> {
        vec![self.table.clone(), self.partition_id.clone()]
    }

    fn from_fields(fields: &csv::StringRecord, line: u64) -> Result<Self, SeriesError> {
        if fields.len() != 2 {
            return Err(SeriesError::FieldCount { line, found: fields.len() });
        }
        Ok(Self {
            table: field(fields, 0, line)?.to_string(),
            partition_id: field(fields, 1, line)?.to_string(),
        })
    }
}

/// Series file errors
#[derive(Debug, thiserror::Error)]
pub enum SeriesError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed record at line {line}: {message}")]
    Csv { line: u64, message: String },

    #[error("Unexpected field count {found} at line {line}")]
    FieldCount { line: u64, found: usize },

    #[error("Invalid {field} at line {line}: {reason}")]
    InvalidField {
        line: u64,
        field: String,
        reason: String,
    },

    #[error("Duplicate entry for table '{table}' day '{day}'")]
    Duplicate { table: String, day: String },
}
