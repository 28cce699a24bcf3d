//! Stats and row-count extraction
//!
//! Work items run through a bounded pool of concurrent queries against one
//! shared [`WarehouseClient`]. Column items are grouped by table: the groups
//! run one after the other and each finished group is handed to a
//! [`GroupSink`] before the next one starts.
//!
//! A batch always runs to completion. When an item faults, the remaining
//! items of the batch still finish, then the first fault is returned and the
//! batch is not flushed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use rowtally_catalog::{FetchError, Row, WarehouseClient};
use rowtally_core::{
    persist_series, sort_series, BasicStatRecord, ColumnType, ConfigError, CountEntry, DayBucket, DayRange,
    DayRangeEntry, ExtractionSettings, PercentileRecord, SeriesError, TableColumn, TableDescriptor,
    UNDEFINED_QUANTILE,
};
use rowtally_sql::{
    fingerprint, percentile_points, statements, wide_percentile_column, Mode, QueryBuilder, QueryError,
};

/// Errors raised by the extractors
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("{table}.{item}: {source}")]
    Item {
        table: String,
        item: String,
        source: FetchError,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Series(#[from] SeriesError),
}

impl ExtractError {
    fn item(table: &str, item: impl ToString, source: FetchError) -> Self {
        ExtractError::Item {
            table: table.to_string(),
            item: item.to_string(),
            source,
        }
    }
}

/// One column of one table over a day range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnItem {
    pub table: String,
    pub column: String,
    pub days: DayRange,
}

impl ColumnItem {
    pub fn new(table: impl Into<String>, column: impl Into<String>, days: DayRange) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            days,
        }
    }

    /// Work items from a column day-range series
    ///
    /// `end` replaces the end day of every entry. Entries without a column
    /// or without a start day are skipped.
    pub fn from_ranges(entries: &[DayRangeEntry], end: Option<NaiveDate>) -> Result<Vec<Self>, ConfigError> {
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(column) = &entry.column else {
                tracing::warn!(table = %entry.table, "skip day range without a column");
                continue;
            };
            match entry_range(entry, end)? {
                Some(days) => items.push(Self::new(entry.table.clone(), column.clone(), days)),
                None => tracing::warn!(table = %entry.table, %column, "skip column without day bounds"),
            }
        }
        Ok(items)
    }
}

/// Day range of an entry, `None` when a bound is unknown
fn entry_range(entry: &DayRangeEntry, end: Option<NaiveDate>) -> Result<Option<DayRange>, ConfigError> {
    let Some(start) = entry.start else {
        return Ok(None);
    };
    let end = match (end, entry.end) {
        (Some(end), _) => end,
        (None, Some(end)) => bucket_date(end)?,
        (None, None) => return Ok(None),
    };
    DayRange::new(bucket_date(start)?, end).map(Some)
}

fn bucket_date(day: DayBucket) -> Result<NaiveDate, ConfigError> {
    day.to_date().ok_or_else(|| ConfigError::InvalidDay {
        value: day.to_string(),
        reason: "not a calendar day".to_string(),
    })
}

/// Destination of the records of one finished table group
pub trait GroupSink {
    fn flush_basic(&mut self, table: &str, records: &[BasicStatRecord]) -> Result<(), SeriesError>;

    fn flush_percentiles(&mut self, table: &str, records: &[PercentileRecord]) -> Result<(), SeriesError>;
}

/// Writes one series file per table into a directory
///
/// Files are named `<prefix>_basic_<table>.csv` and
/// `<prefix>_ptiles_<table>.csv`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    prefix: String,
    written: Vec<PathBuf>,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            written: Vec::new(),
        }
    }

    pub fn basic_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}_basic_{}.csv", self.prefix, table))
    }

    pub fn percentiles_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}_ptiles_{}.csv", self.prefix, table))
    }

    /// Files written so far, in flush order
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn persist<T: rowtally_core::SeriesRecord>(&mut self, path: PathBuf, records: &[T]) -> Result<(), SeriesError> {
        persist_series(records, &path)?;
        tracing::info!(path = %path.display(), records = records.len(), "flushed");
        self.written.push(path);
        Ok(())
    }
}

impl GroupSink for DirectorySink {
    fn flush_basic(&mut self, table: &str, records: &[BasicStatRecord]) -> Result<(), SeriesError> {
        let path = self.basic_path(table);
        self.persist(path, records)
    }

    fn flush_percentiles(&mut self, table: &str, records: &[PercentileRecord]) -> Result<(), SeriesError> {
        let path = self.percentiles_path(table);
        self.persist(path, records)
    }
}

/// Keeps flushed records in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub basic: Vec<BasicStatRecord>,
    pub percentiles: Vec<PercentileRecord>,

    /// Tables in flush order
    pub flushed: Vec<String>,
}

impl GroupSink for MemorySink {
    fn flush_basic(&mut self, table: &str, records: &[BasicStatRecord]) -> Result<(), SeriesError> {
        self.basic.extend_from_slice(records);
        self.flushed.push(table.to_string());
        Ok(())
    }

    fn flush_percentiles(&mut self, table: &str, records: &[PercentileRecord]) -> Result<(), SeriesError> {
        self.percentiles.extend_from_slice(records);
        self.flushed.push(table.to_string());
        Ok(())
    }
}

/// Counts of one extraction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Table groups flushed
    pub tables: usize,

    /// Column items queried
    pub items: usize,

    /// Items whose result had an unexpected shape
    pub missing: usize,
}

/// An item with everything needed to build its query
struct Resolved<'a> {
    item: &'a ColumnItem,
    column_type: ColumnType,
    builder: QueryBuilder,
}

/// Basic statistics and percentiles per column
pub struct StatsExtractor {
    client: Arc<dyn WarehouseClient>,
    settings: ExtractionSettings,
    time_columns: Vec<String>,
}

impl StatsExtractor {
    pub fn new(client: Arc<dyn WarehouseClient>, settings: &ExtractionSettings, time_columns: &[String]) -> Self {
        Self {
            client,
            settings: settings.clone(),
            time_columns: time_columns.to_vec(),
        }
    }

    /// Concurrent column queries per table
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.settings.stats_workers = workers;
        self
    }

    fn workers(&self) -> usize {
        self.settings.stats_workers.max(1)
    }

    /// Basic statistics of every item, flushed per table
    pub async fn basic_stats<S: GroupSink>(
        &self,
        tables: &[TableDescriptor],
        items: &[ColumnItem],
        sink: &mut S,
    ) -> Result<ExtractSummary, ExtractError> {
        let resolved = self.resolve(tables, items)?;
        let mut summary = ExtractSummary::default();

        for group in group_by_table(&resolved) {
            let table = group[0].item.table.as_str();
            let mut records = self.run_group(group, |r| self.read_basic(r)).await?;

            summary.items += records.len();
            summary.missing += records.iter().filter(|r| r.is_missing()).count();
            summary.tables += 1;

            sort_series(&mut records);
            sink.flush_basic(table, &records)?;
        }

        Ok(summary)
    }

    /// Percentiles of every item, flushed per table
    pub async fn percentiles<S: GroupSink>(
        &self,
        tables: &[TableDescriptor],
        items: &[ColumnItem],
        sink: &mut S,
    ) -> Result<ExtractSummary, ExtractError> {
        let resolved = self.resolve(tables, items)?;
        let mut summary = ExtractSummary::default();

        for group in group_by_table(&resolved) {
            let table = group[0].item.table.as_str();
            let results = self.run_group(group, |r| self.read_percentiles(r)).await?;

            summary.items += results.len();
            summary.tables += 1;
            let mut records = Vec::new();
            for (column_records, missing) in results {
                if missing {
                    summary.missing += 1;
                }
                records.extend(column_records);
            }

            sort_series(&mut records);
            sink.flush_percentiles(table, &records)?;
        }

        Ok(summary)
    }

    /// Check every item against the catalog before any query runs
    fn resolve<'a>(&self, tables: &[TableDescriptor], items: &'a [ColumnItem]) -> Result<Vec<Resolved<'a>>, ConfigError> {
        let dialect = self.client.dialect();
        items
            .iter()
            .map(|item| {
                let unknown = || ConfigError::UnknownColumn {
                    table: item.table.clone(),
                    column: item.column.clone(),
                };
                let table = tables.iter().find(|t| t.name == item.table).ok_or_else(unknown)?;
                let column = table.find_column(&item.column).ok_or_else(unknown)?;
                let time_column = table
                    .time_column(&self.time_columns)
                    .ok_or_else(|| ConfigError::MissingSetting(format!("time column of table '{}'", item.table)))?;

                Ok(Resolved {
                    item,
                    column_type: column.column_type,
                    builder: QueryBuilder::new(
                        dialect,
                        time_column.name.clone(),
                        self.settings.substr_size,
                        self.settings.hash_size,
                    ),
                })
            })
            .collect()
    }

    /// Run one group through the pool, in submission order
    async fn run_group<'a, T, F, Fut>(&self, group: &'a [Resolved<'a>], run: F) -> Result<Vec<T>, ExtractError>
    where
        F: Fn(&'a Resolved<'a>) -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let results: Vec<Result<T, ExtractError>> =
            stream::iter(group.iter().map(run)).buffered(self.workers()).collect().await;
        join_batch(results)
    }

    async fn query(&self, resolved: &Resolved<'_>, mode: Mode) -> Result<Vec<Row>, ExtractError> {
        let item = resolved.item;
        let table_ref = self.client.table_ref(&item.table)?;
        let sql = resolved
            .builder
            .build_query(&table_ref, &item.column, resolved.column_type, &item.days, mode)?;
        tracing::debug!(query = %fingerprint(&sql), %sql, "run");

        self.client
            .execute(&sql)
            .await
            .map_err(|e| ExtractError::item(&item.table, &item.column, e))
    }

    async fn read_basic(&self, resolved: &Resolved<'_>) -> Result<BasicStatRecord, ExtractError> {
        let item = resolved.item;
        tracing::info!("read basic stats for {}.{}", item.table, item.column);
        let rows = self.query(resolved, Mode::BasicStats).await?;

        Ok(decode_basic(&item.table, &item.column, &rows).unwrap_or_else(|| {
            tracing::warn!(table = %item.table, column = %item.column, rows = rows.len(), "unexpected basic stats result");
            BasicStatRecord::missing(&item.table, &item.column)
        }))
    }

    async fn read_percentiles(&self, resolved: &Resolved<'_>) -> Result<(Vec<PercentileRecord>, bool), ExtractError> {
        let item = resolved.item;
        let intervals = self.settings.percentiles;
        tracing::info!("read percentiles for {}.{}", item.table, item.column);
        let rows = self.query(resolved, Mode::Percentiles { intervals }).await?;

        Ok(match decode_percentiles(&item.table, &item.column, &rows, intervals) {
            Some(records) => (records, false),
            None => {
                tracing::warn!(table = %item.table, column = %item.column, rows = rows.len(), "unexpected percentile result");
                (PercentileRecord::missing(&item.table, &item.column, intervals), true)
            }
        })
    }
}

/// Consecutive items of the same table
fn group_by_table<'r, 'a>(items: &'r [Resolved<'a>]) -> Vec<&'r [Resolved<'a>]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for index in 1..=items.len() {
        if index == items.len() || items[index].item.table != items[start].item.table {
            groups.push(&items[start..index]);
            start = index;
        }
    }
    groups
}

/// Collect a finished batch, returning its first fault
fn join_batch<T>(results: Vec<Result<T, ExtractError>>) -> Result<Vec<T>, ExtractError> {
    let mut out = Vec::with_capacity(results.len());
    let mut first_fault = None;
    for result in results {
        match result {
            Ok(value) => out.push(value),
            Err(e) => {
                tracing::error!(error = %e, "extraction fault");
                first_fault.get_or_insert(e);
            }
        }
    }
    match first_fault {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// One row of `min_value, max_value, non_null_count, null_count, distinct_count`
fn decode_basic(table: &str, column: &str, rows: &[Row]) -> Option<BasicStatRecord> {
    let [row] = rows else {
        return None;
    };
    // sum() over an empty slice is NULL on Redshift
    let count = |name: &str| -> Option<u64> {
        let value = row.get_by_name(name)?;
        if value.is_null() {
            Some(0)
        } else {
            value.as_u64()
        }
    };

    Some(BasicStatRecord {
        table: table.to_string(),
        column: column.to_string(),
        min: row.get_by_name("min_value")?.as_text(),
        max: row.get_by_name("max_value")?.as_text(),
        non_null: Some(count("non_null_count")?),
        null: Some(count("null_count")?),
        distinct: Some(count("distinct_count")?),
    })
}

/// Either one wide row (`ptile_value00 ..`) or one `(ptile, ptile_value)`
/// row per point
fn decode_percentiles(table: &str, column: &str, rows: &[Row], intervals: u32) -> Option<Vec<PercentileRecord>> {
    let points = percentile_points(intervals);
    let quantile = |value: Option<&rowtally_catalog::Value>| -> Option<f64> {
        match value {
            Some(v) if v.is_null() => Some(UNDEFINED_QUANTILE),
            Some(v) => v.as_f64(),
            None => None,
        }
    };

    let values: Vec<f64> = match rows {
        [row] if row.get_by_name(&wide_percentile_column(0, intervals)).is_some() => points
            .iter()
            .map(|(index, _)| quantile(row.get_by_name(&wide_percentile_column(*index, intervals))))
            .collect::<Option<_>>()?,
        rows if rows.len() == points.len() => rows
            .iter()
            .zip(&points)
            .map(|(row, (_, point))| {
                let ptile = row.get_by_name("ptile")?.as_f64()?;
                if (ptile - point).abs() > 0.005 {
                    return None;
                }
                quantile(row.get_by_name("ptile_value"))
            })
            .collect::<Option<_>>()?,
        _ => return None,
    };

    Some(
        points
            .iter()
            .zip(values)
            .map(|((_, ptile), value)| PercentileRecord {
                table: table.to_string(),
                column: column.to_string(),
                ptile: *ptile,
                value,
            })
            .collect(),
    )
}

/// Row counts per day or per whole table
pub struct RowCountExtractor {
    client: Arc<dyn WarehouseClient>,
    workers: usize,
    time_columns: Vec<String>,
}

impl RowCountExtractor {
    /// Each table is counted by the first of its columns named in `time_columns`
    pub fn new(client: Arc<dyn WarehouseClient>, settings: &ExtractionSettings, time_columns: &[String]) -> Self {
        Self {
            client,
            workers: settings.count_workers,
            time_columns: time_columns.to_vec(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Rows per day for every table of a day-range series
    ///
    /// `end` replaces the end day of every entry. Tables in `ignore` and
    /// tables without a start day are skipped. Every remaining table must be
    /// listed in `tables` with a time column, checked before any query runs.
    pub async fn daily(
        &self,
        tables: &[TableDescriptor],
        entries: &[DayRangeEntry],
        end: Option<NaiveDate>,
        ignore: &[String],
    ) -> Result<Vec<CountEntry>, ExtractError> {
        let mut work = Vec::new();
        for entry in entries {
            if ignore.contains(&entry.table) {
                tracing::info!(table = %entry.table, "skip ignored table");
                continue;
            }
            match entry_range(entry, end)? {
                Some(days) => work.push((entry.table.as_str(), self.time_column(tables, &entry.table)?, days)),
                None => tracing::warn!(table = %entry.table, "skip table without day bounds"),
            }
        }

        let results: Vec<Result<Vec<CountEntry>, ExtractError>> = stream::iter(
            work.iter()
                .map(|(table, time_column, days)| self.count_daily(table, time_column, days)),
        )
        .buffered(self.workers.max(1))
        .collect()
        .await;

        let mut counts: Vec<CountEntry> = join_batch(results)?.into_iter().flatten().collect();
        sort_series(&mut counts);
        Ok(counts)
    }

    fn time_column<'a>(&self, tables: &'a [TableDescriptor], table: &str) -> Result<&'a str, ConfigError> {
        let descriptor = tables
            .iter()
            .find(|t| t.name == table)
            .ok_or_else(|| ConfigError::UnknownTable(table.to_string()))?;
        descriptor
            .time_column(&self.time_columns)
            .map(|c| c.name.as_str())
            .ok_or_else(|| ConfigError::MissingSetting(format!("time column of table '{}'", table)))
    }

    /// Count of the chosen column for every table
    pub async fn whole(&self, entries: &[TableColumn]) -> Result<Vec<CountEntry>, ExtractError> {
        let results: Vec<Result<CountEntry, ExtractError>> =
            stream::iter(entries.iter().map(|entry| self.count_whole(entry)))
                .buffered(self.workers.max(1))
                .collect()
                .await;

        let mut counts = join_batch(results)?;
        sort_series(&mut counts);
        Ok(counts)
    }

    async fn count_daily(&self, table: &str, time_column: &str, days: &DayRange) -> Result<Vec<CountEntry>, ExtractError> {
        tracing::info!("read row count per day for {}", table);
        let table_ref = self.client.table_ref(table)?;
        let sql = statements::count_daily(self.client.dialect(), &table_ref, time_column, days)?;
        tracing::debug!(query = %fingerprint(&sql), %sql, "run");

        let rows = self
            .client
            .execute(&sql)
            .await
            .map_err(|e| ExtractError::item(table, days, e))?;

        rows.iter()
            .map(|row| {
                let invalid = || ExtractError::item(table, days, FetchError::InvalidResponse(row.to_string()));
                let day = row
                    .get_by_name("day_part")
                    .and_then(|v| v.as_text())
                    .and_then(|text| DayBucket::parse(&text).ok())
                    .ok_or_else(invalid)?;
                let count = row.get_by_name("total_rows").and_then(|v| v.as_u64()).ok_or_else(invalid)?;
                Ok(CountEntry::daily(table, day, count))
            })
            .collect()
    }

    async fn count_whole(&self, entry: &TableColumn) -> Result<CountEntry, ExtractError> {
        tracing::info!("read row count for {}", entry.table);
        let table_ref = self.client.table_ref(&entry.table)?;
        let sql = statements::count_whole(self.client.dialect(), &table_ref, &entry.column)?;
        tracing::debug!(query = %fingerprint(&sql), %sql, "run");

        let rows = self
            .client
            .execute(&sql)
            .await
            .map_err(|e| ExtractError::item(&entry.table, &entry.column, e))?;

        match rows.as_slice() {
            [row] => row
                .get_by_name("total_rows")
                .and_then(|v| v.as_u64())
                .map(|count| CountEntry::whole(&entry.table, count))
                .ok_or_else(|| {
                    ExtractError::item(&entry.table, &entry.column, FetchError::InvalidResponse(row.to_string()))
                }),
            _ => Err(ExtractError::item(
                &entry.table,
                &entry.column,
                FetchError::InvalidResponse(format!("expected one row, got {}", rows.len())),
            )),
        }
    }
}

/// Write a sorted series to a file
pub fn persist_sorted<T: rowtally_core::SeriesRecord>(mut rows: Vec<T>, path: &Path) -> Result<(), SeriesError> {
    sort_series(&mut rows);
    persist_series(&rows, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowtally_catalog::Value;

    fn day(text: &str) -> DayBucket {
        DayBucket::parse(text).unwrap()
    }

    fn range_entry(table: &str, column: Option<&str>, start: Option<&str>, end: Option<&str>) -> DayRangeEntry {
        DayRangeEntry {
            table: table.to_string(),
            column: column.map(str::to_string),
            start: start.map(day),
            end: end.map(day),
        }
    }

    #[test]
    fn items_skip_unknown_bounds() {
        let entries = vec![
            range_entry("events", Some("score"), Some("20200101"), Some("20200131")),
            range_entry("events", Some("player_id"), None, None),
            range_entry("events", None, Some("20200101"), Some("20200131")),
        ];
        let items = ColumnItem::from_ranges(&entries, None).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].column, "score");
        assert_eq!(items[0].days.len(), 31);
    }

    #[test]
    fn end_override_replaces_entry_end() {
        let entries = vec![range_entry("events", Some("score"), Some("20200101"), None)];
        let end = NaiveDate::from_ymd_opt(2020, 1, 5);
        let items = ColumnItem::from_ranges(&entries, end).unwrap();
        assert_eq!(items[0].days.end(), end.unwrap());
    }

    #[test]
    fn inverted_range_is_fatal() {
        let entries = vec![range_entry("events", Some("score"), Some("20200110"), Some("20200101"))];
        assert!(matches!(
            ColumnItem::from_ranges(&entries, None),
            Err(ConfigError::InvertedDayRange { .. })
        ));
    }

    #[test]
    fn basic_stats_decoding() {
        let row = Row::new(
            vec![
                "min_value".into(),
                "max_value".into(),
                "non_null_count".into(),
                "null_count".into(),
                "distinct_count".into(),
            ],
            vec![
                Value::Text("1".into()),
                Value::Text("9".into()),
                Value::Text("10".into()),
                Value::Null,
                Value::Text("4".into()),
            ],
        );
        let record = decode_basic("events", "score", &[row]).unwrap();
        assert_eq!(record.min.as_deref(), Some("1"));
        assert_eq!(record.null, Some(0));
        assert_eq!(record.distinct, Some(4));

        assert_eq!(decode_basic("events", "score", &[]), None);
    }

    #[test]
    fn wide_percentile_row() {
        let columns: Vec<String> = (0..=10).map(|i| wide_percentile_column(i, 10)).collect();
        let values = (0..=10).map(|i| Value::Float(i as f64 / 10.0)).collect();
        let records = decode_percentiles("events", "score", &[Row::new(columns, values)], 10).unwrap();
        assert_eq!(records.len(), 11);
        assert_eq!(records[3].ptile, 0.3);
        assert_eq!(records[3].value, 0.3);
    }

    #[test]
    fn long_percentile_rows() {
        let rows: Vec<Row> = (0..=10)
            .map(|i| {
                Row::from_pairs(&[
                    ("ptile", Value::Text(format!("{:.2}", i as f64 / 10.0))),
                    ("ptile_value", Value::Text("-1.0".into())),
                ])
            })
            .collect();
        let records = decode_percentiles("events", "score", &rows, 10).unwrap();
        assert!(records.iter().all(|r| r.is_undefined()));

        assert!(decode_percentiles("events", "score", &rows[..5], 10).is_none());
    }

    #[test]
    fn batch_reports_first_fault() {
        let results: Vec<Result<u32, ExtractError>> = vec![
            Ok(1),
            Err(ExtractError::item("a", "x", FetchError::QueryError("first".into()))),
            Err(ExtractError::item("a", "y", FetchError::QueryError("second".into()))),
        ];
        let err = join_batch(results).unwrap_err();
        assert!(err.to_string().contains("first"));
    }
}
