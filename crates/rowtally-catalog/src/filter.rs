//! Table discovery pipeline
//!
//! Every listed table runs through an ordered list of [`FilterStage`]s that
//! share one [`TableAccumulator`]. A stage either keeps the table (possibly
//! after updating the accumulator) or drops it, which skips the remaining
//! stages. Dropping is not an error: the table is logged and left out.
//!
//! The three presets mirror the exports of the `tables` command:
//!
//! | preset                 | stages                                                                 |
//! |------------------------|------------------------------------------------------------------------|
//! | [`Pipeline::daily`]      | only, ignore, columns, only-columns, ignore-columns, has-time, day bounds |
//! | [`Pipeline::whole`]      | only, ignore, columns, lacks-time, required                            |
//! | [`Pipeline::partitions`] | only, ignore, columns, has-time, partitions                            |

use std::sync::Arc;

use rowtally_core::{
    sort_series, DayBucket, DayRangeEntry, FilterSettings, PartitionEntry, TableColumn, TableDescriptor,
};
use rowtally_sql::statements;

use crate::adapter::{FetchError, Row, WarehouseClient};

/// State built up for one table while it passes the stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableAccumulator {
    pub table_name: String,

    /// Columns to process, in schema order
    pub columns: Vec<String>,

    pub min_day: Option<DayBucket>,
    pub max_day: Option<DayBucket>,

    /// Column used for whole-table counts
    pub required_column: Option<String>,

    /// Daily partition identifiers
    pub partitions: Vec<String>,
}

impl TableAccumulator {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }
}

/// One step of the discovery pipeline
#[async_trait::async_trait]
pub trait FilterStage: Send + Sync {
    /// Stage name used in drop diagnostics
    fn name(&self) -> &'static str;

    /// Returns `false` to drop the table
    async fn apply(&self, table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError>;
}

/// Keeps only the listed tables; an empty list keeps every table
pub struct OnlyTables(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for OnlyTables {
    fn name(&self) -> &'static str {
        "only_tables"
    }

    async fn apply(&self, table: &TableDescriptor, _acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        Ok(self.0.is_empty() || self.0.contains(&table.name))
    }
}

pub struct IgnoreTables(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for IgnoreTables {
    fn name(&self) -> &'static str {
        "ignore_tables"
    }

    async fn apply(&self, table: &TableDescriptor, _acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        Ok(!self.0.contains(&table.name))
    }
}

/// Copies the table's column names into the accumulator
pub struct PutColumns;

#[async_trait::async_trait]
impl FilterStage for PutColumns {
    fn name(&self) -> &'static str {
        "put_columns"
    }

    async fn apply(&self, table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        acc.columns = table.columns.iter().map(|c| c.name.clone()).collect();
        Ok(true)
    }
}

/// Replaces the column list when non-empty
pub struct OnlyColumns(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for OnlyColumns {
    fn name(&self) -> &'static str {
        "only_columns"
    }

    async fn apply(&self, _table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        if !self.0.is_empty() {
            acc.columns = self.0.clone();
        }
        Ok(true)
    }
}

pub struct IgnoreColumns(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for IgnoreColumns {
    fn name(&self) -> &'static str {
        "ignore_columns"
    }

    async fn apply(&self, _table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        acc.columns.retain(|c| !self.0.contains(c));
        Ok(true)
    }
}

/// Keeps tables whose accumulated columns include a time column
pub struct HasTimeColumn(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for HasTimeColumn {
    fn name(&self) -> &'static str {
        "has_time_column"
    }

    async fn apply(&self, _table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        Ok(acc.columns.iter().any(|c| self.0.contains(c)))
    }
}

/// Keeps tables with columns but without a time column
pub struct LacksTimeColumn(pub Vec<String>);

#[async_trait::async_trait]
impl FilterStage for LacksTimeColumn {
    fn name(&self) -> &'static str {
        "lacks_time_column"
    }

    async fn apply(&self, _table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        Ok(!acc.columns.is_empty() && !acc.columns.iter().any(|c| self.0.contains(c)))
    }
}

/// Picks the first required column, else the first column
pub struct PutRequired;

#[async_trait::async_trait]
impl FilterStage for PutRequired {
    fn name(&self) -> &'static str {
        "put_required"
    }

    async fn apply(&self, table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        acc.required_column = table.required_or_any_column().map(|c| c.name.clone());
        Ok(acc.required_column.is_some())
    }
}

/// Queries the first and last day strictly before today
///
/// Bounds are read from the first time column of the accumulated columns.
/// A table without rows before today keeps empty bounds.
pub struct PutDayBounds {
    client: Arc<dyn WarehouseClient>,
    time_columns: Vec<String>,
}

impl PutDayBounds {
    pub fn new(client: Arc<dyn WarehouseClient>, time_columns: Vec<String>) -> Self {
        Self { client, time_columns }
    }
}

#[async_trait::async_trait]
impl FilterStage for PutDayBounds {
    fn name(&self) -> &'static str {
        "put_day_bounds"
    }

    async fn apply(&self, table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        let Some(time_column) = acc.columns.iter().find(|c| self.time_columns.contains(c)) else {
            return Ok(false);
        };

        let table_ref = self.client.table_ref(&table.name)?;
        let sql = statements::day_bounds(self.client.dialect(), &table_ref, time_column)?;
        tracing::debug!(table = %table.name, %sql, "reading day bounds");

        let rows = self.client.execute(&sql).await?;
        if let Some(row) = rows.first() {
            acc.min_day = day_field(row, "min_day")?;
            acc.max_day = day_field(row, "max_day")?;
        }
        Ok(true)
    }
}

fn day_field(row: &Row, name: &str) -> Result<Option<DayBucket>, FetchError> {
    row.text(name)?
        .map(|text| DayBucket::parse(&text))
        .transpose()
        .map_err(FetchError::from)
}

/// Lists the daily partitions of the table
pub struct PutPartitions {
    client: Arc<dyn WarehouseClient>,
}

impl PutPartitions {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl FilterStage for PutPartitions {
    fn name(&self) -> &'static str {
        "put_partitions"
    }

    async fn apply(&self, table: &TableDescriptor, acc: &mut TableAccumulator) -> Result<bool, FetchError> {
        acc.partitions = read_partitions(self.client.as_ref(), &table.name).await?;
        Ok(true)
    }
}

/// Daily partition identifiers of a table, in order
pub async fn read_partitions(client: &dyn WarehouseClient, table: &str) -> Result<Vec<String>, FetchError> {
    let sql = statements::list_partitions(client.dialect(), &client.table_ref(table)?)?;
    let rows = client.execute(&sql).await?;
    rows.iter()
        .filter_map(|row| row.text("partition_id").transpose())
        .collect()
}

/// Ordered filter stages
pub struct Pipeline {
    stages: Vec<Box<dyn FilterStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn stage(mut self, stage: impl FilterStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Time-partitioned tables with their columns and day bounds
    pub fn daily(client: Arc<dyn WarehouseClient>, filters: &FilterSettings) -> Self {
        Self::new()
            .stage(OnlyTables(filters.only_tables.clone()))
            .stage(IgnoreTables(filters.ignore_tables.clone()))
            .stage(PutColumns)
            .stage(OnlyColumns(filters.only_columns.clone()))
            .stage(IgnoreColumns(filters.ignore_columns.clone()))
            .stage(HasTimeColumn(filters.time_columns.clone()))
            .stage(PutDayBounds::new(client, filters.time_columns.clone()))
    }

    /// Dimension tables with the column used for whole-table counts
    pub fn whole(filters: &FilterSettings) -> Self {
        Self::new()
            .stage(OnlyTables(filters.only_tables.clone()))
            .stage(IgnoreTables(filters.ignore_tables.clone()))
            .stage(PutColumns)
            .stage(LacksTimeColumn(filters.time_columns.clone()))
            .stage(PutRequired)
    }

    /// Time-partitioned tables with their daily partitions
    pub fn partitions(client: Arc<dyn WarehouseClient>, filters: &FilterSettings) -> Self {
        Self::new()
            .stage(OnlyTables(filters.only_tables.clone()))
            .stage(IgnoreTables(filters.ignore_tables.clone()))
            .stage(PutColumns)
            .stage(HasTimeColumn(filters.time_columns.clone()))
            .stage(PutPartitions::new(client))
    }

    /// Run every table through the stages, keeping input order
    ///
    /// Query faults raised by a stage abort the run.
    pub async fn run(&self, tables: &[TableDescriptor]) -> Result<Vec<TableAccumulator>, FetchError> {
        let mut kept = Vec::new();

        'tables: for table in tables {
            let mut acc = TableAccumulator::new(&table.name);
            for stage in &self.stages {
                if !stage.apply(table, &mut acc).await? {
                    tracing::info!(table = %table.name, stage = stage.name(), "skip table");
                    continue 'tables;
                }
            }
            tracing::info!(table = %table.name, "processed table");
            kept.push(acc);
        }

        Ok(kept)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// `table,min_day,max_day` per table
pub fn table_day_ranges(results: &[TableAccumulator]) -> Vec<DayRangeEntry> {
    let mut entries: Vec<DayRangeEntry> = results
        .iter()
        .map(|acc| DayRangeEntry {
            table: acc.table_name.clone(),
            column: None,
            start: acc.min_day,
            end: acc.max_day,
        })
        .collect();
    sort_series(&mut entries);
    entries
}

/// `table,column,min_day,max_day` per accumulated column
pub fn column_day_ranges(results: &[TableAccumulator]) -> Vec<DayRangeEntry> {
    let mut entries: Vec<DayRangeEntry> = results
        .iter()
        .flat_map(|acc| {
            acc.columns.iter().map(move |column| DayRangeEntry {
                table: acc.table_name.clone(),
                column: Some(column.clone()),
                start: acc.min_day,
                end: acc.max_day,
            })
        })
        .collect();
    sort_series(&mut entries);
    entries
}

/// `table,column` with the column used for whole-table counts
pub fn required_columns(results: &[TableAccumulator]) -> Vec<TableColumn> {
    let mut entries: Vec<TableColumn> = results
        .iter()
        .filter_map(|acc| {
            acc.required_column.as_ref().map(|column| TableColumn {
                table: acc.table_name.clone(),
                column: column.clone(),
            })
        })
        .collect();
    entries.sort();
    entries
}

/// `table,column` per accumulated column
pub fn table_columns(results: &[TableAccumulator]) -> Vec<TableColumn> {
    let mut entries: Vec<TableColumn> = results
        .iter()
        .flat_map(|acc| {
            acc.columns.iter().map(move |column| TableColumn {
                table: acc.table_name.clone(),
                column: column.clone(),
            })
        })
        .collect();
    entries.sort();
    entries
}

/// `table,partition_id` per partition
pub fn partition_entries(results: &[TableAccumulator]) -> Vec<PartitionEntry> {
    let mut entries: Vec<PartitionEntry> = results
        .iter()
        .flat_map(|acc| {
            acc.partitions.iter().map(move |partition| PartitionEntry {
                table: acc.table_name.clone(),
                partition_id: partition.clone(),
            })
        })
        .collect();
    sort_series(&mut entries);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWarehouseBuilder;
    use pretty_assertions::assert_eq;
    use rowtally_core::{Column, ColumnType, Nullability};

    fn events() -> TableDescriptor {
        TableDescriptor::new(
            "bora",
            "events",
            vec![
                Column::new("insertid", ColumnType::String),
                Column::new("timestamp", ColumnType::Timestamp),
                Column::new("user_id", ColumnType::Integer),
            ],
        )
    }

    fn dim_user() -> TableDescriptor {
        TableDescriptor::new(
            "bora",
            "dim_user",
            vec![
                Column::new("name", ColumnType::String),
                Column::new("id", ColumnType::Integer).with_nullability(Nullability::No),
            ],
        )
    }

    fn filters() -> FilterSettings {
        FilterSettings {
            ignore_columns: vec!["insertid".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn whole_keeps_dimension_tables() {
        let results = Pipeline::whole(&filters()).run(&[events(), dim_user()]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].table_name, "dim_user");
        assert_eq!(results[0].required_column.as_deref(), Some("id"));
        assert_eq!(
            required_columns(&results),
            vec![TableColumn {
                table: "dim_user".to_string(),
                column: "id".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn daily_reads_day_bounds() {
        let client = MockWarehouseBuilder::new()
            .with_dataset("bora")
            .with_response(
                "min_day",
                vec![Row::from_pairs(&[("min_day", "2020-01-01"), ("max_day", "2020-01-31")])],
            )
            .build();
        let client: Arc<dyn WarehouseClient> = Arc::new(client);

        let results = Pipeline::daily(client, &filters())
            .run(&[events(), dim_user()])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].columns, vec!["timestamp", "user_id"]);
        assert_eq!(results[0].min_day.map(|d| d.as_u32()), Some(20200101));
        assert_eq!(results[0].max_day.map(|d| d.as_u32()), Some(20200131));

        let columns = column_day_ranges(&results);
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].column.as_deref(), Some("timestamp"));
    }

    #[tokio::test]
    async fn first_drop_short_circuits() {
        let client = MockWarehouseBuilder::new().with_dataset("bora").build();
        let probe = client.clone();
        let filters = FilterSettings {
            ignore_tables: vec!["events".to_string()],
            ..Default::default()
        };

        let results = Pipeline::daily(Arc::new(client), &filters)
            .run(&[events()])
            .await
            .unwrap();

        assert!(results.is_empty());
        assert!(probe.executed().await.is_empty());
    }

    #[tokio::test]
    async fn only_columns_can_drop_the_time_column() {
        let client = MockWarehouseBuilder::new().build();
        let filters = FilterSettings {
            only_columns: vec!["user_id".to_string()],
            ..Default::default()
        };
        let results = Pipeline::daily(Arc::new(client), &filters)
            .run(&[events()])
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn missing_bounds_stay_empty() {
        let client = MockWarehouseBuilder::new()
            .with_response("min_day", vec![Row::from_pairs(&[("min_day", None::<String>), ("max_day", None)])])
            .build();
        let results = Pipeline::daily(Arc::new(client), &FilterSettings::default())
            .run(&[events()])
            .await
            .unwrap();
        assert_eq!(results[0].min_day, None);
        assert_eq!(table_day_ranges(&results)[0].start, None);
    }

    #[test]
    fn exports_are_sorted() {
        let mut a = TableAccumulator::new("zeta");
        a.partitions = vec!["20200102".to_string(), "20200101".to_string()];
        let mut b = TableAccumulator::new("alpha");
        b.columns = vec!["y".to_string(), "x".to_string()];

        let partitions = partition_entries(&[a.clone(), b.clone()]);
        assert_eq!(partitions[0].partition_id, "20200101");

        let columns = table_columns(&[a, b]);
        assert_eq!(columns[0].column, "x");
    }
}
