//! Warehouse access for table discovery, extraction queries and copies
//!
//! This crate provides:
//! - The [`WarehouseClient`] capability shared by every extraction worker
//! - Redshift and BigQuery clients
//! - An in-memory [`MockWarehouse`] for tests
//! - The discovery [`Pipeline`] of filter stages
//! - Bounded polling of long-running jobs and the backup/copy planner
//!
//! ## Features
//!
//! Enable warehouse support via Cargo features:
//! - `redshift` - Amazon Redshift over the PostgreSQL wire protocol
//! - `bigquery` - Google BigQuery
//! - `all-warehouses` - Both clients
//!
//! Without a feature the matching client still exists but every constructor
//! returns a configuration error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rowtally_catalog::{Pipeline, RedshiftClient, WarehouseClient};
//!
//! let client = Arc::new(RedshiftClient::from_settings(settings, &password).await?);
//! let tables = client.list_tables(client.dataset()).await?;
//! let daily = Pipeline::daily(client.clone(), &settings.filters).run(&tables).await?;
//! ```

pub mod adapter;
pub mod bigquery;
pub mod copy;
pub mod filter;
pub mod job;
pub mod mock;
pub mod redshift;

pub use adapter::{assemble_tables, FetchError, Row, Value, WarehouseClient};
pub use bigquery::{map_bigquery_type, BigQueryClient};
pub use copy::{BackupNaming, CopyOperation, CopyPlanner, TablePlan, BACKUP_SUFFIX, COPY_SUFFIX};
pub use filter::{
    column_day_ranges, partition_entries, read_partitions, required_columns, table_columns,
    table_day_ranges, FilterStage, HasTimeColumn, IgnoreColumns, IgnoreTables, LacksTimeColumn,
    OnlyColumns, OnlyTables, Pipeline, PutColumns, PutDayBounds, PutPartitions, PutRequired,
    TableAccumulator,
};
pub use job::{JobPoller, JobState};
pub use mock::{MockWarehouse, MockWarehouseBuilder};
pub use redshift::{map_redshift_type, RedshiftClient};
