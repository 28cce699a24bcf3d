//! Rowtally Core
//!
//! Domain model shared by every crate: table and column descriptors with
//! the closed column type system, day ranges, persisted series layouts and
//! configuration.

pub mod config;
pub mod day;
pub mod schema;
pub mod series;

pub use config::{
    BigQuerySettings, Config, ConfigError, DiffSettings, ExtractionSettings, FilterSettings,
    ProjectConfig, RedshiftSettings, WarehouseKind,
};
pub use day::{parse_day, DayBucket, DayRange};
pub use schema::{Column, ColumnType, Conversion, Nullability, Partitioning, TableDescriptor};
pub use series::{
    check_unique_counts, load_counts, load_series, persist_series, read_series, sort_series,
    write_series, BasicStatRecord, CountEntry, DayRangeEntry, PartitionEntry, PercentileRecord,
    SeriesError, SeriesRecord, TableColumn, UNDEFINED_QUANTILE,
};
