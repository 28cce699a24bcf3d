//! Test fixtures for catalog integration tests
//!
//! Table descriptors and catalog rows resembling a game telemetry dataset:
//! a daily event table, a daily partitioned BigQuery table and a dimension
//! table without a time column.

#![allow(dead_code)]

use rowtally_catalog::Row;
use rowtally_core::{Column, ColumnType, Nullability, Partitioning, TableDescriptor};

/// Daily event table with a `timestamp` column
///
/// - Ingestion id (insertid), usually ignored
/// - Time column (timestamp)
/// - Player and score values
pub fn events_table() -> TableDescriptor {
    TableDescriptor::new(
        "bora",
        "events",
        vec![
            Column::new("insertid", ColumnType::String).with_nullability(Nullability::Yes),
            Column::new("timestamp", ColumnType::Timestamp).with_nullability(Nullability::No),
            Column::new("player_id", ColumnType::Integer).with_nullability(Nullability::No),
            Column::new("score", ColumnType::Float).with_nullability(Nullability::Yes),
            Column::new("is_bot", ColumnType::Boolean).with_nullability(Nullability::Yes),
        ],
    )
}

/// The same event table as a day partitioned BigQuery table
pub fn partitioned_events_table() -> TableDescriptor {
    events_table().with_partitioning(Partitioning::Day)
}

/// Dimension table without time column
pub fn players_table() -> TableDescriptor {
    TableDescriptor::new(
        "bora",
        "players",
        vec![
            Column::new("nickname", ColumnType::String).with_nullability(Nullability::Yes),
            Column::new("player_id", ColumnType::Integer).with_nullability(Nullability::No),
        ],
    )
}

/// Dimension table where no column is required
pub fn regions_table() -> TableDescriptor {
    TableDescriptor::new(
        "bora",
        "regions",
        vec![
            Column::new("code", ColumnType::String),
            Column::new("label", ColumnType::String),
        ],
    )
}

pub fn all_tables() -> Vec<TableDescriptor> {
    vec![events_table(), players_table(), regions_table()]
}

/// One `information_schema.columns` row
pub fn catalog_row(table: &str, column: &str, data_type: &str, nullable: &str) -> Row {
    Row::from_pairs(&[
        ("table_name", table),
        ("column_name", column),
        ("data_type", data_type),
        ("is_nullable", nullable),
    ])
}

/// Redshift catalog rows for the events and players tables
pub fn redshift_catalog() -> Vec<Row> {
    vec![
        catalog_row("events", "insertid", "character varying", "YES"),
        catalog_row("events", "timestamp", "timestamp without time zone", "NO"),
        catalog_row("events", "player_id", "bigint", "NO"),
        catalog_row("events", "score", "double precision", "YES"),
        catalog_row("events", "is_bot", "boolean", "YES"),
        catalog_row("players", "nickname", "character varying", "YES"),
        catalog_row("players", "player_id", "integer", "NO"),
    ]
}

/// Partition listing rows
pub fn partition_rows(ids: &[&str]) -> Vec<Row> {
    ids.iter().map(|id| Row::from_pairs(&[("partition_id", *id)])).collect()
}
