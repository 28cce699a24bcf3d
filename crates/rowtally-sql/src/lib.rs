//! Query generation for both warehouses
//!
//! This crate handles:
//! - Dialect specific quoting, day bucketing and type names
//! - Column extraction queries (basic statistics, normalized percentiles)
//! - Row counts, day bounds and partition listings
//! - Copy statements used by backups
//!
//! Every function here is pure: it only builds query text.

pub mod dialect;
pub mod statements;
pub mod template;

pub use dialect::{validate_name, validate_project, Dialect, StringHash, TableRef};
pub use template::{
    fingerprint, percentile_points, wide_percentile_column, ConversionSql, Cte, Mode, QueryBuilder,
    QueryError, QueryPlan, CONSTANT_SENTINEL, MIN_SENTINEL, UNDEFINED_SENTINEL,
};
