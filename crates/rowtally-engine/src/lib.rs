//! Rowtally engine
//!
//! This crate implements the extraction and reconciliation logic:
//! - Basic statistics and percentiles per column, flushed per table
//! - Daily and whole-table row counts
//! - The join of two count series and its differences
//! - Validators, printers and the JSON diff report

pub mod extract;
pub mod output;
pub mod reconcile;
pub mod report;
pub mod validate;

pub use extract::{
    persist_sorted, ColumnItem, DirectorySink, ExtractError, ExtractSummary, GroupSink, MemorySink,
    RowCountExtractor, StatsExtractor,
};
pub use output::{print_summary, OutputError, Printer};
pub use reconcile::{reconcile, DiffRecord, ReconcileError, Reconciler, Side};
pub use report::{ClassifiedRecord, DiffReport, ReportSummary, ReportVersion};
pub use validate::{DiffStatus, DiffSummary, Validated, Validator, TABLE_RELATIVE_THRESHOLD};
