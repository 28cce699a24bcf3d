//! Printers for validated diffs
//!
//! | printer     | output                                                      |
//! |-------------|-------------------------------------------------------------|
//! | `pretty`    | aligned table for a terminal                                |
//! | `csv-all`   | `table,day,no_days,total_rows_a,total_table_a,total_rows_b,total_table_b,absolute_diff,relative_diff,relative_table_diff` |
//! | `csv-rerun` | `table,day` of the rows that are real partitions            |
//! | `json`      | the versioned [`DiffReport`]                                |
//!
//! Delimited output has no header row and leaves missing values empty.

use std::io::Write;

use crate::reconcile::DiffRecord;
use crate::report::DiffReport;
use crate::validate::DiffSummary;

/// Errors raised while printing
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How validated rows are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Printer {
    Pretty,
    CsvAll,
    CsvRerun,
    Json,
}

impl Printer {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pretty" | "pp" => Some(Self::Pretty),
            "csv-all" | "csv_all" => Some(Self::CsvAll),
            "csv-rerun" | "csv_rerun" => Some(Self::CsvRerun),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Print rows; `threshold` is only used by the JSON report
    pub fn print<W: Write>(&self, out: W, rows: &[&DiffRecord], threshold: f64) -> Result<(), OutputError> {
        match self {
            Self::Pretty => print_pretty(out, rows),
            Self::CsvAll => print_csv_all(out, rows),
            Self::CsvRerun => print_csv_rerun(out, rows),
            Self::Json => {
                let report = DiffReport::from_records(rows.iter().copied(), threshold);
                let mut out = out;
                writeln!(out, "{}", report.to_json()?)?;
                Ok(())
            }
        }
    }
}

fn day_text(record: &DiffRecord) -> String {
    record.day.map(|d| d.to_string()).unwrap_or_default()
}

fn count_text(count: Option<u64>) -> String {
    count.map(|c| c.to_string()).unwrap_or_default()
}

/// Shortest round-trip form, empty for NaN
fn float_text(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn print_csv_all<W: Write>(out: W, rows: &[&DiffRecord]) -> Result<(), OutputError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    for r in rows {
        writer.write_record([
            r.table.clone(),
            day_text(r),
            r.day_count.to_string(),
            count_text(r.count_a),
            float_text(r.total_table_a),
            count_text(r.count_b),
            float_text(r.total_table_b),
            float_text(r.absolute_diff),
            float_text(r.relative_diff),
            float_text(r.relative_table_diff),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn print_csv_rerun<W: Write>(out: W, rows: &[&DiffRecord]) -> Result<(), OutputError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    for r in rows.iter().filter(|r| r.is_partition) {
        writer.write_record([r.table.as_str(), day_text(r).as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

fn print_pretty<W: Write>(mut out: W, rows: &[&DiffRecord]) -> Result<(), OutputError> {
    let header = [
        "table", "day", "no_days", "rows_a", "rows_b", "abs_diff", "rel_diff", "rel_table_diff",
    ];
    let cells: Vec<[String; 8]> = rows
        .iter()
        .map(|r| {
            [
                r.table.clone(),
                day_text(r),
                r.day_count.to_string(),
                count_text(r.count_a),
                count_text(r.count_b),
                pretty_float(r.absolute_diff, 0),
                pretty_float(r.relative_diff, 2),
                pretty_float(r.relative_table_diff, 2),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (cell, width))| {
                if i == 0 {
                    format!("{:<width$}", cell, width = width)
                } else {
                    format!("{:>width$}", cell, width = width)
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
    };

    writeln!(out, "{}", line(&header.map(String::from)))?;
    for row in &cells {
        writeln!(out, "{}", line(row))?;
    }
    Ok(())
}

fn pretty_float(value: f64, decimals: usize) -> String {
    if value.is_nan() {
        "-".to_string()
    } else {
        format!("{:.*}", decimals, value)
    }
}

/// Print the summary triple
pub fn print_summary<W: Write>(mut out: W, summary: &DiffSummary) -> Result<(), OutputError> {
    writeln!(out, "total_rows_b:  {}", float_text(summary.total_rows_b))?;
    writeln!(out, "diff_total:    {}", float_text(summary.diff_total))?;
    writeln!(out, "diff_relative: {}", pretty_float(summary.diff_relative, 4))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Reconciler;
    use pretty_assertions::assert_eq;
    use rowtally_core::{CountEntry, DayBucket, PartitionEntry};

    fn day(text: &str) -> DayBucket {
        DayBucket::parse(text).unwrap()
    }

    fn sample() -> Vec<DiffRecord> {
        Reconciler::new()
            .with_partitions(&[PartitionEntry {
                table: "t".to_string(),
                partition_id: "20200102".to_string(),
            }])
            .unwrap()
            .reconcile(
                &[
                    CountEntry::daily("t", day("20200101"), 100),
                    CountEntry::daily("t", day("20200102"), 100),
                ],
                &[CountEntry::daily("t", day("20200101"), 90)],
            )
            .unwrap()
    }

    fn render(printer: Printer, rows: &[DiffRecord]) -> String {
        let refs: Vec<&DiffRecord> = rows.iter().collect();
        let mut buf = Vec::new();
        printer.print(&mut buf, &refs, 1.0).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn csv_all_leaves_missing_values_empty() {
        assert_eq!(
            render(Printer::CsvAll, &sample()),
            "t,20200101,2,100,200,90,90,-10,-10,-5\n\
             t,20200102,2,100,200,,90,,,\n"
        );
    }

    #[test]
    fn csv_rerun_prints_partition_keys() {
        assert_eq!(render(Printer::CsvRerun, &sample()), "t,20200102\n");
    }

    #[test]
    fn pretty_is_aligned() {
        let text = render(Printer::Pretty, &sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("table"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
        assert!(lines[2].ends_with('-'));
    }

    #[test]
    fn printer_names() {
        assert_eq!(Printer::from_name("pp"), Some(Printer::Pretty));
        assert_eq!(Printer::from_name("csv_rerun"), Some(Printer::CsvRerun));
        assert_eq!(Printer::from_name("xml"), None);
    }

    #[test]
    fn summary_lines() {
        let mut buf = Vec::new();
        print_summary(&mut buf, &DiffSummary::from_records(&sample())).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("diff_total:    -10"));
        assert!(text.contains("diff_relative: -5.0000"));
    }
}
