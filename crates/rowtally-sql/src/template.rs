//! Column extraction queries
//!
//! A query is a chain of common table expressions, each reading the one
//! before it:
//!
//! ```text
//! derived_base      day bucket, hour bucket, raw value within the day range
//! derived_number    value moved into numeric space (per column type)
//! derived_stats     min / max / range of the non-negative numbers
//! derived_norm      value rescaled to [0, 1]
//! ```
//!
//! followed by a final projection: basic statistics over the raw value, or
//! the quantiles of the normalized value.

use rowtally_core::{ColumnType, Conversion, DayRange};
use sha2::{Digest, Sha256};

use crate::dialect::{Dialect, StringHash, TableRef};

/// Normalized value of every row when the slice holds a single value
pub const CONSTANT_SENTINEL: &str = "0.1";

/// Normalized value of the rows equal to the slice minimum
pub const MIN_SENTINEL: &str = "0.000000000001";

/// Reported for a quantile that is undefined on the slice
pub const UNDEFINED_SENTINEL: &str = "-1.0";

/// Errors raised while building a query
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid {kind} identifier '{value}'")]
    InvalidIdentifier { kind: String, value: String },

    #[error("{dialect} does not support {statement}")]
    Unsupported { dialect: Dialect, statement: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// A named common table expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cte {
    pub name: &'static str,
    pub body: String,
}

impl Cte {
    pub fn new(name: &'static str, body: impl Into<String>) -> Self {
        Self {
            name,
            body: body.into(),
        }
    }
}

/// CTE chain plus final select
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    ctes: Vec<Cte>,
    select: String,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, cte: Cte) -> Self {
        self.ctes.push(cte);
        self
    }

    pub fn with_all(mut self, ctes: impl IntoIterator<Item = Cte>) -> Self {
        self.ctes.extend(ctes);
        self
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = select.into();
        self
    }

    /// CTE names in chain order
    pub fn cte_names(&self) -> Vec<&'static str> {
        self.ctes.iter().map(|c| c.name).collect()
    }

    pub fn render(&self) -> String {
        let mut sql = String::new();
        if !self.ctes.is_empty() {
            sql.push_str("WITH\n");
            let ctes: Vec<String> = self
                .ctes
                .iter()
                .map(|c| format!("{} AS (\n{}\n)", c.name, c.body.trim_end()))
                .collect();
            sql.push_str(&ctes.join(",\n"));
            sql.push('\n');
        }
        sql.push_str(self.select.trim());
        sql
    }
}

/// Final projection of a column query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// min, max, non-null count, null count, distinct count
    BasicStats,

    /// `intervals + 1` evenly spaced quantiles of the normalized value
    Percentiles { intervals: u32 },
}

/// Numeric conversion rendered in a dialect
pub trait ConversionSql {
    /// CTEs reading `derived_base` and ending in `derived_number`
    fn number_ctes(&self, dialect: Dialect, hash: StringHash) -> Vec<Cte>;

    /// Expression used by the basic statistics over `event_column`
    fn basic_expression(&self) -> &'static str;
}

const BOOLEAN_CASE: &str = "CASE event_column\n        WHEN true  THEN 1\n        WHEN false THEN 0\n        END";

impl ConversionSql for Conversion {
    fn number_ctes(&self, dialect: Dialect, hash: StringHash) -> Vec<Cte> {
        let number = |expr: &str, from: &str| {
            Cte::new(
                "derived_number",
                format!(
                    "    SELECT\n        event_day,\n        event_hour,\n        {} AS number_column\n    FROM {}",
                    expr, from
                ),
            )
        };

        match self {
            Conversion::Identity => vec![number("event_column", "derived_base")],
            Conversion::BooleanToInt => vec![number(BOOLEAN_CASE, "derived_base")],
            Conversion::EpochSeconds => {
                let expr = match dialect {
                    Dialect::Redshift => "extract(epoch from event_column)",
                    Dialect::BigQuery => "UNIX_SECONDS(CAST(event_column AS TIMESTAMP))",
                };
                vec![number(expr, "derived_base")]
            }
            Conversion::StringHash => {
                let source = if hash.from_tail() {
                    "reverse(event_column)"
                } else {
                    "event_column"
                };
                let (substr, digest) = match dialect {
                    Dialect::Redshift => (
                        format!("SUBSTRING({},0,{})", source, hash.length()),
                        format!("STRTOL(SUBSTRING(MD5(string_column),0,{}), 16)", hash.hash_len),
                    ),
                    Dialect::BigQuery => (
                        format!("SUBSTR({},0,{})", source, hash.length()),
                        format!(
                            "CAST(CONCAT('0x', SUBSTR(TO_HEX(MD5(string_column)),0,{})) AS INT64)",
                            hash.hash_len
                        ),
                    ),
                };
                vec![
                    Cte::new(
                        "string_substr",
                        format!(
                            "    SELECT\n        event_day,\n        event_hour,\n        {} AS string_column\n    FROM derived_base",
                            substr
                        ),
                    ),
                    number(&digest, "string_substr"),
                ]
            }
        }
    }

    fn basic_expression(&self) -> &'static str {
        match self {
            Conversion::BooleanToInt => BOOLEAN_CASE,
            Conversion::Identity | Conversion::EpochSeconds | Conversion::StringHash => "event_column",
        }
    }
}

/// Builds column extraction queries for one warehouse
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: Dialect,
    time_column: String,
    hash: StringHash,
}

impl QueryBuilder {
    /// `substr` and `hash_len` are given in Redshift units and adjusted for
    /// the dialect.
    pub fn new(dialect: Dialect, time_column: impl Into<String>, substr: i32, hash_len: u32) -> Self {
        Self {
            dialect,
            time_column: time_column.into(),
            hash: StringHash::for_dialect(dialect, substr, hash_len),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn time_column(&self) -> &str {
        &self.time_column
    }

    pub fn string_hash(&self) -> StringHash {
        self.hash
    }

    /// Query text for one column over a day range
    pub fn build_query(
        &self,
        table: &TableRef,
        column: &str,
        column_type: ColumnType,
        days: &DayRange,
        mode: Mode,
    ) -> Result<String, QueryError> {
        self.plan(table, column, column_type, days, mode).map(|p| p.render())
    }

    /// The CTE chain behind [`QueryBuilder::build_query`]
    pub fn plan(
        &self,
        table: &TableRef,
        column: &str,
        column_type: ColumnType,
        days: &DayRange,
        mode: Mode,
    ) -> Result<QueryPlan, QueryError> {
        let conversion = column_type.conversion();
        let base = self.base_cte(table, column, days)?;

        let plan = match mode {
            Mode::BasicStats => QueryPlan::new()
                .with(base)
                .with(Cte::new(
                    "derived_basic_stats",
                    format!(
                        "    SELECT\n        {} AS event_column\n    FROM derived_base",
                        conversion.basic_expression()
                    ),
                ))
                .select(self.basic_stats_select()),
            Mode::Percentiles { intervals } => {
                if intervals == 0 {
                    return Err(QueryError::InvalidParameter(
                        "percentile intervals must be positive".to_string(),
                    ));
                }
                let plan = QueryPlan::new()
                    .with(base)
                    .with_all(conversion.number_ctes(self.dialect, self.hash))
                    .with_all(self.normalize_ctes());
                self.percentile_projection(plan, intervals)
            }
        };
        Ok(plan)
    }

    fn base_cte(&self, table: &TableRef, column: &str, days: &DayRange) -> Result<Cte, QueryError> {
        let ts = self.dialect.quote_column(&self.time_column)?;
        let column = self.dialect.quote_column(column)?;
        Ok(Cte::new(
            "derived_base",
            format!(
                "    SELECT\n        {day} AS event_day,\n        extract(hour from {ts}) AS event_hour,\n        {column} AS event_column\n    FROM {table}\n    WHERE {date} BETWEEN '{start}' AND '{end}'",
                day = self.dialect.day_bucket(&ts),
                ts = ts,
                column = column,
                table = table.render(self.dialect),
                date = self.dialect.date_of(&ts),
                start = days.start(),
                end = days.end(),
            ),
        ))
    }

    fn normalize_ctes(&self) -> Vec<Cte> {
        let value = self.dialect.to_float("number_column");
        vec![
            Cte::new(
                "derived_stats",
                "    SELECT\n        min(number_column) AS min_value,\n        max(number_column) AS max_value,\n        max(number_column) - min(number_column) AS range_value\n    FROM derived_number\n    WHERE number_column >= 0",
            ),
            Cte::new(
                "derived_norm",
                format!(
                    "    SELECT\n        event_day,\n        event_hour,\n        number_column AS raw_value,\n        CASE\n        WHEN (SELECT range_value FROM derived_stats) = 0\n            THEN {constant}\n        WHEN ({value} - (SELECT min_value FROM derived_stats)) = 0\n            THEN {min}\n        ELSE\n            ({value} - (SELECT min_value FROM derived_stats))\n            / (SELECT range_value FROM derived_stats)\n        END AS normed_value\n    FROM derived_number\n    WHERE number_column >= 0",
                    constant = CONSTANT_SENTINEL,
                    min = MIN_SENTINEL,
                    value = value,
                ),
            ),
        ]
    }

    fn basic_stats_select(&self) -> String {
        let null_count = match self.dialect {
            Dialect::Redshift => "sum(NVL2(event_column, 0, 1))",
            Dialect::BigQuery => "countif(event_column IS NULL)",
        };
        format!(
            "SELECT\n    min(event_column) AS min_value,\n    max(event_column) AS max_value,\n    count(event_column) AS non_null_count,\n    {} AS null_count,\n    count(distinct event_column) AS distinct_count\nFROM derived_basic_stats",
            null_count
        )
    }

    fn percentile_projection(&self, plan: QueryPlan, intervals: u32) -> QueryPlan {
        let points = percentile_points(intervals);
        match self.dialect {
            Dialect::Redshift => {
                let columns: Vec<String> = points
                    .iter()
                    .map(|(index, point)| {
                        format!(
                            "    NVL(percentile_cont({:.2}) within group (order by normed_value), {}) AS {}",
                            point,
                            UNDEFINED_SENTINEL,
                            wide_percentile_column(*index, intervals)
                        )
                    })
                    .collect();
                plan.select(format!("SELECT\n{}\nFROM derived_norm", columns.join(",\n")))
            }
            Dialect::BigQuery => {
                let rows: Vec<String> = points
                    .iter()
                    .map(|(index, point)| {
                        format!(
                            "SELECT\n    {point:.2} AS ptile,\n    CASE\n    WHEN ptiles[OFFSET({index})] IS NULL THEN {undefined}\n    ELSE ptiles[OFFSET({index})]\n    END AS ptile_value\nFROM derived_percentiles",
                            point = point,
                            index = index,
                            undefined = UNDEFINED_SENTINEL,
                        )
                    })
                    .collect();
                plan.with(Cte::new(
                    "derived_percentiles",
                    format!(
                        "    SELECT\n        APPROX_QUANTILES(normed_value, {}) AS ptiles\n    FROM derived_norm",
                        intervals
                    ),
                ))
                .select(format!("{}\nORDER BY ptile", rows.join("\nUNION ALL\n")))
            }
        }
    }
}

/// `(index, point)` of each quantile, `point = index / intervals`
pub fn percentile_points(intervals: u32) -> Vec<(u32, f64)> {
    (0..=intervals)
        .map(|i| (i, i as f64 / intervals.max(1) as f64))
        .collect()
}

/// Column name of a quantile in the single-row layout: `ptile_value00`,
/// `ptile_value10`, ... `ptile_value100`. Names are distinct when `intervals`
/// divides 100.
pub fn wide_percentile_column(index: u32, intervals: u32) -> String {
    format!("ptile_value{:02}", index * 100 / intervals.max(1))
}

/// Short stable digest of a query, used to correlate log lines
pub fn fingerprint(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn range() -> DayRange {
        DayRange::parse("2020-01-01", "2020-01-31").unwrap()
    }

    fn events() -> TableRef {
        TableRef::new("bora", "events").unwrap()
    }

    #[test]
    fn plan_chains_for_each_conversion() {
        let builder = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15);
        let mode = Mode::Percentiles { intervals: 10 };

        let plan = builder.plan(&events(), "user_id", ColumnType::Integer, &range(), mode).unwrap();
        assert_eq!(
            plan.cte_names(),
            vec!["derived_base", "derived_number", "derived_stats", "derived_norm"]
        );

        let plan = builder.plan(&events(), "name", ColumnType::String, &range(), mode).unwrap();
        assert_eq!(
            plan.cte_names(),
            vec!["derived_base", "string_substr", "derived_number", "derived_stats", "derived_norm"]
        );

        let plan = builder.plan(&events(), "user_id", ColumnType::Integer, &range(), Mode::BasicStats).unwrap();
        assert_eq!(plan.cte_names(), vec!["derived_base", "derived_basic_stats"]);
    }

    #[test]
    fn base_extraction_restricts_day_range() {
        let builder = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15);
        let sql = builder
            .build_query(&events(), "user_id", ColumnType::Integer, &range(), Mode::BasicStats)
            .unwrap();
        assert!(sql.contains("to_char(\"timestamp\", 'YYYYMMDD') AS event_day"));
        assert!(sql.contains("WHERE date(\"timestamp\") BETWEEN '2020-01-01' AND '2020-01-31'"));
        assert!(sql.contains("FROM \"bora\".\"events\""));
    }

    #[test]
    fn normalization_sentinels() {
        for dialect in [Dialect::Redshift, Dialect::BigQuery] {
            let builder = QueryBuilder::new(dialect, "timestamp", 5, 15);
            let sql = builder
                .build_query(
                    &events(),
                    "user_id",
                    ColumnType::Integer,
                    &range(),
                    Mode::Percentiles { intervals: 10 },
                )
                .unwrap();
            assert!(sql.contains("THEN 0.1\n"), "{}", sql);
            assert!(sql.contains("THEN 0.000000000001\n"), "{}", sql);
            // range check comes first so a constant slice never divides by zero
            let range_check = sql.find("range_value FROM derived_stats) = 0").unwrap();
            let min_check = sql.find("THEN 0.000000000001").unwrap();
            assert!(range_check < min_check);
            assert!(sql.contains("WHERE number_column >= 0"));
        }
    }

    #[test]
    fn redshift_percentiles_are_one_wide_row() {
        let builder = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15);
        let sql = builder
            .build_query(&events(), "user_id", ColumnType::Float, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(sql.contains(
            "NVL(percentile_cont(0.00) within group (order by normed_value), -1.0) AS ptile_value00"
        ));
        assert!(sql.contains(
            "NVL(percentile_cont(1.00) within group (order by normed_value), -1.0) AS ptile_value100"
        ));
        assert_eq!(sql.matches("percentile_cont(").count(), 11);
    }

    #[test]
    fn bigquery_percentiles_are_eleven_rows() {
        let builder = QueryBuilder::new(Dialect::BigQuery, "timestamp", 5, 15);
        let sql = builder
            .build_query(&events(), "user_id", ColumnType::Float, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(sql.contains("APPROX_QUANTILES(normed_value, 10) AS ptiles"));
        assert_eq!(sql.matches("UNION ALL").count(), 10);
        assert!(sql.contains("WHEN ptiles[OFFSET(10)] IS NULL THEN -1.0"));
        assert!(sql.contains("0.50 AS ptile"));
    }

    #[test]
    fn string_hash_offsets_differ_by_dialect() {
        let rs = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15)
            .build_query(&events(), "name", ColumnType::String, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(rs.contains("SUBSTRING(event_column,0,5) AS string_column"));
        assert!(rs.contains("STRTOL(SUBSTRING(MD5(string_column),0,15), 16) AS number_column"));

        let bq = QueryBuilder::new(Dialect::BigQuery, "timestamp", 5, 15)
            .build_query(&events(), "name", ColumnType::String, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(bq.contains("SUBSTR(event_column,0,4) AS string_column"));
        assert!(bq.contains("CAST(CONCAT('0x', SUBSTR(TO_HEX(MD5(string_column)),0,14)) AS INT64)"));
    }

    #[test]
    fn tail_substring_reverses() {
        let sql = QueryBuilder::new(Dialect::Redshift, "timestamp", -5, 15)
            .build_query(&events(), "name", ColumnType::String, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(sql.contains("SUBSTRING(reverse(event_column),0,5)"));
    }

    #[test]
    fn basic_stats_convert_booleans() {
        let sql = QueryBuilder::new(Dialect::BigQuery, "timestamp", 5, 15)
            .build_query(&events(), "is_active", ColumnType::Boolean, &range(), Mode::BasicStats)
            .unwrap();
        assert!(sql.contains("WHEN true  THEN 1"));
        assert!(sql.contains("countif(event_column IS NULL) AS null_count"));
    }

    #[test]
    fn timestamps_use_epoch_seconds() {
        let rs = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15)
            .build_query(&events(), "created", ColumnType::Timestamp, &range(), Mode::Percentiles { intervals: 10 })
            .unwrap();
        assert!(rs.contains("extract(epoch from event_column) AS number_column"));
    }

    #[test]
    fn build_query_is_pure() {
        let builder = QueryBuilder::new(Dialect::BigQuery, "timestamp", 5, 15);
        let build = || {
            builder
                .build_query(&events(), "name", ColumnType::String, &range(), Mode::Percentiles { intervals: 10 })
                .unwrap()
        };
        assert_eq!(build(), build());
        assert_eq!(fingerprint(&build()), fingerprint(&build()));
        assert_eq!(fingerprint(&build()).len(), 12);
    }

    #[test]
    fn zero_intervals_rejected() {
        let builder = QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15);
        let result = builder.build_query(
            &events(),
            "user_id",
            ColumnType::Integer,
            &range(),
            Mode::Percentiles { intervals: 0 },
        );
        assert!(matches!(result, Err(QueryError::InvalidParameter(_))));
    }

    #[test]
    fn wide_column_names() {
        assert_eq!(wide_percentile_column(0, 10), "ptile_value00");
        assert_eq!(wide_percentile_column(3, 10), "ptile_value30");
        assert_eq!(wide_percentile_column(10, 10), "ptile_value100");
        let points = percentile_points(10);
        assert_eq!(points.len(), 11);
        assert_eq!(points[10], (10, 1.0));
    }
}
