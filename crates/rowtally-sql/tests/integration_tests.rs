//! Both dialects must build the same pipeline for the same column

use rowtally_core::{ColumnType, DayRange};
use rowtally_sql::{Dialect, Mode, QueryBuilder, TableRef};

const TYPES: [ColumnType; 5] = [
    ColumnType::Integer,
    ColumnType::Float,
    ColumnType::String,
    ColumnType::Boolean,
    ColumnType::Timestamp,
];

fn builders() -> (QueryBuilder, QueryBuilder) {
    (
        QueryBuilder::new(Dialect::Redshift, "timestamp", 5, 15),
        QueryBuilder::new(Dialect::BigQuery, "timestamp", 5, 15),
    )
}

#[test]
fn dialects_share_cte_chain() {
    let (rs, bq) = builders();
    let table = TableRef::new("bora", "events").unwrap();
    let days = DayRange::parse("2020-01-01", "2020-01-07").unwrap();

    for column_type in TYPES {
        let rs_plan = rs
            .plan(&table, "value", column_type, &days, Mode::Percentiles { intervals: 10 })
            .unwrap();
        let mut bq_names = bq
            .plan(&table, "value", column_type, &days, Mode::Percentiles { intervals: 10 })
            .unwrap()
            .cte_names();
        // BigQuery collects the quantiles in one extra CTE
        assert_eq!(bq_names.pop(), Some("derived_percentiles"));
        assert_eq!(rs_plan.cte_names(), bq_names, "{:?}", column_type);
    }
}

#[test]
fn every_point_is_projected() {
    let (rs, bq) = builders();
    let table = TableRef::new("bora", "events").unwrap();
    let days = DayRange::parse("2020-01-01", "2020-01-07").unwrap();

    let rs_sql = rs
        .build_query(&table, "value", ColumnType::Integer, &days, Mode::Percentiles { intervals: 10 })
        .unwrap();
    let bq_sql = bq
        .build_query(&table, "value", ColumnType::Integer, &days, Mode::Percentiles { intervals: 10 })
        .unwrap();

    for point in ["0.00", "0.10", "0.20", "0.30", "0.40", "0.50", "0.60", "0.70", "0.80", "0.90", "1.00"] {
        assert!(rs_sql.contains(&format!("percentile_cont({})", point)), "{}", point);
        assert!(bq_sql.contains(&format!("{} AS ptile", point)), "{}", point);
    }
}

#[test]
fn invalid_column_is_rejected() {
    let (rs, _) = builders();
    let table = TableRef::new("bora", "events").unwrap();
    let days = DayRange::parse("2020-01-01", "2020-01-07").unwrap();
    assert!(rs
        .build_query(&table, "x; DROP TABLE y", ColumnType::Integer, &days, Mode::BasicStats)
        .is_err());
}
