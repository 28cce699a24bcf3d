//! Row counts, day bounds, partition listing and copy statements

use rowtally_core::{DayRange, Partitioning, TableDescriptor};

use crate::dialect::{Dialect, TableRef};
use crate::template::QueryError;

/// Rows per day bucket over a day range: `(day_part, total_rows)`
pub fn count_daily(
    dialect: Dialect,
    table: &TableRef,
    time_column: &str,
    days: &DayRange,
) -> Result<String, QueryError> {
    let ts = dialect.quote_column(time_column)?;
    Ok(format!(
        "SELECT\n    {day} AS day_part,\n    count(*) AS total_rows\nFROM {table}\nWHERE {date} BETWEEN '{start}' AND '{end}'\nGROUP BY day_part\nORDER BY day_part",
        day = dialect.day_bucket(&ts),
        table = table.render(dialect),
        date = dialect.date_of(&ts),
        start = days.start(),
        end = days.end(),
    ))
}

/// Non-null values of one column over the whole table: `(total_rows)`
pub fn count_whole(dialect: Dialect, table: &TableRef, column: &str) -> Result<String, QueryError> {
    Ok(format!(
        "SELECT\n    count({}) AS total_rows\nFROM {}",
        dialect.quote_column(column)?,
        table.render(dialect)
    ))
}

/// First and last day strictly before today: `(min_day, max_day)`
pub fn day_bounds(dialect: Dialect, table: &TableRef, time_column: &str) -> Result<String, QueryError> {
    let ts = dialect.quote_column(time_column)?;
    let date = dialect.date_of(&ts);
    Ok(format!(
        "SELECT\n    MIN({date}) AS min_day,\n    MAX({date}) AS max_day\nFROM {table}\nWHERE {date} < {today}",
        date = date,
        table = table.render(dialect),
        today = dialect.current_date(),
    ))
}

/// Daily partition identifiers of a table: `(partition_id)`
pub fn list_partitions(dialect: Dialect, table: &TableRef) -> Result<String, QueryError> {
    match dialect {
        Dialect::BigQuery => Ok(format!(
            "SELECT\n    partition_id\nFROM {}\nWHERE table_name = '{}'\nAND partition_id NOT IN ('__NULL__', '__UNPARTITIONED__')\nORDER BY partition_id",
            table.dataset_view(dialect, "INFORMATION_SCHEMA.PARTITIONS"),
            table.table()
        )),
        Dialect::Redshift => Err(QueryError::Unsupported {
            dialect,
            statement: "partition listing".to_string(),
        }),
    }
}

/// Create `dest` with the columns of `source` minus `exclude`
///
/// Day partitioned BigQuery tables are created partitioned by ingestion day
/// so that partitions can be reloaded one at a time.
pub fn create_like(
    dialect: Dialect,
    dest: &TableRef,
    source: &TableDescriptor,
    exclude: &[String],
) -> Result<String, QueryError> {
    let columns = source
        .columns
        .iter()
        .filter(|c| !exclude.contains(&c.name))
        .map(|c| {
            let not_null = if c.is_required() { " NOT NULL" } else { "" };
            Ok(format!(
                "    {} {}{}",
                dialect.quote_column(&c.name)?,
                dialect.type_name(c.column_type),
                not_null
            ))
        })
        .collect::<Result<Vec<_>, QueryError>>()?;

    if columns.is_empty() {
        return Err(QueryError::InvalidParameter(format!(
            "table {} has no columns to copy",
            source.name
        )));
    }

    let partition = match (dialect, source.partitioning) {
        (Dialect::BigQuery, Partitioning::Day) => "\nPARTITION BY _PARTITIONDATE",
        _ => "",
    };

    Ok(format!(
        "CREATE TABLE {} (\n{}\n){}",
        dest.render(dialect),
        columns.join(",\n"),
        partition
    ))
}

/// Copy the given columns from `source` into `dest`, optionally one daily
/// partition (`YYYYMMDD`) at a time
pub fn insert_select(
    dialect: Dialect,
    dest: &TableRef,
    source: &TableRef,
    columns: &[String],
    partition: Option<&str>,
) -> Result<String, QueryError> {
    if columns.is_empty() {
        return Err(QueryError::InvalidParameter(format!(
            "no columns to copy from {}",
            source
        )));
    }
    let quoted = columns
        .iter()
        .map(|c| dialect.quote_column(c))
        .collect::<Result<Vec<_>, QueryError>>()?
        .join(", ");

    match (dialect, partition) {
        (_, None) => Ok(format!(
            "INSERT INTO {dest} ({cols})\nSELECT {cols}\nFROM {source}",
            dest = dest.render(dialect),
            source = source.render(dialect),
            cols = quoted
        )),
        (Dialect::BigQuery, Some(partition)) => {
            if partition.len() != 8 || !partition.bytes().all(|b| b.is_ascii_digit()) {
                return Err(QueryError::InvalidParameter(format!(
                    "partition id '{}' is not a day",
                    partition
                )));
            }
            Ok(format!(
                "INSERT INTO {dest} (_PARTITIONTIME, {cols})\nSELECT _PARTITIONTIME, {cols}\nFROM {source}\nWHERE _PARTITIONTIME = PARSE_TIMESTAMP('%Y%m%d', '{partition}')",
                dest = dest.render(dialect),
                source = source.render(dialect),
                cols = quoted,
                partition = partition
            ))
        }
        (Dialect::Redshift, Some(_)) => Err(QueryError::Unsupported {
            dialect,
            statement: "partition decorated insert".to_string(),
        }),
    }
}

pub fn drop_table(dialect: Dialect, table: &TableRef) -> String {
    format!("DROP TABLE {}", table.render(dialect))
}

/// Probe query used to check a connection
pub fn probe() -> &'static str {
    "SELECT 1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowtally_core::{Column, ColumnType, Nullability};

    fn events() -> TableRef {
        TableRef::new("bora", "events").unwrap()
    }

    #[test]
    fn daily_count_groups_by_day_bucket() {
        let days = DayRange::parse("20200101", "20200102").unwrap();
        let sql = count_daily(Dialect::BigQuery, &events(), "timestamp", &days).unwrap();
        assert_eq!(
            sql,
            "SELECT\n    format_date('%Y%m%d', DATE(`timestamp`)) AS day_part,\n    count(*) AS total_rows\nFROM `bora.events`\nWHERE DATE(`timestamp`) BETWEEN '2020-01-01' AND '2020-01-02'\nGROUP BY day_part\nORDER BY day_part"
        );
    }

    #[test]
    fn whole_count_counts_one_column() {
        let sql = count_whole(Dialect::Redshift, &events(), "user_id").unwrap();
        assert_eq!(sql, "SELECT\n    count(\"user_id\") AS total_rows\nFROM \"bora\".\"events\"");
    }

    #[test]
    fn day_bounds_exclude_today() {
        let sql = day_bounds(Dialect::Redshift, &events(), "timestamp").unwrap();
        assert!(sql.contains("WHERE date(\"timestamp\") < current_date"));
        let sql = day_bounds(Dialect::BigQuery, &events(), "timestamp").unwrap();
        assert!(sql.contains("< CURRENT_DATE()"));
    }

    #[test]
    fn partitions_only_on_bigquery() {
        let table = events().in_project("zephyrus-prod-bora").unwrap();
        let sql = list_partitions(Dialect::BigQuery, &table).unwrap();
        assert!(sql.contains("FROM `zephyrus-prod-bora.bora.INFORMATION_SCHEMA.PARTITIONS`"));
        assert!(sql.contains("table_name = 'events'"));
        assert!(matches!(
            list_partitions(Dialect::Redshift, &events()),
            Err(QueryError::Unsupported { .. })
        ));
    }

    #[test]
    fn create_like_drops_excluded_columns() {
        let source = TableDescriptor::new(
            "bora",
            "events",
            vec![
                Column::new("insertid", ColumnType::String),
                Column::new("user_id", ColumnType::Integer).with_nullability(Nullability::No),
                Column::new("timestamp", ColumnType::Timestamp),
            ],
        )
        .with_partitioning(Partitioning::Day);
        let dest = events().sibling("events_copy").unwrap();
        let sql = create_like(Dialect::BigQuery, &dest, &source, &["insertid".to_string()]).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE `bora.events_copy` (\n    `user_id` INT64 NOT NULL,\n    `timestamp` TIMESTAMP\n)\nPARTITION BY _PARTITIONDATE"
        );
    }

    #[test]
    fn insert_select_per_partition() {
        let dest = events().sibling("events_backup").unwrap();
        let cols = vec!["user_id".to_string()];
        let sql = insert_select(Dialect::BigQuery, &dest, &events(), &cols, Some("20200101")).unwrap();
        assert!(sql.contains("WHERE _PARTITIONTIME = PARSE_TIMESTAMP('%Y%m%d', '20200101')"));
        assert!(insert_select(Dialect::BigQuery, &dest, &events(), &cols, Some("2020'--")).is_err());
        assert!(insert_select(Dialect::Redshift, &dest, &events(), &cols, Some("20200101")).is_err());

        let sql = insert_select(Dialect::Redshift, &dest, &events(), &cols, None).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"bora\".\"events_backup\" (\"user_id\")\nSELECT \"user_id\"\nFROM \"bora\".\"events\""
        );
    }
}
