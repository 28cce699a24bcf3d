//! Warehouse client capability and result rows

use rowtally_core::{Column, ColumnType, ConfigError, Nullability, Partitioning, TableDescriptor, WarehouseKind};
use rowtally_sql::{Dialect, QueryError, TableRef};
use std::collections::BTreeMap;
use std::fmt;

/// A single value of a result row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view; text is parsed, integral floats are accepted
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            }
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text rendering, `None` for NULL
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row of a query result, with its column names
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<V: Into<Value> + Clone>(pairs: &[(&str, V)]) -> Self {
        Self {
            columns: pairs.iter().map(|(c, _)| c.to_string()).collect(),
            values: pairs.iter().map(|(_, v)| v.clone().into()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by case-insensitive column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Text of a named column, failing when the column is absent
    pub fn text(&self, name: &str) -> Result<Option<String>, FetchError> {
        self.get_by_name(name)
            .map(Value::as_text)
            .ok_or_else(|| FetchError::InvalidResponse(format!("missing column '{}'", name)))
    }
}

/// Errors raised by warehouse clients
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job {job} did not finish after {attempts} polls")]
    JobTimeout { job: String, attempts: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl FetchError {
    /// Configuration errors abort a run before any query
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Config(_) | FetchError::ConfigError(_))
    }
}

/// Query execution and catalog access for one warehouse
///
/// One client is shared read-only by every worker of a run.
#[async_trait::async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Client name (e.g., "Redshift", "BigQuery")
    fn name(&self) -> &'static str;

    /// SQL dialect spoken by the warehouse
    fn dialect(&self) -> Dialect;

    /// Dataset (schema) the client works in
    fn dataset(&self) -> &str;

    /// Fully qualified reference to a table of the client's dataset
    fn table_ref(&self, table: &str) -> Result<TableRef, FetchError>;

    /// All tables of a dataset with their columns in schema order
    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableDescriptor>, FetchError>;

    /// Run a query and collect its rows
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, FetchError>;

    /// Check the connection before extraction
    async fn test_connection(&self) -> Result<(), FetchError>;
}

/// Build table descriptors from catalog rows
///
/// Rows carry `table_name`, `column_name`, `data_type`, `is_nullable` and
/// optionally `is_partitioning_column`, ordered by table then column
/// position. Columns named `_PARTITION*` are partitioning pseudo columns: they
/// mark the table as day partitioned and are not listed.
pub fn assemble_tables(
    warehouse: WarehouseKind,
    dataset: &str,
    rows: &[Row],
    map_type: fn(&str) -> Option<ColumnType>,
) -> Result<Vec<TableDescriptor>, FetchError> {
    let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();

    for row in rows {
        let table = required_text(row, "table_name")?;
        let column = required_text(row, "column_name")?;
        let declared = required_text(row, "data_type")?;

        let entry = tables
            .entry(table.clone())
            .or_insert_with(|| TableDescriptor::new(dataset, table.clone(), Vec::new()));

        let partitioning = row
            .get_by_name("is_partitioning_column")
            .and_then(Value::as_text)
            .map(|v| v.eq_ignore_ascii_case("YES"))
            .unwrap_or(false);
        if partitioning {
            entry.partitioning = Partitioning::Day;
        }
        if column.starts_with("_PARTITION") {
            continue;
        }

        let column_type = map_type(&declared).ok_or_else(|| ConfigError::UnmappedType {
            warehouse,
            table: table.clone(),
            column: column.clone(),
            declared: declared.clone(),
        })?;

        let nullable = match row.text("is_nullable")?.as_deref().map(str::to_uppercase).as_deref() {
            Some("YES") => Nullability::Yes,
            Some("NO") => Nullability::No,
            _ => Nullability::Unknown,
        };

        entry.columns.push(Column::new(column, column_type).with_nullability(nullable));
    }

    Ok(tables.into_values().collect())
}

fn required_text(row: &Row, name: &str) -> Result<String, FetchError> {
    row.text(name)?
        .ok_or_else(|| FetchError::InvalidResponse(format!("NULL in column '{}'", name)))
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<String> = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| format!("{}={}", c, v.as_text().unwrap_or_else(|| "NULL".to_string())))
            .collect();
        write!(f, "{}", cells.join(", "))
    }
}
