//! Warehouse dialects, identifier quoting and table references

use regex::Regex;
use rowtally_core::{ColumnType, ExtractionSettings, WarehouseKind};
use std::fmt;
use std::sync::OnceLock;

use crate::template::QueryError;

/// SQL dialect of a warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Row-oriented warehouse (Redshift, PostgreSQL wire protocol)
    Redshift,

    /// Columnar cloud warehouse (BigQuery standard SQL)
    BigQuery,
}

impl Dialect {
    /// Quote a column name
    pub fn quote_column(&self, name: &str) -> Result<String, QueryError> {
        let name = validate_name(name, "column")?;
        Ok(match self {
            Self::Redshift => format!("\"{}\"", name),
            Self::BigQuery => format!("`{}`", name),
        })
    }

    /// Declared type used when creating a table
    pub fn type_name(&self, column_type: ColumnType) -> &'static str {
        match (self, column_type) {
            (Self::Redshift, ColumnType::Integer) => "BIGINT",
            (Self::Redshift, ColumnType::Float) => "DOUBLE PRECISION",
            (Self::Redshift, ColumnType::String) => "VARCHAR(65535)",
            (Self::Redshift, ColumnType::Boolean) => "BOOLEAN",
            (Self::Redshift, ColumnType::Timestamp) => "TIMESTAMP",
            (Self::BigQuery, ColumnType::Integer) => "INT64",
            (Self::BigQuery, ColumnType::Float) => "FLOAT64",
            (Self::BigQuery, ColumnType::String) => "STRING",
            (Self::BigQuery, ColumnType::Boolean) => "BOOL",
            (Self::BigQuery, ColumnType::Timestamp) => "TIMESTAMP",
        }
    }

    /// Float cast of a numeric expression
    pub(crate) fn to_float(&self, expr: &str) -> String {
        match self {
            Self::Redshift => format!("{}::float", expr),
            Self::BigQuery => format!("CAST({} AS FLOAT64)", expr),
        }
    }

    /// Calendar date of a timestamp expression
    pub(crate) fn date_of(&self, expr: &str) -> String {
        match self {
            Self::Redshift => format!("date({})", expr),
            Self::BigQuery => format!("DATE({})", expr),
        }
    }

    /// 8-digit YYYYMMDD day bucket of a timestamp expression
    pub(crate) fn day_bucket(&self, expr: &str) -> String {
        match self {
            Self::Redshift => format!("to_char({}, 'YYYYMMDD')", expr),
            Self::BigQuery => format!("format_date('%Y%m%d', DATE({}))", expr),
        }
    }

    pub(crate) fn current_date(&self) -> &'static str {
        match self {
            Self::Redshift => "current_date",
            Self::BigQuery => "CURRENT_DATE()",
        }
    }
}

impl From<WarehouseKind> for Dialect {
    fn from(kind: WarehouseKind) -> Self {
        match kind {
            WarehouseKind::Redshift => Self::Redshift,
            WarehouseKind::BigQuery => Self::BigQuery,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redshift => write!(f, "Redshift"),
            Self::BigQuery => write!(f, "BigQuery"),
        }
    }
}

static NAME_RE: OnceLock<Regex> = OnceLock::new();
static PROJECT_RE: OnceLock<Regex> = OnceLock::new();

fn name_pattern() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid name regex"))
}

fn project_pattern() -> &'static Regex {
    PROJECT_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9.:-]*[a-z0-9]$").expect("valid project regex"))
}

/// Accept table, dataset and column names that need no escaping
pub fn validate_name<'a>(name: &'a str, kind: &str) -> Result<&'a str, QueryError> {
    if name_pattern().is_match(name) {
        Ok(name)
    } else {
        Err(QueryError::InvalidIdentifier {
            kind: kind.to_string(),
            value: name.to_string(),
        })
    }
}

/// Accept a cloud project identifier such as `acme-data`
pub fn validate_project(project: &str) -> Result<&str, QueryError> {
    if project_pattern().is_match(project) {
        Ok(project)
    } else {
        Err(QueryError::InvalidIdentifier {
            kind: "project".to_string(),
            value: project.to_string(),
        })
    }
}

/// Fully qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    project: Option<String>,
    dataset: String,
    table: String,
}

impl TableRef {
    /// `dataset.table`, both validated
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Result<Self, QueryError> {
        let dataset = dataset.into();
        let table = table.into();
        validate_name(&dataset, "dataset")?;
        validate_name(&table, "table")?;
        Ok(Self {
            project: None,
            dataset,
            table,
        })
    }

    /// Qualify with a cloud project (BigQuery)
    pub fn in_project(mut self, project: impl Into<String>) -> Result<Self, QueryError> {
        let project = project.into();
        validate_project(&project)?;
        self.project = Some(project);
        Ok(self)
    }

    /// Same dataset and project, another table
    pub fn sibling(&self, table: impl Into<String>) -> Result<Self, QueryError> {
        let table = table.into();
        validate_name(&table, "table")?;
        Ok(Self {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// Quoted reference in the given dialect
    pub fn render(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Redshift => format!("\"{}\".\"{}\"", self.dataset, self.table),
            Dialect::BigQuery => match &self.project {
                Some(project) => format!("`{}.{}.{}`", project, self.dataset, self.table),
                None => format!("`{}.{}`", self.dataset, self.table),
            },
        }
    }

    /// Quoted reference to a dataset level view such as `INFORMATION_SCHEMA.PARTITIONS`
    pub(crate) fn dataset_view(&self, dialect: Dialect, view: &str) -> String {
        match (dialect, &self.project) {
            (Dialect::BigQuery, Some(project)) => format!("`{}.{}.{}`", project, self.dataset, view),
            (Dialect::BigQuery, None) => format!("`{}.{}`", self.dataset, view),
            (Dialect::Redshift, _) => view.to_lowercase(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}.{}", project, self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

/// Substring and digest sizes of the string-to-number conversion
///
/// Sizes are configured in Redshift `SUBSTRING` units. BigQuery `SUBSTR`
/// counts one further for the same start offset, so both sizes shrink by one
/// unit there. A negative `substr` takes characters from the end of the
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringHash {
    pub substr: i32,
    pub hash_len: u32,
}

impl StringHash {
    /// Parameters for a dialect from Redshift-unit sizes
    pub fn for_dialect(dialect: Dialect, substr: i32, hash_len: u32) -> Self {
        match dialect {
            Dialect::Redshift => Self { substr, hash_len },
            Dialect::BigQuery => Self {
                substr: substr.signum() * (substr.abs() - 1).max(0),
                hash_len: hash_len.saturating_sub(1),
            },
        }
    }

    /// Parameters from the configured extraction settings
    pub fn from_settings(dialect: Dialect, settings: &ExtractionSettings) -> Self {
        Self::for_dialect(dialect, settings.substr_size, settings.hash_size)
    }

    /// Whether the substring is taken from the reversed string
    pub fn from_tail(&self) -> bool {
        self.substr < 0
    }

    /// Characters taken from the string
    pub fn length(&self) -> u32 {
        self.substr.unsigned_abs()
    }
}
