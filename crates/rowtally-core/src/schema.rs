//! Table and column descriptors with the closed column type system

use serde::{Deserialize, Serialize};

/// Declared column type, reduced to the classes the reconciliation cares about
///
/// Every warehouse type must map onto one of these variants. A type that
/// does not map is a configuration error raised by the catalog adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Integer-like (smallint, integer, bigint, INT64)
    Integer,

    /// Floating point (real, double precision, FLOAT64, numeric)
    Float,

    /// Character data
    String,

    /// Boolean
    Boolean,

    /// Timestamp or date
    Timestamp,
}

/// How a column value is moved into numeric space before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Value is already numeric
    Identity,

    /// true -> 1, false -> 0
    BooleanToInt,

    /// Seconds since the unix epoch
    EpochSeconds,

    /// Substring, MD5, truncated hex digest parsed as an integer
    StringHash,
}

impl ColumnType {
    /// Numeric conversion strategy for this type
    pub fn conversion(&self) -> Conversion {
        match self {
            Self::Integer | Self::Float => Conversion::Identity,
            Self::Boolean => Conversion::BooleanToInt,
            Self::Timestamp => Conversion::EpochSeconds,
            Self::String => Conversion::StringHash,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "FLOAT"),
            Self::String => write!(f, "STRING"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

/// Nullability state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nullability {
    /// Definitely nullable
    Yes,

    /// NOT NULL / REQUIRED
    No,

    /// Cannot determine nullability
    Unknown,
}

/// A column of a warehouse table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,

    /// Declared type
    pub column_type: ColumnType,

    /// Nullability
    pub nullable: Nullability,
}

impl Column {
    /// Create a new column with unknown nullability
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: Nullability::Unknown,
        }
    }

    /// Set nullability
    pub fn with_nullability(mut self, nullable: Nullability) -> Self {
        self.nullable = nullable;
        self
    }

    /// Whether the warehouse reports the column as NOT NULL / REQUIRED
    pub fn is_required(&self) -> bool {
        self.nullable == Nullability::No
    }
}

/// Physical partitioning reported by the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partitioning {
    /// Partitioned per calendar day
    Day,

    /// Not partitioned
    Whole,
}

/// A table as discovered by a catalog query
///
/// Built fresh on every catalog listing and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Owning dataset / schema
    pub dataset: String,

    /// Table name
    pub name: String,

    /// Columns in schema order
    pub columns: Vec<Column>,

    /// Physical partitioning
    pub partitioning: Partitioning,
}

impl TableDescriptor {
    /// Create an unpartitioned table descriptor
    pub fn new(dataset: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
            columns,
            partitioning: Partitioning::Whole,
        }
    }

    /// Set partitioning
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Find a column by name
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in schema order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// First column whose name is one of the configured time columns
    pub fn time_column<S: AsRef<str>>(&self, time_columns: &[S]) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| time_columns.iter().any(|t| t.as_ref() == c.name))
    }

    /// Whether the table has a qualifying time column
    pub fn is_time_partitioned<S: AsRef<str>>(&self, time_columns: &[S]) -> bool {
        self.time_column(time_columns).is_some()
    }

    /// The first REQUIRED column, else the first column in schema order
    ///
    /// Known caveat: when neither warehouse marks a column as required and the
    /// two report their columns in different orders, the two sides pick
    /// different columns and whole-table counts can differ on NULLs alone.
    pub fn required_or_any_column(&self) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.is_required())
            .or_else(|| self.columns.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> TableDescriptor {
        TableDescriptor::new(
            "bora",
            "events",
            vec![
                Column::new("insertid", ColumnType::String),
                Column::new("timestamp", ColumnType::Timestamp),
                Column::new("user_id", ColumnType::Integer).with_nullability(Nullability::No),
            ],
        )
    }

    #[test]
    fn conversion_per_type() {
        assert_eq!(ColumnType::Integer.conversion(), Conversion::Identity);
        assert_eq!(ColumnType::Float.conversion(), Conversion::Identity);
        assert_eq!(ColumnType::Boolean.conversion(), Conversion::BooleanToInt);
        assert_eq!(ColumnType::Timestamp.conversion(), Conversion::EpochSeconds);
        assert_eq!(ColumnType::String.conversion(), Conversion::StringHash);
    }

    #[test]
    fn required_column_wins() {
        assert_eq!(events().required_or_any_column().unwrap().name, "user_id");
    }

    #[test]
    fn first_column_without_required() {
        let table = TableDescriptor::new(
            "bora",
            "dim_weather",
            vec![
                Column::new("station", ColumnType::String).with_nullability(Nullability::Yes),
                Column::new("region", ColumnType::String),
            ],
        );
        assert_eq!(table.required_or_any_column().unwrap().name, "station");
    }

    // Order dependence is intentional: the same table listed in another
    // column order selects another column.
    #[test]
    fn any_column_depends_on_schema_order() {
        let a = TableDescriptor::new(
            "bora",
            "dim",
            vec![Column::new("a", ColumnType::String), Column::new("b", ColumnType::String)],
        );
        let b = TableDescriptor::new(
            "bora",
            "dim",
            vec![Column::new("b", ColumnType::String), Column::new("a", ColumnType::String)],
        );
        assert_ne!(
            a.required_or_any_column().unwrap().name,
            b.required_or_any_column().unwrap().name
        );
    }

    #[test]
    fn empty_table_has_no_column() {
        let table = TableDescriptor::new("bora", "empty", vec![]);
        assert!(table.required_or_any_column().is_none());
    }

    #[test]
    fn time_column_lookup() {
        let table = events();
        assert_eq!(table.time_column(&["timestamp"]).unwrap().name, "timestamp");
        assert!(table.is_time_partitioned(&["timestamp".to_string()]));
        assert!(!table.is_time_partitioned(&["event_time"]));
    }
}
