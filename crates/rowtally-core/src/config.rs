//! Configuration schema (rowtally.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The two warehouses being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    /// Row-oriented warehouse (Amazon Redshift)
    Redshift,

    /// Columnar cloud warehouse (Google BigQuery)
    BigQuery,
}

impl WarehouseKind {
    /// Short tag used in artifact names
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Redshift => "rs",
            Self::BigQuery => "bq",
        }
    }
}

impl std::fmt::Display for WarehouseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redshift => write!(f, "Redshift"),
            Self::BigQuery => write!(f, "BigQuery"),
        }
    }
}

/// Parameters of the extraction queries and worker pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractionSettings {
    /// Characters of a string value that are hashed, in Redshift
    /// `SUBSTRING` units. Negative values take the tail of the string.
    pub substr_size: i32,

    /// Hex digits kept from the MD5 digest, in Redshift `SUBSTRING` units
    pub hash_size: u32,

    /// Number of quantile intervals; the output has `percentiles + 1` points.
    /// Must divide 100.
    pub percentiles: u32,

    /// Concurrent column queries per table
    pub stats_workers: usize,

    /// Concurrent per-table row count queries
    pub count_workers: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            substr_size: 5,
            hash_size: 15,
            percentiles: 10,
            stats_workers: 16,
            count_workers: 8,
        }
    }
}

impl ExtractionSettings {
    /// Reject quantile layouts whose points are not whole percents
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.percentiles == 0 || self.percentiles > 100 || 100 % self.percentiles != 0 {
            return Err(ConfigError::InvalidSetting {
                key: "extraction.percentiles".to_string(),
                reason: format!("{} does not divide 100", self.percentiles),
            });
        }
        Ok(())
    }
}

/// Table and column filters applied during discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Column names that mark a table as time-partitioned
    #[serde(default = "default_time_columns")]
    pub time_columns: Vec<String>,

    /// Tables that are never processed
    #[serde(default)]
    pub ignore_tables: Vec<String>,

    /// When non-empty, only these tables are processed
    #[serde(default)]
    pub only_tables: Vec<String>,

    /// Columns removed from every table
    #[serde(default)]
    pub ignore_columns: Vec<String>,

    /// When non-empty, replaces every table's column list
    #[serde(default)]
    pub only_columns: Vec<String>,
}

fn default_time_columns() -> Vec<String> {
    vec!["timestamp".to_string()]
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            time_columns: default_time_columns(),
            ignore_tables: Vec::new(),
            only_tables: Vec::new(),
            ignore_columns: Vec::new(),
            only_columns: Vec::new(),
        }
    }
}

/// Redshift connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedshiftSettings {
    pub host: String,

    #[serde(default = "default_redshift_port")]
    pub port: u16,

    pub database: String,

    /// Schema holding the reconciled tables
    pub schema: String,

    pub user: String,

    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Use TLS for the connection
    #[serde(default)]
    pub tls: bool,

    #[serde(flatten)]
    pub filters: FilterSettings,

    /// Keys matching no setting, rejected on load
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

fn default_redshift_port() -> u16 {
    5439
}

/// BigQuery connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigQuerySettings {
    pub project_id: String,

    pub dataset: String,

    /// Service account key file; application default credentials when absent
    #[serde(default)]
    pub credentials: Option<PathBuf>,

    #[serde(flatten)]
    pub filters: FilterSettings,

    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

/// Settings for comparing two count series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiffSettings {
    /// Tables dropped from both series before joining
    #[serde(default)]
    pub ignore_tables: Vec<String>,
}

/// One project: the same data held by both warehouses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub redshift: Option<RedshiftSettings>,

    #[serde(default)]
    pub bigquery: Option<BigQuerySettings>,

    #[serde(default)]
    pub diff: DiffSettings,
}

impl ProjectConfig {
    /// Filters configured for one warehouse
    pub fn filters(&self, warehouse: WarehouseKind) -> Result<&FilterSettings, ConfigError> {
        match warehouse {
            WarehouseKind::Redshift => self.redshift().map(|s| &s.filters),
            WarehouseKind::BigQuery => self.bigquery().map(|s| &s.filters),
        }
    }

    pub fn redshift(&self) -> Result<&RedshiftSettings, ConfigError> {
        self.redshift
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSetting("redshift".to_string()))
    }

    pub fn bigquery(&self) -> Result<&BigQuerySettings, ConfigError> {
        self.bigquery
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSetting("bigquery".to_string()))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Query and pool parameters
    #[serde(default)]
    pub extraction: ExtractionSettings,

    /// Projects by name
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extraction: ExtractionSettings::default(),
            projects: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks serde cannot express: keys next to flattened filters and
    /// the quantile layout
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.extraction.validate()?;

        for (name, project) in &self.projects {
            if let Some(redshift) = &project.redshift {
                reject_unknown(&format!("projects.{}.redshift", name), &redshift.unknown)?;
            }
            if let Some(bigquery) = &project.bigquery {
                reject_unknown(&format!("projects.{}.bigquery", name), &bigquery.unknown)?;
            }
        }

        Ok(())
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Look up a project, failing on unknown names
    pub fn project(&self, name: &str) -> Result<&ProjectConfig, ConfigError> {
        self.projects
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProject(name.to_string()))
    }

    /// Resolve a path relative to the directory of the config file
    pub fn resolve_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

fn reject_unknown(section: &str, unknown: &BTreeMap<String, toml::Value>) -> Result<(), ConfigError> {
    match unknown.keys().next() {
        Some(key) => Err(ConfigError::UnknownKey {
            section: section.to_string(),
            key: key.clone(),
        }),
        None => Ok(()),
    }
}

/// Fatal configuration errors, raised before any query runs
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Unknown project '{0}'")]
    UnknownProject(String),

    #[error("Missing setting: {0}")]
    MissingSetting(String),

    #[error("Unknown key '{key}' in [{section}]")]
    UnknownKey { section: String, key: String },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("{warehouse} column {table}.{column} has unmapped type '{declared}'")]
    UnmappedType {
        warehouse: WarehouseKind,
        table: String,
        column: String,
        declared: String,
    },

    #[error("Table '{0}' is not in the catalog")]
    UnknownTable(String),

    #[error("No type known for column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("Day range starts after it ends: {start} > {end}")]
    InvertedDayRange { start: String, end: String },

    #[error("Invalid day '{value}': {reason}")]
    InvalidDay { value: String, reason: String },
}
