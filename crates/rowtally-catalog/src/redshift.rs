//! Redshift client over the PostgreSQL wire protocol
//!
//! Queries run through the simple query protocol, so every value comes back
//! as text and is converted by the extractors. Table listings read
//! `information_schema.columns` of the configured schema.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let settings = config.project("bora")?.redshift()?;
//! let password = std::env::var("REDSHIFT_PASSWORD")?;
//! let client = RedshiftClient::from_settings(settings, &password).await?;
//! let tables = client.list_tables(client.dataset()).await?;
//! ```

use crate::adapter::{assemble_tables, FetchError, Row, WarehouseClient};
use rowtally_core::{ColumnType, RedshiftSettings, TableDescriptor, WarehouseKind};
use rowtally_sql::{statements, validate_name, Dialect, TableRef};

#[cfg(feature = "redshift")]
use crate::adapter::Value;

#[cfg(feature = "redshift")]
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

#[cfg(feature = "redshift")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "redshift")]
use native_tls::TlsConnector;

/// Redshift warehouse client
pub struct RedshiftClient {
    #[cfg(feature = "redshift")]
    client: Client,

    host: String,
    port: u16,
    database: String,

    /// Schema queried and listed by this client
    schema: String,
}

impl RedshiftClient {
    /// Connect with the settings of a project and the resolved password
    pub async fn from_settings(settings: &RedshiftSettings, password: &str) -> Result<Self, FetchError> {
        if settings.tls {
            Self::connect_with_tls(settings, password).await
        } else {
            Self::connect(settings, password).await
        }
    }

    #[cfg(feature = "redshift")]
    pub async fn connect(settings: &RedshiftSettings, password: &str) -> Result<Self, FetchError> {
        let (client, connection) = tokio_postgres::connect(&connection_string(settings, password), NoTls)
            .await
            .map_err(|e| {
                FetchError::AuthenticationError(format!(
                    "Failed to connect to Redshift at {}:{}: {}",
                    settings.host, settings.port, e
                ))
            })?;

        let host = settings.host.clone();
        let port = settings.port;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(%host, port, error = %e, "Redshift connection closed");
            }
        });

        Self::with_client(client, settings)
    }

    #[cfg(not(feature = "redshift"))]
    pub async fn connect(_settings: &RedshiftSettings, _password: &str) -> Result<Self, FetchError> {
        Err(not_compiled())
    }

    #[cfg(feature = "redshift")]
    pub async fn connect_with_tls(settings: &RedshiftSettings, password: &str) -> Result<Self, FetchError> {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| FetchError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(&connection_string(settings, password), tls)
            .await
            .map_err(|e| {
                FetchError::AuthenticationError(format!(
                    "Failed to connect to Redshift at {}:{} with TLS: {}",
                    settings.host, settings.port, e
                ))
            })?;

        let host = settings.host.clone();
        let port = settings.port;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(%host, port, error = %e, "Redshift TLS connection closed");
            }
        });

        Self::with_client(client, settings)
    }

    #[cfg(not(feature = "redshift"))]
    pub async fn connect_with_tls(_settings: &RedshiftSettings, _password: &str) -> Result<Self, FetchError> {
        Err(not_compiled())
    }

    #[cfg(feature = "redshift")]
    fn with_client(client: Client, settings: &RedshiftSettings) -> Result<Self, FetchError> {
        validate_name(&settings.schema, "schema")?;
        Ok(Self {
            client,
            host: settings.host.clone(),
            port: settings.port,
            database: settings.database.clone(),
            schema: settings.schema.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Catalog query for the columns of a schema, in table then position order
    pub fn columns_query(schema: &str) -> Result<String, FetchError> {
        let schema = validate_name(schema, "schema")?;
        Ok(format!(
            "SELECT table_name, column_name, data_type, is_nullable\n\
             FROM information_schema.columns\n\
             WHERE table_schema = '{}'\n\
             ORDER BY table_name, ordinal_position",
            schema
        ))
    }
}

/// Map a declared Redshift type to a column type
///
/// Precision and length arguments are ignored. Types outside the five
/// extraction types map to `None`.
pub fn map_redshift_type(declared: &str) -> Option<ColumnType> {
    let base = declared
        .split('(')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_lowercase();

    match base.as_str() {
        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" => Some(ColumnType::Integer),
        "real" | "float4" | "double precision" | "float8" | "float" | "numeric" | "decimal" => {
            Some(ColumnType::Float)
        }
        "character varying" | "varchar" | "character" | "char" | "bpchar" | "text" | "nvarchar" => {
            Some(ColumnType::String)
        }
        "boolean" | "bool" => Some(ColumnType::Boolean),
        "timestamp without time zone" | "timestamp" | "timestamp with time zone" | "timestamptz" | "date" => {
            Some(ColumnType::Timestamp)
        }
        _ => None,
    }
}

#[cfg(feature = "redshift")]
fn connection_string(settings: &RedshiftSettings, password: &str) -> String {
    format!(
        "host={} port={} dbname={} user={} password={}",
        settings.host, settings.port, settings.database, settings.user, password
    )
}

#[cfg(feature = "redshift")]
fn classify(error: tokio_postgres::Error) -> FetchError {
    let message = error.to_string();
    if message.contains("does not exist") {
        FetchError::TableNotFound(message)
    } else if message.contains("permission denied") {
        FetchError::PermissionDenied(message)
    } else if error.is_closed() {
        FetchError::NetworkError(message)
    } else {
        FetchError::QueryError(message)
    }
}

#[cfg(not(feature = "redshift"))]
fn not_compiled() -> FetchError {
    FetchError::ConfigError(
        "Redshift support not compiled. Rebuild with: cargo build --features redshift".to_string(),
    )
}

#[async_trait::async_trait]
impl WarehouseClient for RedshiftClient {
    fn name(&self) -> &'static str {
        "Redshift"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Redshift
    }

    fn dataset(&self) -> &str {
        &self.schema
    }

    fn table_ref(&self, table: &str) -> Result<TableRef, FetchError> {
        Ok(TableRef::new(self.schema.clone(), table)?)
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableDescriptor>, FetchError> {
        let rows = self.execute(&Self::columns_query(dataset)?).await?;
        assemble_tables(WarehouseKind::Redshift, dataset, &rows, map_redshift_type)
    }

    #[cfg(feature = "redshift")]
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, FetchError> {
        let messages = self.client.simple_query(sql).await.map_err(classify)?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
                let values = (0..columns.len())
                    .map(|i| row.get(i).map(|v| Value::Text(v.to_string())).unwrap_or(Value::Null))
                    .collect();
                rows.push(Row::new(columns, values));
            }
        }
        Ok(rows)
    }

    #[cfg(not(feature = "redshift"))]
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>, FetchError> {
        Err(not_compiled())
    }

    async fn test_connection(&self) -> Result<(), FetchError> {
        self.execute(statements::probe()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_redshift_types() {
        assert_eq!(map_redshift_type("bigint"), Some(ColumnType::Integer));
        assert_eq!(map_redshift_type("numeric(18,2)"), Some(ColumnType::Float));
        assert_eq!(map_redshift_type("character varying(256)"), Some(ColumnType::String));
        assert_eq!(map_redshift_type("BOOLEAN"), Some(ColumnType::Boolean));
        assert_eq!(map_redshift_type("timestamp without time zone"), Some(ColumnType::Timestamp));
        assert_eq!(map_redshift_type("date"), Some(ColumnType::Timestamp));
        assert_eq!(map_redshift_type("super"), None);
        assert_eq!(map_redshift_type("geometry"), None);
    }

    #[test]
    fn test_columns_query() {
        let sql = RedshiftClient::columns_query("bora").unwrap();
        assert!(sql.contains("table_schema = 'bora'"));
        assert!(sql.contains("ORDER BY table_name, ordinal_position"));
        assert!(RedshiftClient::columns_query("bora' OR '1'='1").is_err());
    }

    #[cfg(not(feature = "redshift"))]
    #[tokio::test]
    async fn test_connect_without_feature() {
        let settings: RedshiftSettings = rowtally_core::Config::from_toml(
            r#"
            [projects.bora.redshift]
            host = "localhost"
            database = "dev"
            schema = "bora"
            user = "loader"
            "#,
        )
        .unwrap()
        .project("bora")
        .unwrap()
        .redshift()
        .unwrap()
        .clone();

        match RedshiftClient::from_settings(&settings, "secret").await {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("connected without the redshift feature"),
        }
    }
}
