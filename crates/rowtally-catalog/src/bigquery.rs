//! BigQuery client using the jobs API
//!
//! Queries run as query jobs. A job that is not complete in the first
//! response is polled with [`JobPoller`] until it finishes, then every result
//! page is read by following its page token. Table listings read
//! `INFORMATION_SCHEMA.COLUMNS` of the configured dataset, including the
//! partitioning pseudo columns.
//!
//! ## Authentication
//!
//! 1. Service account JSON file (explicit path in the project settings)
//! 2. Application Default Credentials (ADC)
//!
//! ## Usage
//!
//! ```rust,ignore
//! let settings = config.project("bora")?.bigquery()?;
//! let client = BigQueryClient::from_settings(settings).await?;
//! let rows = client.execute("SELECT 1").await?;
//! ```

use crate::adapter::{assemble_tables, FetchError, Row, WarehouseClient};
use crate::job::JobPoller;
use rowtally_core::{BigQuerySettings, ColumnType, TableDescriptor, WarehouseKind};
use rowtally_sql::{statements, validate_name, validate_project, Dialect, TableRef};

#[cfg(any(feature = "bigquery", test))]
use std::future::Future;

#[cfg(feature = "bigquery")]
use crate::adapter::Value;

#[cfg(feature = "bigquery")]
use crate::job::JobState;

#[cfg(feature = "bigquery")]
use gcp_bigquery_client::{
    model::{
        get_query_results_parameters::GetQueryResultsParameters,
        job_reference::JobReference,
        query_request::QueryRequest,
        query_response::{QueryResponse, ResultSet},
    },
    Client,
};

/// BigQuery warehouse client
pub struct BigQueryClient {
    project_id: String,
    dataset: String,
    poller: JobPoller,

    #[cfg(feature = "bigquery")]
    client: Client,
}

impl BigQueryClient {
    /// Authenticate with the key file of the settings, or ADC when none is set
    pub async fn from_settings(settings: &BigQuerySettings) -> Result<Self, FetchError> {
        match &settings.credentials {
            Some(path) => Self::from_service_account_file(&settings.project_id, &settings.dataset, path).await,
            None => Self::with_adc(&settings.project_id, &settings.dataset).await,
        }
    }

    /// Authenticate with Application Default Credentials
    ///
    /// ADC reads `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud CLI default
    /// credentials or the metadata service.
    #[cfg(feature = "bigquery")]
    pub async fn with_adc(project_id: &str, dataset: &str) -> Result<Self, FetchError> {
        let client = Client::from_application_default_credentials().await.map_err(|e| {
            FetchError::AuthenticationError(format!(
                "Failed to authenticate with ADC: {}. \
                 Ensure GOOGLE_APPLICATION_CREDENTIALS is set or run 'gcloud auth application-default login'",
                e
            ))
        })?;
        Self::with_client(client, project_id, dataset)
    }

    #[cfg(not(feature = "bigquery"))]
    pub async fn with_adc(_project_id: &str, _dataset: &str) -> Result<Self, FetchError> {
        Err(not_compiled())
    }

    /// Authenticate with a service account key file
    #[cfg(feature = "bigquery")]
    pub async fn from_service_account_file(
        project_id: &str,
        dataset: &str,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, FetchError> {
        let key_path = key_path.as_ref().to_string_lossy().to_string();
        let client = Client::from_service_account_key_file(&key_path).await.map_err(|e| {
            FetchError::AuthenticationError(format!(
                "Failed to read service account key file '{}': {}",
                key_path, e
            ))
        })?;
        Self::with_client(client, project_id, dataset)
    }

    #[cfg(not(feature = "bigquery"))]
    pub async fn from_service_account_file(
        _project_id: &str,
        _dataset: &str,
        _key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, FetchError> {
        Err(not_compiled())
    }

    #[cfg(feature = "bigquery")]
    fn with_client(client: Client, project_id: &str, dataset: &str) -> Result<Self, FetchError> {
        validate_project(project_id)?;
        validate_name(dataset, "dataset")?;
        Ok(Self {
            project_id: project_id.to_string(),
            dataset: dataset.to_string(),
            poller: JobPoller::default(),
            client,
        })
    }

    /// Replace the polling budget for incomplete jobs
    pub fn with_poller(mut self, poller: JobPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Catalog query for the columns of a dataset, in table then position order
    pub fn columns_query(project_id: &str, dataset: &str) -> Result<String, FetchError> {
        let project_id = validate_project(project_id)?;
        let dataset = validate_name(dataset, "dataset")?;
        Ok(format!(
            "SELECT table_name, column_name, data_type, is_nullable, is_partitioning_column\n\
             FROM `{}.{}.INFORMATION_SCHEMA.COLUMNS`\n\
             ORDER BY table_name, ordinal_position",
            project_id, dataset
        ))
    }

    #[cfg(feature = "bigquery")]
    async fn await_job(&self, response: QueryResponse) -> Result<QueryResponse, FetchError> {
        if response.job_complete.unwrap_or(true) {
            return Ok(response);
        }

        let job = response
            .job_reference
            .clone()
            .ok_or_else(|| FetchError::InvalidResponse("incomplete job without a reference".to_string()))?;
        let job_id = job
            .job_id
            .clone()
            .ok_or_else(|| FetchError::InvalidResponse("job reference without an id".to_string()))?;
        let location = job.location.as_deref();
        let client = &self.client;
        let project_id = self.project_id.as_str();
        let id = job_id.as_str();

        self.poller
            .wait(&job_id, move || async move {
                let results = client
                    .job()
                    .get_query_results(
                        project_id,
                        id,
                        GetQueryResultsParameters {
                            location: location.map(str::to_string),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| classify(e.to_string()))?;
                Ok(if results.job_complete.unwrap_or(false) {
                    JobState::Done(QueryResponse::from(results))
                } else {
                    JobState::Running
                })
            })
            .await
    }

    /// One more page of a finished job's results, with the token of the page after it
    #[cfg(feature = "bigquery")]
    async fn next_page(
        &self,
        job: Option<&JobReference>,
        page_token: String,
    ) -> Result<(Vec<Row>, Option<String>), FetchError> {
        let job = job.ok_or_else(|| FetchError::InvalidResponse("paged result without a job reference".to_string()))?;
        let job_id = job
            .job_id
            .as_deref()
            .ok_or_else(|| FetchError::InvalidResponse("job reference without an id".to_string()))?;

        let results = self
            .client
            .job()
            .get_query_results(
                &self.project_id,
                job_id,
                GetQueryResultsParameters {
                    location: job.location.clone(),
                    page_token: Some(page_token),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e.to_string()))?;

        let next = results.page_token.clone();
        Ok((decode_rows(QueryResponse::from(results))?, next))
    }
}

/// Append the pages after the first one until no page token is left
#[cfg(any(feature = "bigquery", test))]
async fn read_pages<F, Fut>(
    mut rows: Vec<Row>,
    mut page_token: Option<String>,
    mut next_page: F,
) -> Result<Vec<Row>, FetchError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(Vec<Row>, Option<String>), FetchError>>,
{
    while let Some(token) = page_token.take() {
        let (page, next) = next_page(token).await?;
        rows.extend(page);
        page_token = next;
    }
    Ok(rows)
}

#[cfg(feature = "bigquery")]
fn decode_rows(response: QueryResponse) -> Result<Vec<Row>, FetchError> {
    let mut result = ResultSet::new_from_query_response(response);
    let columns = result.column_names();
    let mut rows = Vec::new();
    while result.next_row() {
        let mut values = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            let value = result
                .get_string(index)
                .map_err(|e| FetchError::InvalidResponse(format!("Failed to read column {}: {}", index, e)))?;
            values.push(value.map(Value::Text).unwrap_or(Value::Null));
        }
        rows.push(Row::new(columns.clone(), values));
    }
    Ok(rows)
}

/// Map a declared BigQuery type to a column type
///
/// Parameterized types (`NUMERIC(10,2)`, `STRING(64)`) map by their base
/// name. Nested and geographic types map to `None`.
pub fn map_bigquery_type(declared: &str) -> Option<ColumnType> {
    let base = declared
        .split('(')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_uppercase();

    match base.as_str() {
        "INT64" | "INT" | "INTEGER" | "SMALLINT" | "BIGINT" | "TINYINT" | "BYTEINT" => Some(ColumnType::Integer),
        "FLOAT64" | "FLOAT" | "NUMERIC" | "BIGNUMERIC" | "DECIMAL" | "BIGDECIMAL" => Some(ColumnType::Float),
        "STRING" => Some(ColumnType::String),
        "BOOL" | "BOOLEAN" => Some(ColumnType::Boolean),
        "TIMESTAMP" | "DATE" | "DATETIME" => Some(ColumnType::Timestamp),
        _ => None,
    }
}

#[cfg(any(feature = "bigquery", test))]
fn classify(message: String) -> FetchError {
    if message.contains("Not found") {
        FetchError::TableNotFound(message)
    } else if message.contains("Access Denied") || message.contains("Permission") {
        FetchError::PermissionDenied(message)
    } else {
        FetchError::QueryError(message)
    }
}

#[cfg(not(feature = "bigquery"))]
fn not_compiled() -> FetchError {
    FetchError::ConfigError(
        "BigQuery support not compiled. Rebuild with: cargo build --features bigquery".to_string(),
    )
}

#[async_trait::async_trait]
impl WarehouseClient for BigQueryClient {
    fn name(&self) -> &'static str {
        "BigQuery"
    }

    fn dialect(&self) -> Dialect {
        Dialect::BigQuery
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn table_ref(&self, table: &str) -> Result<TableRef, FetchError> {
        Ok(TableRef::new(self.dataset.clone(), table)?.in_project(self.project_id.clone())?)
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableDescriptor>, FetchError> {
        let rows = self.execute(&Self::columns_query(&self.project_id, dataset)?).await?;
        assemble_tables(WarehouseKind::BigQuery, dataset, &rows, map_bigquery_type)
    }

    #[cfg(feature = "bigquery")]
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, FetchError> {
        let response = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify(e.to_string()))?;
        let response = self.await_job(response).await?;

        let job = response.job_reference.clone();
        let page_token = response.page_token.clone();
        let first = decode_rows(response)?;

        read_pages(first, page_token, |token| self.next_page(job.as_ref(), token)).await
    }

    #[cfg(not(feature = "bigquery"))]
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
    fn test_type_mapping() {
        assert_eq!(map_bigquery_type("INT64"), Some(ColumnType::Integer));
        assert_eq!(map_bigquery_type("NUMERIC(10, 2)"), Some(ColumnType::Float));
        assert_eq!(map_bigquery_type("STRING(64)"), Some(ColumnType::String));
        assert_eq!(map_bigquery_type("bool"), Some(ColumnType::Boolean));
        assert_eq!(map_bigquery_type("DATETIME"), Some(ColumnType::Timestamp));
        assert_eq!(map_bigquery_type("ARRAY<INT64>"), None);
        assert_eq!(map_bigquery_type("STRUCT<a INT64>"), None);
        assert_eq!(map_bigquery_type("GEOGRAPHY"), None);
    }

    #[test]
    fn test_columns_query() {
        let sql = BigQueryClient::columns_query("acme-data", "bora").unwrap();
        assert!(sql.contains("`acme-data.bora.INFORMATION_SCHEMA.COLUMNS`"));
        assert!(sql.contains("is_partitioning_column"));
        assert!(BigQueryClient::columns_query("acme-data", "bora`; DROP").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(classify("Not found: Table x".into()), FetchError::TableNotFound(_)));
        assert!(matches!(classify("Access Denied: y".into()), FetchError::PermissionDenied(_)));
        assert!(matches!(classify("Syntax error".into()), FetchError::QueryError(_)));
    }

    #[tokio::test]
    async fn test_read_pages_follows_tokens() {
        use crate::adapter::Value;

        let row = |n: i64| Row::from_pairs(&[("n", Value::from(n))]);
        let mut requested = Vec::new();

        let rows = read_pages(vec![row(1)], Some("p2".to_string()), |token| {
            requested.push(token.clone());
            let page = match token.as_str() {
                "p2" => (vec![row(2), row(3)], Some("p3".to_string())),
                _ => (vec![row(4)], None),
            };
            async move { Ok::<_, FetchError>(page) }
        })
        .await
        .unwrap();

        assert_eq!(rows, vec![row(1), row(2), row(3), row(4)]);
        assert_eq!(requested, vec!["p2".to_string(), "p3".to_string()]);
    }

    #[tokio::test]
    async fn test_read_pages_surfaces_page_faults() {
        let result = read_pages(Vec::new(), Some("p2".to_string()), |_| async {
            Err::<(Vec<Row>, Option<String>), _>(classify("Access Denied: page".to_string()))
        })
        .await;
        assert!(matches!(result, Err(FetchError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_read_pages_single_page() {
        let rows = read_pages(Vec::new(), None, |_| async { Ok::<_, FetchError>((Vec::new(), None)) })
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[cfg(not(feature = "bigquery"))]
    #[tokio::test]
    async fn test_adc_without_feature() {
        match BigQueryClient::with_adc("acme-data", "bora").await {
            Err(err) => assert!(err.to_string().contains("--features bigquery")),
            Ok(_) => panic!("authenticated without the bigquery feature"),
        }
    }
}
