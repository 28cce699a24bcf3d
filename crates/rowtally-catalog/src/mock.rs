//! In-memory warehouse client for testing
//!
//! Returns canned rows without connecting to any warehouse. Useful for:
//! - Unit testing the filter pipeline and the extractors
//! - Simulating query faults and slow queries
//! - Checking how many queries run at once
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rowtally_catalog::{MockWarehouseBuilder, Row, WarehouseClient};
//!
//! let client = MockWarehouseBuilder::new()
//!     .with_response("\"events\"", vec![Row::from_pairs(&[("total_rows", 100i64)])])
//!     .with_failure("\"broken\"", "relation does not exist")
//!     .with_latency(20)
//!     .build();
//!
//! let rows = client.execute("SELECT count(*) AS total_rows FROM \"bora\".\"events\"").await?;
//! ```
//!
//! Responses and failures are matched by substring, in insertion order.
//! Failures are checked first. A query matching nothing returns no rows.

use crate::adapter::{FetchError, Row, WarehouseClient};
use rowtally_core::TableDescriptor;
use rowtally_sql::{Dialect, TableRef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Mock warehouse client
pub struct MockWarehouse {
    /// Tables returned by `list_tables`
    tables: Arc<RwLock<Vec<TableDescriptor>>>,

    /// Canned rows by query fragment
    responses: Arc<RwLock<Vec<(String, Vec<Row>)>>>,

    /// Fault messages by query fragment
    failures: Arc<RwLock<Vec<(String, String)>>>,

    /// Every executed query, in execution order
    executed: Arc<RwLock<Vec<String>>>,

    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulated query latency (milliseconds)
    latency_ms: u64,

    dialect: Dialect,
    dataset: String,
    client_name: &'static str,
}

impl MockWarehouse {
    /// Create a Redshift-dialect mock for dataset `mock` with no data
    pub fn new() -> Self {
        MockWarehouseBuilder::new().build()
    }

    pub async fn add_table(&self, table: TableDescriptor) {
        self.tables.write().await.push(table);
    }

    pub async fn add_response(&self, fragment: impl Into<String>, rows: Vec<Row>) {
        self.responses.write().await.push((fragment.into(), rows));
    }

    pub async fn add_failure(&self, fragment: impl Into<String>, message: impl Into<String>) {
        self.failures.write().await.push((fragment.into(), message.into()));
    }

    /// Queries executed so far
    pub async fn executed(&self) -> Vec<String> {
        self.executed.read().await.clone()
    }

    /// Number of executed queries containing a fragment
    pub async fn executed_matching(&self, fragment: &str) -> usize {
        self.executed.read().await.iter().filter(|q| q.contains(fragment)).count()
    }

    /// Highest number of queries that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }
}

impl Default for MockWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockWarehouse {
    fn clone(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            responses: Arc::clone(&self.responses),
            failures: Arc::clone(&self.failures),
            executed: Arc::clone(&self.executed),
            in_flight: Arc::clone(&self.in_flight),
            max_in_flight: Arc::clone(&self.max_in_flight),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            dialect: self.dialect,
            dataset: self.dataset.clone(),
            client_name: self.client_name,
        }
    }
}

/// Decrements the in-flight counter when a query ends, on every path
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WarehouseClient for MockWarehouse {
    fn name(&self) -> &'static str {
        self.client_name
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn table_ref(&self, table: &str) -> Result<TableRef, FetchError> {
        Ok(TableRef::new(self.dataset.clone(), table)?)
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableDescriptor>, FetchError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .await
            .iter()
            .filter(|t| t.dataset == dataset)
            .cloned()
            .collect())
    }

    async fn execute(&self, sql: &str) -> Result<Vec<Row>, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.executed.write().await.push(sql.to_string());
        self.simulate_latency().await;

        if let Some((_, message)) = self.failures.read().await.iter().find(|(f, _)| sql.contains(f.as_str())) {
            return Err(FetchError::QueryError(message.clone()));
        }

        Ok(self
            .responses
            .read()
            .await
            .iter()
            .find(|(f, _)| sql.contains(f.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn test_connection(&self) -> Result<(), FetchError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(FetchError::NetworkError(
                "Simulated connection failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Builder for a MockWarehouse with predefined tables and responses
pub struct MockWarehouseBuilder {
    tables: Vec<TableDescriptor>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<(String, String)>,
    fail_connection: bool,
    latency_ms: u64,
    dialect: Dialect,
    dataset: String,
    client_name: &'static str,
}

impl MockWarehouseBuilder {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            responses: Vec::new(),
            failures: Vec::new(),
            fail_connection: false,
            latency_ms: 0,
            dialect: Dialect::Redshift,
            dataset: "mock".to_string(),
            client_name: "Mock",
        }
    }

    pub fn with_table(mut self, table: TableDescriptor) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_response(mut self, fragment: impl Into<String>, rows: Vec<Row>) -> Self {
        self.responses.push((fragment.into(), rows));
        self
    }

    pub fn with_failure(mut self, fragment: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.push((fragment.into(), message.into()));
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.client_name = name;
        self
    }

    pub fn build(self) -> MockWarehouse {
        MockWarehouse {
            tables: Arc::new(RwLock::new(self.tables)),
            responses: Arc::new(RwLock::new(self.responses)),
            failures: Arc::new(RwLock::new(self.failures)),
            executed: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            dialect: self.dialect,
            dataset: self.dataset,
            client_name: self.client_name,
        }
    }
}

impl Default for MockWarehouseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowtally_core::{Column, ColumnType};

    #[tokio::test]
    async fn canned_rows_by_fragment() {
        let client = MockWarehouseBuilder::new()
            .with_response("\"events\"", vec![Row::from_pairs(&[("total_rows", 100i64)])])
            .build();

        let rows = client.execute("SELECT count(*) FROM \"mock\".\"events\"").await.unwrap();
        assert_eq!(rows[0].get_by_name("total_rows").and_then(|v| v.as_u64()), Some(100));

        let rows = client.execute("SELECT 1").await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(client.executed().await.len(), 2);
    }

    #[tokio::test]
    async fn failures_win_over_responses() {
        let client = MockWarehouseBuilder::new()
            .with_response("events", vec![])
            .with_failure("events", "relation does not exist")
            .build();
        let err = client.execute("SELECT * FROM events").await.unwrap_err();
        assert!(matches!(err, FetchError::QueryError(_)));
        assert_eq!(client.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn tables_filtered_by_dataset() {
        let client = MockWarehouseBuilder::new()
            .with_dataset("bora")
            .with_table(TableDescriptor::new("bora", "events", vec![Column::new("id", ColumnType::Integer)]))
            .with_table(TableDescriptor::new("ostro", "events", vec![]))
            .build();
        assert_eq!(client.list_tables("bora").await.unwrap().len(), 1);
        assert_eq!(client.table_ref("events").unwrap().to_string(), "bora.events");
    }

    #[tokio::test]
    async fn connection_failure() {
        let client = MockWarehouseBuilder::new().with_connection_failure().build();
        assert!(client.test_connection().await.is_err());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let client = MockWarehouse::new();
        let clone = client.clone();
        clone.add_response("x", vec![Row::from_pairs(&[("v", 1i64)])]).await;
        assert_eq!(client.execute("x").await.unwrap().len(), 1);
        assert_eq!(clone.executed_matching("x").await, 1);
    }
}
