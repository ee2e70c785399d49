//! Query executor: runs statements through a [`GraphDriver`] and hands
//! back normalized [`ExecutionResult`]s.

use crate::http::HttpGraphDriver;
use crate::normalize::{normalize_record, summarize};
use cypherloom_config::GraphConfig;
use cypherloom_core::{
    AccessMode, ExecutionMetadata, ExecutionResult, GeneratedQuery, GraphDriver, GraphError, Params,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs queries with at most `max_pool_size` statements in flight.
///
/// There is no retry: a failed statement surfaces to the caller unchanged
/// apart from making sure execution errors carry the query and parameters.
pub struct QueryExecutor {
    driver: Arc<dyn GraphDriver>,
    permits: Arc<Semaphore>,
    max_pool_size: usize,
}

impl QueryExecutor {
    pub fn new(driver: Arc<dyn GraphDriver>, max_pool_size: usize) -> Self {
        let max_pool_size = max_pool_size.max(1);
        Self {
            driver,
            permits: Arc::new(Semaphore::new(max_pool_size)),
            max_pool_size,
        }
    }

    /// Executor over the Neo4j HTTP driver described by `config`.
    pub fn from_config(config: &GraphConfig) -> Self {
        Self::new(
            Arc::new(HttpGraphDriver::from_config(config)),
            config.max_pool_size,
        )
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    /// Permits not currently held by a running statement.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn execute(
        &self,
        query: &str,
        params: &Params,
        mode: AccessMode,
    ) -> Result<ExecutionResult, GraphError> {
        let started = Instant::now();

        // Held until this function returns, on success or failure.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GraphError::Connection("connection pool closed".into()))?;

        debug!(
            driver = %self.driver.name(),
            mode = mode.as_str(),
            params = ?params.keys().collect::<Vec<_>>(),
            "Executing query"
        );

        let response = self
            .driver
            .run(query, params, mode)
            .await
            .map_err(|e| match e {
                GraphError::Execution { message, .. } => {
                    GraphError::execution(message, query, params)
                }
                other => other,
            })
            .inspect_err(|e| warn!(driver = %self.driver.name(), error = %e, "Query failed"))?;

        let rows: Vec<_> = response
            .records
            .iter()
            .map(|record| normalize_record(&response.columns, record))
            .collect();
        let summary = summarize(&response.counters, rows.len());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(rows = rows.len(), elapsed_ms, "Query complete");

        Ok(ExecutionResult {
            columns: response.columns,
            rows,
            metadata: ExecutionMetadata {
                query: query.to_string(),
                params: params.clone(),
                mode,
                elapsed_ms,
                available_after_ms: response.available_after_ms,
                counters: response.counters,
            },
            summary,
        })
    }

    pub async fn execute_read(
        &self,
        query: &str,
        params: &Params,
    ) -> Result<ExecutionResult, GraphError> {
        self.execute(query, params, AccessMode::Read).await
    }

    pub async fn execute_write(
        &self,
        query: &str,
        params: &Params,
    ) -> Result<ExecutionResult, GraphError> {
        self.execute(query, params, AccessMode::Write).await
    }

    pub async fn execute_generated(
        &self,
        query: &GeneratedQuery,
        mode: AccessMode,
    ) -> Result<ExecutionResult, GraphError> {
        self.execute(&query.text, &query.params, mode).await
    }

    pub async fn verify_connectivity(&self) -> Result<(), GraphError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GraphError::Connection("connection pool closed".into()))?;
        self.driver.verify_connectivity().await
    }
}
