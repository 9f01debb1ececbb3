//! Safe Query Executor
//!
//! guard → column check → polars SQL over the current snapshot → rows.
//! A failing stage short-circuits with zero rows.

use super::guard;
use super::result::ExecutionResult;
use crate::config::ExecutorConfig;
use crate::dataset::DatasetSnapshot;
use crate::error::{NlqError, Result};
use crate::query::{sql, StructuredQuery};
use polars::prelude::*;
use polars::sql::SQLContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_scan_rows: usize,
    pub timeout: Duration,
    pub max_result_rows: usize,
}

impl From<&ExecutorConfig> for ExecutionLimits {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_scan_rows: config.max_scan_rows.max(1),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            max_result_rows: config.max_result_rows.max(1),
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

/// What to run: a structured query (compiled here) or raw SQL.
#[derive(Debug, Clone, Copy)]
pub enum QueryInput<'a> {
    Structured(&'a StructuredQuery),
    Sql(&'a str),
}

#[derive(Debug, Clone, Default)]
pub struct SafeQueryExecutor {
    limits: ExecutionLimits,
}

impl SafeQueryExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Validate and run. Never returns partial rows: any failure yields an
    /// empty result with `error` set.
    pub async fn compile_and_run(
        &self,
        input: QueryInput<'_>,
        dataset: Arc<DatasetSnapshot>,
    ) -> ExecutionResult {
        let start = Instant::now();
        let sql = match self.prepare(input, &dataset) {
            Ok(sql) => sql,
            Err(e) => return ExecutionResult::failed(&e, elapsed_ms(start)),
        };

        match self.execute(sql, dataset).await {
            Ok((df, warnings)) => {
                let elapsed = elapsed_ms(start);
                match ExecutionResult::from_frame(&df, self.limits.max_result_rows, elapsed) {
                    Ok(result) => {
                        info!("✅ Query returned {} rows in {} ms", result.row_count, elapsed);
                        result.with_warnings(warnings)
                    }
                    Err(e) => ExecutionResult::failed(&e, elapsed),
                }
            }
            Err(e) => ExecutionResult::failed(&e, elapsed_ms(start)),
        }
    }

    pub async fn run_structured(
        &self,
        query: &StructuredQuery,
        dataset: Arc<DatasetSnapshot>,
    ) -> ExecutionResult {
        self.compile_and_run(QueryInput::Structured(query), dataset)
            .await
    }

    pub async fn run_sql(&self, sql: &str, dataset: Arc<DatasetSnapshot>) -> ExecutionResult {
        self.compile_and_run(QueryInput::Sql(sql), dataset).await
    }

    /// SQL that passed every guard check against the live schema.
    fn prepare(&self, input: QueryInput<'_>, dataset: &DatasetSnapshot) -> Result<String> {
        let schema = dataset.schema();
        let sql = match input {
            QueryInput::Structured(query) => {
                let mut query = query.clone();
                query.validate_against(schema)?;
                sql::compile(&query, &schema.alias)
            }
            QueryInput::Sql(raw) => raw.trim().to_string(),
        };
        guard::validate(&sql, schema)?;
        Ok(sql)
    }

    async fn execute(
        &self,
        sql: String,
        dataset: Arc<DatasetSnapshot>,
    ) -> Result<(DataFrame, Vec<String>)> {
        let limits = self.limits;
        let timeout_ms = limits.timeout.as_millis() as u64;

        let worker = tokio::task::spawn_blocking(move || run_polars(&sql, &dataset, limits));
        // On timeout the blocking worker finishes on its own; its output is dropped.
        let joined = tokio::time::timeout(limits.timeout, worker)
            .await
            .map_err(|_| {
                warn!("⏱️ Query exceeded {} ms", timeout_ms);
                NlqError::ExecutionTimeout(timeout_ms)
            })?;
        joined.map_err(|e| {
            warn!("Query worker failed: {}", e);
            NlqError::Execution("the query worker stopped unexpectedly".to_string())
        })?
    }
}

fn run_polars(
    sql: &str,
    dataset: &DatasetSnapshot,
    limits: ExecutionLimits,
) -> Result<(DataFrame, Vec<String>)> {
    let frame = dataset.frame();
    let mut warnings = Vec::new();
    let visible = if frame.height() > limits.max_scan_rows {
        warnings.push(format!(
            "Scan truncated to the first {} of {} rows",
            limits.max_scan_rows,
            frame.height()
        ));
        frame.slice(0, limits.max_scan_rows)
    } else {
        frame.clone()
    };

    let mut ctx = SQLContext::new();
    ctx.register(dataset.alias(), visible.lazy());
    debug!("Executing: {}", sql);
    let df = ctx
        .execute(sql)
        .and_then(|lf| lf.collect())
        .map_err(|e| {
            warn!("Polars rejected query '{}': {}", sql, e);
            NlqError::Execution("the query could not be executed on this dataset".to_string())
        })?;
    Ok((df, warnings))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
