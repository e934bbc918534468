use super::db_pool::DbPool;
use crate::sql::SqlTokens;
use arrow::record_batch::RecordBatch;
use arrow::json::WriterBuilder;
use arrow::json::writer::JsonArray;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("could not get a database connection: {0}")]
    Pool(String),
    #[error("{0}")]
    Query(String),
    #[error("query exceeded the {0}s time limit")]
    Timeout(u64),
    #[error("could not convert query results: {0}")]
    Conversion(String),
    #[error("database task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    /// More rows existed than the configured cap.
    pub truncated: bool,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Where validated SQL runs.
#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Parses, binds and plans the statement without running it.
    async fn dry_run(&self, sql: &str) -> Result<(), ExecutionError>;

    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutionError>;
}

pub struct DuckDbEngine {
    pool: DbPool,
    max_rows: usize,
    timeout: Duration,
}

impl DuckDbEngine {
    pub fn new(pool: DbPool, max_rows: usize, timeout: Duration) -> Self {
        Self {
            pool,
            max_rows,
            timeout,
        }
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> Result<T, ExecutionError> + Send + 'static,
    {
        let pool = self.pool.clone();
        // The connection goes back to the pool when the task finishes, even
        // after the caller has stopped waiting.
        let task = tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| ExecutionError::Pool(e.to_string()))?;
            work(&*conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!("Task join error: {}", join_err);
                Err(ExecutionError::Task(join_err.to_string()))
            }
            Err(_) => {
                error!("Query did not finish within {:?}", self.timeout);
                Err(ExecutionError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

/// The statement without its `;` terminator and trailing comments, so it
/// can be wrapped by `EXPLAIN` or the row cap.
fn statement_body(sql: &str) -> String {
    match SqlTokens::parse(sql) {
        Ok(tokens) => tokens.statement_body(),
        Err(_) => sql.trim().trim_end_matches(';').trim_end().to_string(),
    }
}

/// Wraps a query so the engine returns at most `max_rows + 1` rows; the
/// extra row tells us the result was cut.
pub fn cap_rows(sql: &str, max_rows: usize) -> String {
    format!(
        "SELECT * FROM (\n{}\n) AS capped_result LIMIT {}",
        statement_body(sql),
        max_rows + 1
    )
}

#[async_trait]
impl SqlEngine for DuckDbEngine {
    async fn dry_run(&self, sql: &str) -> Result<(), ExecutionError> {
        let explain = format!("EXPLAIN {}", statement_body(sql));
        self.run_blocking(move |conn| {
            conn.prepare(&explain)
                .map(|_| ())
                .map_err(|e| ExecutionError::Query(e.to_string()))
        })
        .await
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutionError> {
        let capped = cap_rows(sql, self.max_rows);
        let max_rows = self.max_rows;
        debug!("Executing capped query: {}", capped);

        self.run_blocking(move |conn| {
            let start_time = Instant::now();

            let mut stmt = conn
                .prepare(&capped)
                .map_err(|e| ExecutionError::Query(e.to_string()))?;
            let arrow_batch = stmt
                .query_arrow([])
                .map_err(|e| ExecutionError::Query(e.to_string()))?;

            let schema = arrow_batch.get_schema();
            let columns = schema
                .fields()
                .iter()
                .map(|field| field.name().clone())
                .collect::<Vec<String>>();
            let record_batches = arrow_batch.collect::<Vec<RecordBatch>>();

            let mut rows = batches_to_rows(&record_batches)?;
            let truncated = rows.len() > max_rows;
            rows.truncate(max_rows);

            info!(
                "Query returned {} rows in {} ms{}",
                rows.len(),
                start_time.elapsed().as_millis(),
                if truncated { " (truncated)" } else { "" }
            );
            Ok(QueryResult {
                columns,
                row_count: rows.len(),
                rows,
                truncated,
            })
        })
        .await
    }
}

fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Map<String, Value>>, ExecutionError> {
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    let refs = batches.iter().collect::<Vec<_>>();
    writer
        .write_batches(&refs)
        .map_err(|e| ExecutionError::Conversion(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| ExecutionError::Conversion(e.to_string()))?;

    serde_json::from_slice(&writer.into_inner())
        .map_err(|e| ExecutionError::Conversion(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DuckDbConnectionManager, create_pool};

    fn engine(max_rows: usize) -> DuckDbEngine {
        let pool = create_pool(DuckDbConnectionManager::memory().unwrap(), 2).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE customers (customer_id INTEGER, first_name VARCHAR, phone_number VARCHAR);
                 INSERT INTO customers VALUES (1, 'Ana', '555-0101'), (2, 'Ben', NULL), (3, 'Cy', '555-0103');",
            )
            .unwrap();
        DuckDbEngine::new(pool, max_rows, Duration::from_secs(10))
    }

    #[test]
    fn capping_strips_the_terminator() {
        assert_eq!(
            cap_rows("SELECT 1; ", 10),
            "SELECT * FROM (\nSELECT 1\n) AS capped_result LIMIT 11"
        );
    }

    #[tokio::test]
    async fn rows_come_back_as_json_objects() {
        let result = engine(100)
            .execute("SELECT customer_id, first_name, phone_number FROM customers ORDER BY customer_id;")
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["customer_id", "first_name", "phone_number"]);
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
        assert_eq!(result.rows[0]["first_name"], Value::from("Ana"));
        assert_eq!(result.rows[0]["customer_id"], Value::from(1));
        assert_eq!(result.rows[1]["phone_number"], Value::Null);
    }

    #[tokio::test]
    async fn results_over_the_cap_are_truncated() {
        let result = engine(2)
            .execute("SELECT * FROM customers")
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn empty_results_keep_their_columns() {
        let result = engine(10)
            .execute("SELECT first_name FROM customers WHERE customer_id > 99")
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.columns, vec!["first_name"]);
    }

    #[tokio::test]
    async fn dry_run_catches_unknown_columns() {
        let engine = engine(10);
        assert!(engine.dry_run("SELECT first_name FROM customers;").await.is_ok());
        assert!(matches!(
            engine.dry_run("SELECT middle_name FROM customers").await,
            Err(ExecutionError::Query(_))
        ));
    }

    #[tokio::test]
    async fn comment_after_the_terminator_passes_dry_run_and_execution() {
        let engine = engine(10);
        let sql = "SELECT first_name FROM customers; -- all customers";

        assert!(engine.dry_run(sql).await.is_ok());
        let result = engine.execute(sql).await.unwrap();
        assert_eq!(result.row_count, 3);
    }

    #[test]
    fn capping_drops_comments_after_the_terminator() {
        assert_eq!(
            cap_rows("SELECT 1; /* one */ -- done\n", 5),
            "SELECT * FROM (\nSELECT 1\n) AS capped_result LIMIT 6"
        );
    }

    #[tokio::test]
    async fn trailing_comment_does_not_swallow_the_wrapper() {
        let result = engine(10)
            .execute("SELECT COUNT(*) AS n FROM customers -- all of them")
            .await
            .unwrap();
        assert_eq!(result.rows[0]["n"], Value::from(3));
    }
}
