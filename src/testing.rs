//! Doubles and fixtures shared by the unit tests.

use crate::config::AppConfig;
use crate::context::{self, Components};
use crate::db::{DuckDbConnectionManager, DuckDbEngine, SqlEngine, create_pool};
use crate::embedding::providers::local::LocalEmbedder;
use crate::embedding::{Embedder, EmbeddingError};
use crate::index::{self, SchemaIndex};
use crate::llm::{LlmError, LlmManager, LlmProvider, ResultAnalyst};
use crate::pipeline::{AuditLog, Pipeline};
use crate::retriever::Retriever;
use crate::schema::banking;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const CUSTOMER_COUNT: usize = 4;
pub const NEW_YORK_CUSTOMERS: usize = 2;

pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![1.0])
    }

    fn model_id(&self) -> String {
        "slow".to_string()
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Connection("connection refused".to_string()))
    }

    fn model_id(&self) -> String {
        "failing".to_string()
    }
}

pub struct SlowLlm(pub Duration);

#[async_trait]
impl LlmProvider for SlowLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        tokio::time::sleep(self.0).await;
        Ok("SELECT 1;".to_string())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

pub struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::Connection("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Answers intent prompts with a fixed label and everything else with a
/// fixed SQL response, counting both.
pub struct ScriptedLlm {
    intent: String,
    sql: String,
    intent_calls: Arc<AtomicUsize>,
    generation_calls: Arc<AtomicUsize>,
    total_calls: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    pub fn new(intent: &str, sql: &str) -> Self {
        Self {
            intent: intent.to_string(),
            sql: sql.to_string(),
            intent_calls: Arc::default(),
            generation_calls: Arc::default(),
            total_calls: Arc::default(),
        }
    }

    pub fn intent_calls(&self) -> Arc<AtomicUsize> {
        self.intent_calls.clone()
    }

    pub fn generation_calls(&self) -> Arc<AtomicUsize> {
        self.generation_calls.clone()
    }

    pub fn total_calls(&self) -> Arc<AtomicUsize> {
        self.total_calls.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("intent classifier") {
            self.intent_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.intent.clone())
        } else {
            self.generation_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sql.clone())
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn local_embedder() -> LocalEmbedder {
    LocalEmbedder::new(2048).unwrap()
}

pub async fn schema_index() -> SchemaIndex {
    index::build(&banking::metadata(), &local_embedder())
        .await
        .unwrap()
}

pub async fn retriever() -> Retriever {
    Retriever::new(
        Ok(Arc::new(schema_index().await)),
        Arc::new(local_embedder()),
        Arc::new(banking::metadata()),
        AppConfig::default().retrieval,
    )
}

/// A banking database file with a handful of rows per table.
pub struct TestDb {
    _dir: TempDir,
    path: PathBuf,
}

impl TestDb {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

const SAMPLE_ROWS: &str = "
INSERT INTO customers VALUES
    (1, 'Ana', 'Silva', 'ana@example.com', '555-0101', '1 Main St', 'New York', 'NY', '10001', '1985-02-11'),
    (2, 'Ben', 'Okafor', 'ben@example.com', '555-0102', '9 Park Ave', 'New York', 'NY', '10022', '1990-07-30'),
    (3, 'Chen', 'Li', 'chen@example.com', '555-0103', '4 Lake Dr', 'Chicago', 'IL', '60601', '1978-12-01'),
    (4, 'Dara', 'Quinn', 'dara@example.com', NULL, '7 Elm St', 'Boston', 'MA', '02108', '2000-04-18');
INSERT INTO account_types VALUES
    (1, 'Savings', 'Interest bearing savings account'),
    (2, 'Checking', 'Everyday checking account');
INSERT INTO branches VALUES
    (1, 'Downtown', '100 Broadway', 'New York', 'NY'),
    (2, 'Lakeside', '20 Shore Rd', 'Chicago', 'IL');
INSERT INTO accounts VALUES
    (10, 1, 1, 1, 2500.00, '2020-01-15', 'Active'),
    (11, 2, 2, 1, 120.50, '2021-06-01', 'Active'),
    (12, 3, 1, 2, 9800.00, '2019-03-20', 'Dormant'),
    (13, 4, 2, 2, 0.00, '2018-11-05', 'Closed');
INSERT INTO loan_types VALUES
    (1, 'Home', 6.50, 'Mortgage for residential property'),
    (2, 'Auto', 7.25, 'Vehicle financing'),
    (3, 'Personal', 11.00, 'Unsecured personal loan'),
    (4, 'Education', 5.75, 'Tuition financing'),
    (5, 'Business', 9.00, 'Small business credit');
INSERT INTO loans VALUES
    (100, 1, 10, 1, 250000.00, 6.50, '2021-02-01', '2051-02-01', 'Active'),
    (101, 2, 11, 2, 18000.00, 7.25, '2022-05-10', '2027-05-10', 'Active'),
    (102, 3, 12, 3, 5000.00, 11.00, '2020-09-15', '2023-09-15', 'Closed');
INSERT INTO loan_payments VALUES
    (1000, 100, '2021-03-01', 1580.00),
    (1001, 100, '2021-04-01', 1580.00),
    (1002, 101, '2022-06-10', 360.00);
";

pub fn bank_database() -> TestDb {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.duckdb");
    let conn = duckdb::Connection::open(&path).unwrap();
    for statement in banking::metadata().create_table_statements() {
        conn.execute_batch(&statement).unwrap();
    }
    conn.execute_batch(SAMPLE_ROWS).unwrap();
    drop(conn);
    TestDb { _dir: dir, path }
}

fn llm_manager(llm: impl LlmProvider + 'static) -> Arc<LlmManager> {
    Arc::new(LlmManager::with_provider(
        Box::new(llm),
        Duration::from_secs(5),
    ))
}

fn engine(db: &Path, config: &AppConfig) -> Arc<dyn SqlEngine> {
    let pool = create_pool(DuckDbConnectionManager::open(db, true).unwrap(), 2).unwrap();
    Arc::new(DuckDbEngine::new(
        pool,
        config.safety.max_result_rows,
        Duration::from_secs(config.safety.query_timeout_secs),
    ))
}

/// Full pipeline over the banking schema, the local embedder and an
/// optional read-only database.
pub async fn pipeline(llm: impl LlmProvider + 'static, db: Option<&Path>) -> Pipeline {
    pipeline_with(AppConfig::default(), llm, db, None).await
}

pub async fn pipeline_with(
    config: AppConfig,
    llm: impl LlmProvider + 'static,
    db: Option<&Path>,
    audit: Option<AuditLog>,
) -> Pipeline {
    let components = Components {
        llm: llm_manager(llm),
        embedder: Arc::new(local_embedder()),
        index: Ok(Arc::new(schema_index().await)),
        engine: db.map(|db| engine(db, &config)),
        audit,
    };
    context::build_pipeline(&config, Arc::new(banking::metadata()), components).unwrap()
}

pub fn analyst(llm: impl LlmProvider + 'static) -> ResultAnalyst {
    ResultAnalyst::new(llm_manager(llm)).unwrap()
}

pub async fn pipeline_without_index(llm: impl LlmProvider + 'static) -> Pipeline {
    let config = AppConfig::default();
    let components = Components {
        llm: llm_manager(llm),
        embedder: Arc::new(local_embedder()),
        index: Err("index directory has no manifest".to_string()),
        engine: None,
        audit: None,
    };
    context::build_pipeline(&config, Arc::new(banking::metadata()), components).unwrap()
}
