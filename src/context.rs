use crate::config::AppConfig;
use crate::db::{DuckDbConnectionManager, DuckDbEngine, SqlEngine, catalog, create_pool};
use crate::embedding::{Embedder, EmbeddingError, EmbeddingManager};
use crate::index::{self, BuildInfo, IndexError, SchemaIndex};
use crate::llm::{IntentClassifier, IntentError, LlmError, LlmManager, ResultAnalyst, SqlGenerator};
use crate::pipeline::{AuditLog, Pipeline, PipelineParts};
use crate::postprocess::{ColumnMatcher, PostProcessor};
use crate::prompt::{PromptAssembler, PromptError, load_examples};
use crate::retriever::Retriever;
use crate::schema::{SchemaError, SchemaMetadata, banking};
use crate::validator::Validator;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Intent(#[from] IntentError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Long-lived collaborators that differ between deployments and tests.
pub struct Components {
    pub llm: Arc<LlmManager>,
    pub embedder: Arc<dyn Embedder>,
    /// The load error when no usable index was found.
    pub index: Result<Arc<SchemaIndex>, String>,
    pub engine: Option<Arc<dyn SqlEngine>>,
    pub audit: Option<AuditLog>,
}

/// Everything the server and the CLI share once startup is done.
pub struct AppContext {
    pub config: AppConfig,
    pub metadata: Arc<SchemaMetadata>,
    pub pipeline: Arc<Pipeline>,
    pub analyst: Arc<ResultAnalyst>,
    pub index_build: Option<BuildInfo>,
    pub database_connected: bool,
}

impl AppContext {
    /// Loads metadata, index and database. A missing index or database
    /// does not stop startup; the affected requests fail with a
    /// configuration error instead.
    pub async fn initialize(config: AppConfig) -> Result<Self, StartupError> {
        let metadata = Arc::new(load_metadata(&config)?);
        info!(
            "Loaded schema metadata with {} tables and {} relationships",
            metadata.tables.len(),
            metadata.relationships.len()
        );

        let llm = Arc::new(LlmManager::new(&config.llm)?);
        let analyst = Arc::new(ResultAnalyst::new(llm.clone())?);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingManager::new(&config.embedding)?);

        let index_dir = config.index_dir();
        let index = match index::store::load(&index_dir, &metadata, Some(&embedder.model_id())) {
            Ok(index) => {
                info!("Loaded schema index {}", index.build.build_id);
                Ok(Arc::new(index))
            }
            Err(e) => {
                error!(
                    "Schema index at {} is unusable, run build-index: {}",
                    index_dir.display(),
                    e
                );
                Err(e.to_string())
            }
        };
        let index_build = index.as_ref().ok().map(|i| i.build.clone());

        let engine = open_engine(&config, &metadata);
        let database_connected = engine.is_some();

        let components = Components {
            llm,
            embedder,
            index,
            engine,
            audit: Some(AuditLog::new(config.audit_log_path())),
        };
        let pipeline = build_pipeline(&config, metadata.clone(), components)?;

        Ok(Self {
            config,
            metadata,
            pipeline: Arc::new(pipeline),
            analyst,
            index_build,
            database_connected,
        })
    }
}

pub fn load_metadata(config: &AppConfig) -> Result<SchemaMetadata, SchemaError> {
    match &config.paths.schema_metadata {
        Some(path) => SchemaMetadata::load(&config.resolve_path(path)),
        None => banking::load(),
    }
}

/// Wires the pipeline stages from configuration and the given components.
pub fn build_pipeline(
    config: &AppConfig,
    metadata: Arc<SchemaMetadata>,
    components: Components,
) -> Result<Pipeline, StartupError> {
    let examples_path = config
        .paths
        .few_shot_examples
        .as_ref()
        .map(|p| config.resolve_path(p));
    let examples = load_examples(examples_path.as_deref())?;

    let classifier =
        IntentClassifier::new(components.llm.clone(), &config.safety.destructive_intent_words)?;
    let retriever = Retriever::new(
        components.index,
        components.embedder,
        metadata.clone(),
        config.retrieval.clone(),
    );
    let assembler = PromptAssembler::new(
        config.prompt.clone(),
        config.safety.forbidden_sql_keywords.clone(),
    )?;
    let post_processor = PostProcessor::new(
        metadata.clone(),
        Arc::new(metadata.synonym_map()),
        ColumnMatcher::lexical(&metadata)?,
        config.postprocess.clone(),
    );
    let validator = Validator::new(&config.safety, components.engine.clone());

    Ok(Pipeline::new(PipelineParts {
        classifier,
        retriever,
        assembler,
        examples: Arc::new(examples),
        generator: SqlGenerator::new(components.llm),
        post_processor,
        validator,
        engine: components.engine,
        audit: components.audit,
    }))
}

fn open_engine(config: &AppConfig, metadata: &SchemaMetadata) -> Option<Arc<dyn SqlEngine>> {
    let path = config.database_path();
    if config.database.read_only && !path.exists() {
        error!(
            "Database {} does not exist; run init-db or load-csv first",
            path.display()
        );
        return None;
    }

    let pool = match DuckDbConnectionManager::open(&path, config.database.read_only)
        .map_err(StartupError::from)
        .and_then(|manager| create_pool(manager, config.database.pool_size).map_err(StartupError::from))
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("Could not open database {}: {}", path.display(), e);
            return None;
        }
    };

    match pool.get() {
        Ok(conn) => {
            if let Err(e) = catalog::missing_tables(&conn, metadata) {
                warn!("Could not compare the database with the schema metadata: {}", e);
            }
        }
        Err(e) => warn!("Could not check database tables: {}", e),
    }

    info!("Using database {}", path.display());
    Some(Arc::new(DuckDbEngine::new(
        pool,
        config.safety.max_result_rows,
        Duration::from_secs(config.safety.query_timeout_secs),
    )))
}

/// Embeds the schema metadata and writes a fresh index.
pub async fn build_index(config: &AppConfig) -> Result<BuildInfo, StartupError> {
    let metadata = load_metadata(config)?;
    let embedder = EmbeddingManager::new(&config.embedding)?;
    let index = index::build(&metadata, &embedder).await?;
    index::store::save(&index, &config.index_dir())?;
    Ok(index.build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig {
            data_dir: dir.path().display().to_string(),
            ..AppConfig::default()
        };
        // Nothing listens on the discard port.
        config.llm.api_url = Some("http://127.0.0.1:9/api/generate".to_string());
        config.llm.timeout_secs = 2;
        config
    }

    #[tokio::test]
    async fn startup_survives_missing_index_and_database() {
        let dir = TempDir::new().unwrap();
        let context = AppContext::initialize(config_in(&dir)).await.unwrap();

        assert!(context.index_build.is_none());
        assert!(!context.database_connected);

        let state = context.pipeline.run("How many branches are there?", None).await;
        assert_eq!(
            state.failure_kind,
            Some(crate::pipeline::FailureKind::Configuration)
        );
    }

    #[tokio::test]
    async fn built_index_is_picked_up_at_startup() {
        let dir = TempDir::new().unwrap();
        let db = testing::bank_database();
        let mut config = config_in(&dir);
        config.database.connection_string = db.path().display().to_string();

        let build = build_index(&config).await.unwrap();
        let context = AppContext::initialize(config).await.unwrap();

        assert_eq!(context.index_build.map(|b| b.build_id), Some(build.build_id));
        assert!(context.database_connected);
    }

    #[test]
    fn custom_metadata_path_is_resolved_under_data_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.paths.schema_metadata = Some("missing.json".to_string());
        assert!(load_metadata(&config).is_err());
    }
}
