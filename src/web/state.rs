use crate::context::AppContext;
use crate::index::BuildInfo;
use crate::llm::ResultAnalyst;
use crate::pipeline::Pipeline;
use crate::schema::SchemaMetadata;
use std::sync::Arc;

/// Shared application state for the web server
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub analyst: Arc<ResultAnalyst>,
    pub metadata: Arc<SchemaMetadata>,
    pub index_build: Option<BuildInfo>,
    pub database_connected: bool,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        analyst: Arc<ResultAnalyst>,
        metadata: Arc<SchemaMetadata>,
        index_build: Option<BuildInfo>,
        database_connected: bool,
    ) -> Self {
        Self {
            pipeline,
            analyst,
            metadata,
            index_build,
            database_connected,
            startup_time: chrono::Utc::now(),
        }
    }

    pub fn from_context(context: &AppContext) -> Self {
        Self::new(
            context.pipeline.clone(),
            context.analyst.clone(),
            context.metadata.clone(),
            context.index_build.clone(),
            context.database_connected,
        )
    }
}
