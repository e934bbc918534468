use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::db::QueryResult;
use crate::llm::{AnalysisError, ChartSuggestion, Intent};
use crate::pipeline::{AgentState, FailureKind};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub user_input: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub detected_intent: Option<Intent>,
    pub relevant_tables: Vec<String>,
    pub relevant_columns: Vec<String>,
    pub generated_sql: String,
    pub validation_passed: Option<bool>,
    pub validation_error: Option<String>,
    pub validation_warning: Option<String>,
    pub query_result: Option<QueryResult>,
    pub execution_error: Option<String>,
    pub final_output: String,
    pub error: Option<String>,
    pub outcome: Option<FailureKind>,
    pub session_id: Option<String>,
    pub execution_time_ms: u64,
    pub timestamp: String,
}

impl QueryResponse {
    fn from_state(state: AgentState, execution_time_ms: u64) -> Self {
        Self {
            detected_intent: state.detected_intent,
            relevant_tables: state.relevant_tables,
            relevant_columns: state.relevant_columns,
            generated_sql: state.generated_sql,
            validation_passed: state.validation_passed,
            validation_error: state.validation_error,
            validation_warning: state.validation_warning,
            query_result: state.query_result,
            execution_error: state.execution_error,
            final_output: state.final_output,
            error: state.error,
            outcome: state.failure_kind,
            session_id: state.session_id,
            execution_time_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A question and the result it produced, sent back for analysis.
#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub user_input: String,
    pub query_result: QueryResult,
}

#[derive(Debug, Serialize)]
pub struct InsightsResponse {
    pub insights: String,
}

#[derive(Debug, Serialize)]
pub struct ChartResponse {
    pub chart: Option<ChartSuggestion>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub index_build_id: Option<String>,
    pub database_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemaSummary {
    pub tables: Vec<TableSummary>,
    pub relationship_count: usize,
}

// Natural language question through the whole pipeline
pub async fn query(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let start_time = Instant::now();
    let user_input = payload.user_input.trim();
    if user_input.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "user_input must not be empty".to_string(),
        ));
    }

    debug!("Question: {}", user_input);
    let state = app_state.pipeline.run(user_input, payload.session_id).await;

    let elapsed = start_time.elapsed().as_millis() as u64;
    info!("Answered in {} ms", elapsed);
    Ok(Json(QueryResponse::from_state(state, elapsed)))
}

fn analysis_error(e: AnalysisError) -> (StatusCode, String) {
    warn!("Result analysis failed: {}", e);
    let status = match e {
        AnalysisError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AnalysisError::Llm(_) | AnalysisError::Chart(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

// Business insights for a result
pub async fn insights(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<AnalysisRequest>,
) -> Result<Json<InsightsResponse>, (StatusCode, String)> {
    let insights = app_state
        .analyst
        .insights(&payload.user_input, &payload.query_result)
        .await
        .map_err(analysis_error)?;
    Ok(Json(InsightsResponse { insights }))
}

// Chart suggestion for a result
pub async fn chart(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<AnalysisRequest>,
) -> Result<Json<ChartResponse>, (StatusCode, String)> {
    let chart = app_state
        .analyst
        .chart(&payload.user_input, &payload.query_result)
        .await
        .map_err(analysis_error)?;
    let rows = chart
        .as_ref()
        .map(|c| c.plot_rows(&payload.query_result))
        .unwrap_or_default();
    Ok(Json(ChartResponse { chart, rows }))
}

// System status
pub async fn health(State(app_state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(app_state.startup_time)
        .num_seconds();
    let index_build_id = app_state.index_build.as_ref().map(|b| b.build_id.clone());
    let status = if index_build_id.is_some() && app_state.database_connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthStatus {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        index_build_id,
        database_connected: app_state.database_connected,
    })
}

// Schema
pub async fn schema(State(app_state): State<Arc<AppState>>) -> Json<SchemaSummary> {
    let tables = app_state
        .metadata
        .tables
        .iter()
        .map(|table| TableSummary {
            name: table.name.clone(),
            description: table.description.clone(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
        })
        .collect();

    Json(SchemaSummary {
        tables,
        relationship_count: app_state.metadata.relationships.len(),
    })
}
