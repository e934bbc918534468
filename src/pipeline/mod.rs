pub mod audit;
pub mod format;
pub mod state;

use crate::db::SqlEngine;
use crate::llm::{Intent, IntentClassifier, SqlGenerator};
use crate::postprocess::PostProcessor;
use crate::prompt::{FewShotExample, PromptAssembler};
use crate::retriever::{RetrievalError, Retriever};
use crate::validator::Validator;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub use audit::AuditLog;
pub use state::{AgentState, FailureKind, StageResult, StateUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    IntentCheck,
    Greet,
    Fallback,
    Retrieve,
    PromptAssemble,
    Generate,
    PostProcess,
    Validate,
    Execute,
    Format,
    Log,
    End,
}

/// The stage that follows `stage` given what it produced.
pub fn transition(stage: Stage, result: &StageResult) -> Stage {
    use StageResult::{Failure, Success};

    match (stage, result) {
        (Stage::Start, _) => Stage::IntentCheck,
        (Stage::IntentCheck, Success(StateUpdate::Intent { intent, .. })) => match intent {
            Intent::Greet => Stage::Greet,
            Intent::Fallback => Stage::Fallback,
            Intent::AskQuestion => Stage::Retrieve,
        },
        (Stage::IntentCheck, _) => Stage::Format,
        (Stage::Greet | Stage::Fallback, _) => Stage::Format,
        (Stage::Retrieve, Success(_)) => Stage::PromptAssemble,
        (Stage::PromptAssemble, Success(_)) => Stage::Generate,
        (Stage::Retrieve | Stage::PromptAssemble, Failure { .. }) => Stage::Format,
        // An empty generation still goes through validation, which rejects it.
        (Stage::Generate, _) => Stage::PostProcess,
        (Stage::PostProcess, _) => Stage::Validate,
        (Stage::Validate, Success(StateUpdate::Validation(report))) if report.passed => {
            Stage::Execute
        }
        (Stage::Validate, _) => Stage::Format,
        (Stage::Execute, _) => Stage::Format,
        (Stage::Format, _) => Stage::Log,
        (Stage::Log, _) | (Stage::End, _) => Stage::End,
    }
}

/// Everything a pipeline needs, built once at startup.
pub struct PipelineParts {
    pub classifier: IntentClassifier,
    pub retriever: Retriever,
    pub assembler: PromptAssembler,
    pub examples: Arc<Vec<FewShotExample>>,
    pub generator: SqlGenerator,
    pub post_processor: PostProcessor,
    pub validator: Validator,
    pub engine: Option<Arc<dyn SqlEngine>>,
    pub audit: Option<AuditLog>,
}

pub struct Pipeline {
    parts: PipelineParts,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self { parts }
    }

    /// Runs one request to completion. Never fails: every problem ends up
    /// in the state and in `final_output`.
    pub async fn run(&self, user_input: &str, session_id: Option<String>) -> AgentState {
        let start_time = Instant::now();
        let mut state = AgentState::new(user_input, session_id);
        let mut stage = Stage::Start;

        while stage != Stage::End {
            state.stage_trace.push(stage);
            let result = self.run_stage(stage, &state).await;
            let next = transition(stage, &result);
            debug!("{:?} -> {:?}", stage, next);
            state = state.apply(result);
            stage = next;
        }
        state.stage_trace.push(Stage::End);

        info!(
            "Request finished in {} ms with outcome {:?}",
            start_time.elapsed().as_millis(),
            state.failure_kind
        );
        state
    }

    async fn run_stage(&self, stage: Stage, state: &AgentState) -> StageResult {
        match stage {
            Stage::Start | Stage::Greet | Stage::End => StageResult::Success(StateUpdate::Unchanged),
            Stage::IntentCheck => self.intent_check(state).await,
            Stage::Fallback => StageResult::failure(
                FailureKind::Intent,
                state.intent_reason.clone().unwrap_or_default(),
            ),
            Stage::Retrieve => self.retrieve(state).await,
            Stage::PromptAssemble => self.assemble(state),
            Stage::Generate => self.generate(state).await,
            Stage::PostProcess => self.post_process(state),
            Stage::Validate => self.validate(state).await,
            Stage::Execute => self.execute(state).await,
            Stage::Format => {
                let (final_output, outcome) = format::render(state);
                StageResult::Success(StateUpdate::Output {
                    final_output,
                    outcome,
                })
            }
            Stage::Log => {
                if let Some(audit) = &self.parts.audit {
                    audit.record(state);
                }
                StageResult::Success(StateUpdate::Unchanged)
            }
        }
    }

    /// Waits for audit writes still in flight.
    pub async fn flush_audit(&self) {
        if let Some(audit) = &self.parts.audit {
            audit.flush().await;
        }
    }

    async fn intent_check(&self, state: &AgentState) -> StageResult {
        let classifier = &self.parts.classifier;
        let decision = match classifier.screen(&state.user_input) {
            Some(decision) => decision,
            None => {
                // No index: fail before any model call.
                if let Some(reason) = self.parts.retriever.unavailable() {
                    warn!("Schema index unavailable: {}", reason);
                    return StageResult::failure(
                        FailureKind::Configuration,
                        format!("the schema index is unavailable ({})", reason),
                    );
                }
                classifier.ask_model(&state.user_input).await
            }
        };
        info!("Detected intent {}", decision.intent.as_str());
        StageResult::Success(StateUpdate::Intent {
            intent: decision.intent,
            reason: decision.reason,
        })
    }

    async fn retrieve(&self, state: &AgentState) -> StageResult {
        match self
            .parts
            .retriever
            .retrieve_schema_context(&state.user_input)
            .await
        {
            Ok(context) => {
                let schema_description = context.describe(self.parts.retriever.metadata());
                StageResult::Success(StateUpdate::Retrieval {
                    context,
                    schema_description,
                })
            }
            Err(RetrievalError::Configuration(reason)) => {
                warn!("Schema index unavailable: {}", reason);
                StageResult::failure(
                    FailureKind::Configuration,
                    format!("the schema index is unavailable ({})", reason),
                )
            }
            Err(RetrievalError::Embedding(e)) => {
                warn!("Could not embed the question: {}", e);
                StageResult::failure(
                    FailureKind::Configuration,
                    format!("the question could not be matched against the schema ({})", e),
                )
            }
        }
    }

    fn assemble(&self, state: &AgentState) -> StageResult {
        let schema_context = state.schema_description.as_deref().unwrap_or_default();
        match self
            .parts
            .assembler
            .build_prompt(&state.user_input, schema_context, &self.parts.examples)
        {
            Ok(prompt) => StageResult::Success(StateUpdate::Prompt { prompt }),
            Err(e) => StageResult::failure(FailureKind::Configuration, e.to_string()),
        }
    }

    async fn generate(&self, state: &AgentState) -> StageResult {
        let prompt = state.prompt.as_deref().unwrap_or_default();
        let generation = self.parts.generator.generate(prompt).await;
        StageResult::Success(StateUpdate::Generation(generation))
    }

    fn post_process(&self, state: &AgentState) -> StageResult {
        let correction = self.parts.post_processor.correct(
            &state.generated_sql,
            &state.relevant_tables,
            &state.user_input,
        );
        StageResult::Success(StateUpdate::PostProcess {
            sql: correction.sql,
            applied: correction.applied,
        })
    }

    async fn validate(&self, state: &AgentState) -> StageResult {
        let report = self
            .parts
            .validator
            .validate(&state.generated_sql, &state.user_input)
            .await;
        StageResult::Success(StateUpdate::Validation(report))
    }

    async fn execute(&self, state: &AgentState) -> StageResult {
        if state.validation_passed != Some(true) {
            return StageResult::failure(FailureKind::Validation, "SQL was not validated");
        }
        let Some(engine) = &self.parts.engine else {
            return StageResult::failure(FailureKind::Configuration, "no database is configured");
        };

        match engine.execute(&state.generated_sql).await {
            Ok(result) => StageResult::Success(StateUpdate::Execution(result)),
            Err(e) => {
                warn!("Query execution failed: {}", e);
                StageResult::failure(FailureKind::Execution, e.to_string())
            }
        }
    }
}
