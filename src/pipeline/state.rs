use super::Stage;
use crate::db::QueryResult;
use crate::llm::{Generation, Intent};
use crate::retriever::{RelationshipHint, SchemaContext, ValueHint};
use crate::validator::ValidationReport;
use serde::Serialize;
use std::collections::BTreeMap;

/// User-visible failure categories, plus the empty-result outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Generation,
    Validation,
    Execution,
    Intent,
    EmptyResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(StateUpdate),
    Failure { kind: FailureKind, message: String },
}

impl StageResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        StageResult::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// What a stage is allowed to change. Each variant touches its own fields.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Intent {
        intent: Intent,
        reason: Option<String>,
    },
    Retrieval {
        context: SchemaContext,
        schema_description: String,
    },
    Prompt {
        prompt: String,
    },
    Generation(Generation),
    PostProcess {
        sql: String,
        applied: Vec<&'static str>,
    },
    Validation(ValidationReport),
    Execution(QueryResult),
    Output {
        final_output: String,
        outcome: Option<FailureKind>,
    },
    Unchanged,
}

/// Everything known about one request as it moves through the stages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentState {
    pub user_input: String,
    pub session_id: Option<String>,
    pub detected_intent: Option<Intent>,
    pub intent_reason: Option<String>,
    pub relevant_tables: Vec<String>,
    pub relevant_columns: Vec<String>,
    pub relevant_values: Vec<ValueHint>,
    pub relevant_relationships: Vec<RelationshipHint>,
    /// Similarity of each retrieved table and column.
    pub retrieval_scores: BTreeMap<String, f32>,
    pub schema_description: Option<String>,
    pub prompt: Option<String>,
    pub generated_sql: String,
    pub raw_sql: Option<String>,
    pub applied_fixups: Vec<String>,
    pub validation_passed: Option<bool>,
    pub validation_error: Option<String>,
    pub validation_warning: Option<String>,
    pub query_result: Option<QueryResult>,
    pub execution_error: Option<String>,
    pub final_output: String,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub debug: Vec<String>,
    pub stage_trace: Vec<Stage>,
}

impl AgentState {
    pub fn new(user_input: &str, session_id: Option<String>) -> Self {
        Self {
            user_input: user_input.to_string(),
            session_id,
            ..Self::default()
        }
    }

    /// The state after a stage result.
    pub fn apply(mut self, result: StageResult) -> Self {
        match result {
            StageResult::Success(update) => self.apply_update(update),
            StageResult::Failure { kind, message } => {
                match kind {
                    FailureKind::Execution => self.execution_error = Some(message),
                    FailureKind::Validation => {
                        self.validation_passed = Some(false);
                        self.validation_error = Some(message);
                    }
                    FailureKind::Intent => {
                        self.intent_reason.get_or_insert(message);
                    }
                    _ => self.error = Some(message),
                }
                self.failure_kind = Some(kind);
            }
        }
        self
    }

    fn apply_update(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Intent { intent, reason } => {
                self.detected_intent = Some(intent);
                self.intent_reason = reason;
            }
            StateUpdate::Retrieval {
                context,
                schema_description,
            } => {
                self.relevant_tables = context.tables;
                self.relevant_columns = context.columns;
                self.relevant_values = context.values;
                self.relevant_relationships = context.relationships;
                self.retrieval_scores = context.scores;
                self.schema_description = Some(schema_description);
            }
            StateUpdate::Prompt { prompt } => self.prompt = Some(prompt),
            StateUpdate::Generation(generation) => {
                self.generated_sql = generation.sql;
                if !generation.raw.is_empty() {
                    self.raw_sql = Some(generation.raw);
                }
                if let Some(reason) = generation.failure {
                    self.debug.push(format!("generation failed: {}", reason));
                    self.failure_kind = Some(FailureKind::Generation);
                }
            }
            StateUpdate::PostProcess { sql, applied } => {
                self.generated_sql = sql;
                self.applied_fixups
                    .extend(applied.into_iter().map(str::to_string));
            }
            StateUpdate::Validation(report) => {
                self.validation_passed = Some(report.passed);
                self.validation_error = report.error;
                self.validation_warning = report.warning;
                if let Some(repaired) = report.repaired_sql {
                    self.generated_sql = repaired;
                }
                // An empty statement after a failed generation stays a
                // generation failure.
                if !report.passed && self.failure_kind != Some(FailureKind::Generation) {
                    self.failure_kind = Some(FailureKind::Validation);
                }
            }
            StateUpdate::Execution(result) => self.query_result = Some(result),
            StateUpdate::Output {
                final_output,
                outcome,
            } => {
                self.final_output = final_output;
                if outcome.is_some() {
                    self.failure_kind = outcome;
                }
            }
            StateUpdate::Unchanged => {}
        }
    }

    /// Generation produced no statement.
    pub fn generation_failed(&self) -> bool {
        self.failure_kind == Some(FailureKind::Generation) && self.generated_sql.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationState;

    #[test]
    fn failures_land_in_their_own_fields() {
        let state = AgentState::new("q", None)
            .apply(StageResult::failure(FailureKind::Execution, "boom"));
        assert_eq!(state.execution_error.as_deref(), Some("boom"));
        assert!(state.error.is_none());

        let state = AgentState::new("q", None)
            .apply(StageResult::failure(FailureKind::Configuration, "no index"));
        assert_eq!(state.error.as_deref(), Some("no index"));
        assert_eq!(state.failure_kind, Some(FailureKind::Configuration));
    }

    #[test]
    fn failed_generation_survives_validation() {
        let state = AgentState::new("q", None)
            .apply(StageResult::Success(StateUpdate::Generation(Generation {
                failure: Some("LLM call timed out after 60s".to_string()),
                ..Generation::default()
            })))
            .apply(StageResult::Success(StateUpdate::Validation(ValidationReport {
                passed: false,
                error: Some("No SQL statement to validate.".to_string()),
                repaired_sql: None,
                warning: None,
                state: ValidationState::InvalidFinal,
            })));

        assert_eq!(state.validation_passed, Some(false));
        assert!(state.generation_failed());
        assert_eq!(state.debug.len(), 1);
    }

    #[test]
    fn repaired_sql_replaces_the_statement() {
        let state = AgentState {
            generated_sql: "first_name FROM customers".to_string(),
            ..AgentState::default()
        }
        .apply(StageResult::Success(StateUpdate::Validation(ValidationReport {
            passed: true,
            error: None,
            repaired_sql: Some("SELECT first_name FROM customers;".to_string()),
            warning: None,
            state: ValidationState::Valid,
        })));
        assert_eq!(state.generated_sql, "SELECT first_name FROM customers;");
        assert_eq!(state.failure_kind, None);
    }
}
