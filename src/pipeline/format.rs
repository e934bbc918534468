use super::state::{AgentState, FailureKind};
use crate::db::QueryResult;
use crate::llm::Intent;
use crate::llm::intent::OFF_TOPIC_REJECTION;
use serde_json::Value;
use std::fmt::Write;

pub const GREETING: &str = "Hello! Ask me anything about the bank's customers, accounts, loans, cards or transactions.";
pub const EMPTY_RESULT: &str = "Query executed successfully but returned no rows.";
const NO_ANSWER: &str = "I couldn't produce an answer for that question. Please try rephrasing it.";

/// Keyword -> a question that usually returns rows. First match wins.
const SIMILAR_QUESTIONS: [(&str, &str); 5] = [
    ("account", "Show me all accounts with their balances"),
    ("customer", "List all customers and their account information"),
    ("loan", "Show me all loans and their details"),
    ("transaction", "Display recent transactions"),
    ("branch", "Show branch information and performance"),
];

/// A broader question on the same topic, offered when a query finds nothing.
pub fn suggest_similar_question(user_input: &str) -> &'static str {
    let input = user_input.to_lowercase();
    SIMILAR_QUESTIONS
        .iter()
        .find(|(keyword, _)| input.contains(keyword))
        .map_or(SIMILAR_QUESTIONS[0].1, |(_, question)| question)
}

/// Picks the single message the user sees and the outcome it reports.
pub fn render(state: &AgentState) -> (String, Option<FailureKind>) {
    match state.detected_intent {
        Some(Intent::Greet) => return (GREETING.to_string(), None),
        Some(Intent::Fallback) => {
            let reason = state
                .intent_reason
                .clone()
                .unwrap_or_else(|| OFF_TOPIC_REJECTION.to_string());
            return (reason, Some(FailureKind::Intent));
        }
        _ => {}
    }

    if state.failure_kind == Some(FailureKind::Configuration) {
        let detail = state.error.as_deref().unwrap_or("unknown configuration problem");
        return (
            format!("I can't answer questions right now: {}", detail),
            Some(FailureKind::Configuration),
        );
    }

    if state.validation_passed == Some(false) {
        if state.generation_failed() {
            return (
                "I couldn't generate a SQL query for that question. Please try rephrasing it."
                    .to_string(),
                Some(FailureKind::Generation),
            );
        }
        let error = state.validation_error.as_deref().unwrap_or("unknown error");
        return (
            format!("The generated SQL failed validation: {}", error),
            Some(FailureKind::Validation),
        );
    }

    if let Some(error) = &state.execution_error {
        return (
            format!("The query could not be executed: {}", error),
            Some(FailureKind::Execution),
        );
    }

    if let Some(result) = &state.query_result {
        if result.is_empty() {
            let output = format!(
                "{}\n\nTry a similar question: {}",
                EMPTY_RESULT,
                suggest_similar_question(&state.user_input)
            );
            return (output, Some(FailureKind::EmptyResult));
        }
        return (markdown_table(result), None);
    }

    if let Some(error) = &state.error {
        return (format!("Something went wrong: {}", error), state.failure_kind);
    }

    (NO_ANSWER.to_string(), state.failure_kind)
}

fn cell(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace('|', "\\|").replace('\n', " ")
}

pub fn markdown_table(result: &QueryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "| {} |", result.columns.join(" | "));
    let _ = writeln!(
        out,
        "|{}",
        result.columns.iter().map(|_| " --- |").collect::<String>()
    );
    for row in &result.rows {
        let cells = result
            .columns
            .iter()
            .map(|c| cell(row.get(c).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }

    let noun = if result.row_count == 1 { "row" } else { "rows" };
    let _ = write!(out, "\n{} {}", result.row_count, noun);
    if result.truncated {
        out.push_str(" (result truncated)");
    }
    out
}
