use super::{LlmError, LlmManager};
use crate::db::QueryResult;
use crate::pipeline::format::markdown_table;
use crate::prompt::{self, PromptError};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Rows of a result the model gets to read.
pub const ANALYSIS_ROWS: usize = 30;
pub const NO_DATA_FOR_INSIGHTS: &str = "No data available for insights.";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("unusable chart suggestion: {0}")]
    Chart(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
}

/// A chart the model proposed for a result. Bar, line and scatter charts
/// use `x`/`y`; pie charts use `labels`/`values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSuggestion {
    #[serde(default)]
    pub explanation: String,
    pub chart_type: ChartType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default)]
    pub top_n: Option<usize>,
}

impl ChartSuggestion {
    pub fn category(&self) -> Option<&str> {
        match self.chart_type {
            ChartType::Pie => self.labels.as_deref().or(self.x.as_deref()),
            _ => self.x.as_deref().or(self.labels.as_deref()),
        }
    }

    pub fn measure(&self) -> Option<&str> {
        match self.chart_type {
            ChartType::Pie => self.values.as_deref().or(self.y.as_deref()),
            _ => self.y.as_deref().or(self.values.as_deref()),
        }
    }

    /// The rows to draw: all of them, or the `top_n` largest by the measure.
    pub fn plot_rows(&self, result: &QueryResult) -> Vec<Map<String, Value>> {
        let mut rows = result.rows.clone();
        if let (Some(n), Some(measure)) = (self.top_n, self.measure()) {
            rows.sort_by(|a, b| descending(a.get(measure), b.get(measure)));
            rows.truncate(n);
        }
        rows
    }

    fn check_columns(&self, result: &QueryResult) -> Result<(), AnalysisError> {
        if self.category().is_none() || self.measure().is_none() {
            return Err(AnalysisError::Chart(
                "both a category and a measure column are needed".to_string(),
            ));
        }
        for column in [&self.x, &self.y, &self.labels, &self.values]
            .into_iter()
            .flatten()
        {
            if !result.columns.iter().any(|c| c == column) {
                return Err(AnalysisError::Chart(format!(
                    "'{}' is not a column of the result",
                    column
                )));
            }
        }
        Ok(())
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Numbers first, largest first; non-numeric values keep their order at the end.
fn descending(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Reads the explanation line(s) and the JSON object out of a model answer.
fn parse_chart(answer: &str) -> Result<ChartSuggestion, AnalysisError> {
    let (Some(start), Some(end)) = (answer.find('{'), answer.rfind('}')) else {
        return Err(AnalysisError::Chart("no JSON object in the answer".to_string()));
    };
    if end < start {
        return Err(AnalysisError::Chart("no JSON object in the answer".to_string()));
    }

    let mut suggestion: ChartSuggestion = serde_json::from_str(&answer[start..=end])
        .map_err(|e| AnalysisError::Chart(e.to_string()))?;
    if suggestion.explanation.is_empty() {
        suggestion.explanation = answer[..start]
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("```"))
            .collect::<Vec<_>>()
            .join(" ");
    }
    Ok(suggestion)
}

/// Model-written reading of a finished query result.
pub struct ResultAnalyst {
    llm: Arc<LlmManager>,
    env: Environment<'static>,
}

impl ResultAnalyst {
    pub fn new(llm: Arc<LlmManager>) -> Result<Self, PromptError> {
        Ok(Self {
            llm,
            env: prompt::environment()?,
        })
    }

    fn render(
        &self,
        template: &str,
        question: &str,
        result: &QueryResult,
    ) -> Result<String, AnalysisError> {
        let rows = result
            .rows
            .iter()
            .take(ANALYSIS_ROWS)
            .cloned()
            .collect::<Vec<_>>();
        let shown = QueryResult {
            columns: result.columns.clone(),
            row_count: rows.len(),
            truncated: result.truncated || result.rows.len() > ANALYSIS_ROWS,
            rows,
        };

        let prompt = self
            .env
            .get_template(template)
            .and_then(|t| {
                t.render(context! {
                    question => question,
                    table => markdown_table(&shown),
                    max_rows => ANALYSIS_ROWS,
                })
            })
            .map_err(PromptError::from)?;
        Ok(prompt)
    }

    /// Business insights for the result; empty results need no model call.
    pub async fn insights(
        &self,
        question: &str,
        result: &QueryResult,
    ) -> Result<String, AnalysisError> {
        if result.is_empty() {
            return Ok(NO_DATA_FOR_INSIGHTS.to_string());
        }
        let prompt = self.render("insights_prompt", question, result)?;
        let answer = self.llm.complete(&prompt).await?;
        info!("Insights written for {} rows", result.row_count);
        Ok(answer.trim().to_string())
    }

    /// A chart over the result's own columns, or `None` for an empty result.
    pub async fn chart(
        &self,
        question: &str,
        result: &QueryResult,
    ) -> Result<Option<ChartSuggestion>, AnalysisError> {
        if result.is_empty() {
            return Ok(None);
        }
        let prompt = self.render("chart_prompt", question, result)?;
        let answer = self.llm.complete(&prompt).await?;
        debug!("Chart model answered: {}", answer.trim());

        let suggestion = parse_chart(&answer)?;
        suggestion.check_columns(result)?;
        Ok(Some(suggestion))
    }
}
