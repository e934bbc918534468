use crate::config::SafetyConfig;
use crate::db::{ExecutionError, SqlEngine};
use crate::sql::{self, SqlTokens};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Valid,
    InvalidFinal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub error: Option<String>,
    /// Set when the one-shot repair produced the statement that passed.
    pub repaired_sql: Option<String>,
    pub warning: Option<String>,
    pub state: ValidationState,
}

impl ValidationReport {
    fn valid(repaired_sql: Option<String>, warning: Option<String>) -> Self {
        Self {
            passed: true,
            error: None,
            repaired_sql,
            warning,
            state: ValidationState::Valid,
        }
    }

    fn invalid(error: String) -> Self {
        Self {
            passed: false,
            error: Some(error),
            repaired_sql: None,
            warning: None,
            state: ValidationState::InvalidFinal,
        }
    }
}

struct Rejection {
    message: String,
    repairable: bool,
}

impl Rejection {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            repairable: false,
        }
    }

    fn repairable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            repairable: true,
        }
    }
}

const STOPWORDS: [&str; 40] = [
    "the", "and", "for", "are", "was", "were", "with", "what", "which", "who", "whom", "how",
    "many", "much", "all", "each", "every", "from", "that", "this", "these", "those", "have",
    "has", "had", "there", "their", "list", "show", "give", "tell", "find", "get", "please",
    "any", "per", "than", "into", "does", "did",
];

pub struct Validator {
    forbidden: HashSet<String>,
    min_overlap: f32,
    engine: Option<Arc<dyn SqlEngine>>,
}

impl Validator {
    pub fn new(config: &SafetyConfig, engine: Option<Arc<dyn SqlEngine>>) -> Self {
        Self {
            forbidden: config
                .forbidden_sql_keywords
                .iter()
                .map(|k| k.trim().to_uppercase())
                .collect(),
            min_overlap: config.semantic_overlap_min_ratio,
            engine,
        }
    }

    /// Safety and syntax checks with at most one mechanical repair. A
    /// forbidden keyword is never repaired.
    pub async fn validate(&self, sql: &str, question: &str) -> ValidationReport {
        let rejection = match self.check(sql).await {
            Ok(()) => {
                return ValidationReport::valid(None, self.overlap_warning(sql, question));
            }
            Err(rejection) => rejection,
        };

        if rejection.repairable {
            if let Some(repaired) = self.repair(sql) {
                debug!("Retrying validation with repaired SQL: {}", repaired);
                if self.check(&repaired).await.is_ok() {
                    info!("SQL passed validation after repair");
                    let warning = self.overlap_warning(&repaired, question);
                    return ValidationReport::valid(Some(repaired), warning);
                }
            }
        }

        warn!("SQL failed validation: {}", rejection.message);
        ValidationReport::invalid(rejection.message)
    }

    async fn check(&self, sql: &str) -> Result<(), Rejection> {
        if sql.trim().is_empty() {
            return Err(Rejection::fatal("No SQL statement to validate."));
        }

        let tokens = SqlTokens::parse(sql)
            .map_err(|e| Rejection::fatal(format!("SQL could not be tokenized: {}", e)))?;

        if let Some(keyword) = self.forbidden_keyword(&tokens) {
            return Err(Rejection::fatal(format!(
                "Forbidden SQL keyword: {}. Only read-only (SELECT) queries are allowed.",
                keyword
            )));
        }

        if tokens.statement_count() > 1 {
            return Err(Rejection::fatal("Only a single SQL statement is allowed."));
        }

        match tokens.first_keyword().as_deref() {
            Some("SELECT") | Some("WITH") => {}
            _ => {
                return Err(Rejection::repairable(
                    "Only SELECT or WITH queries are allowed.",
                ));
            }
        }

        self.check_syntax(sql).await
    }

    async fn check_syntax(&self, sql: &str) -> Result<(), Rejection> {
        if let Some(engine) = &self.engine {
            match engine.dry_run(sql).await {
                Ok(()) => return Ok(()),
                Err(ExecutionError::Query(message)) => {
                    return Err(Rejection::repairable(format!("SQL error: {}", message)));
                }
                Err(e) => {
                    warn!("Engine dry run unavailable, falling back to the parser: {}", e);
                }
            }
        }

        match sql::parse_error(sql) {
            None if sql::parses_as_query(sql) => Ok(()),
            None => Err(Rejection::fatal("SQL is not a query.")),
            Some(message) => Err(Rejection::repairable(format!("SQL syntax error: {}", message))),
        }
    }

    fn forbidden_keyword(&self, tokens: &SqlTokens) -> Option<String> {
        (0..tokens.len())
            .filter_map(|i| tokens.word(i))
            .filter(|w| w.quote_style.is_none())
            .map(|w| w.value.to_uppercase())
            .find(|w| self.forbidden.contains(w))
    }

    /// Adds a missing SELECT in front of a bare column list and a missing
    /// terminating semicolon. `None` when there is nothing to change.
    fn repair(&self, sql: &str) -> Option<String> {
        let tokens = SqlTokens::parse(sql).ok()?;
        let mut repaired = sql.trim().to_string();

        let starts_like_a_query = matches!(
            tokens.first_keyword().as_deref(),
            Some("SELECT") | Some("WITH")
        );
        if !starts_like_a_query && tokens.find_top_level(&["FROM"]).is_some() {
            repaired = format!("SELECT {}", repaired);
        }
        if !repaired.ends_with(';') {
            repaired.push(';');
        }

        (repaired != sql).then_some(repaired)
    }

    fn overlap_warning(&self, sql: &str, question: &str) -> Option<String> {
        let ratio = semantic_overlap(question, sql)?;
        if ratio < self.min_overlap {
            info!("Low semantic overlap between question and SQL: {:.2}", ratio);
            Some(format!(
                "The generated SQL shares few terms with the question (overlap {:.0}%); check that it answers what was asked.",
                ratio * 100.0
            ))
        } else {
            None
        }
    }
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let w = w.to_lowercase();
            match w.strip_suffix('s') {
                Some(stem) if stem.len() >= 3 => stem.to_string(),
                _ => w,
            }
        })
}

/// Share of meaningful question terms that appear in the SQL, or `None`
/// when the question has no meaningful terms.
pub fn semantic_overlap(question: &str, sql: &str) -> Option<f32> {
    let question_terms: HashSet<String> = terms(question)
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect();
    if question_terms.is_empty() {
        return None;
    }
    let sql_terms: HashSet<String> = terms(sql).collect();
    let shared = question_terms.intersection(&sql_terms).count();
    Some(shared as f32 / question_terms.len() as f32)
}
