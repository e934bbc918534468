use super::LlmManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one generation call. `sql` is empty when `failure` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub sql: String,
    pub raw: String,
    pub failure: Option<String>,
}

pub struct SqlGenerator {
    llm: Arc<LlmManager>,
}

impl SqlGenerator {
    pub fn new(llm: Arc<LlmManager>) -> Self {
        Self { llm }
    }

    /// Exactly one model call. Never errors: failures come back as an
    /// empty statement plus a reason.
    pub async fn generate(&self, prompt: &str) -> Generation {
        let raw = match self.llm.complete(prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("SQL generation failed: {}", e);
                return Generation {
                    failure: Some(e.to_string()),
                    ..Generation::default()
                };
            }
        };

        let sql = extract_sql(&raw);
        if sql.is_empty() {
            warn!("Model response contained no SQL");
            debug!("Raw model response: {}", raw);
            return Generation {
                raw,
                failure: Some("the model response contained no SQL statement".to_string()),
                ..Generation::default()
            };
        }

        info!("Generated SQL: {}", sql);
        Generation {
            sql,
            raw,
            failure: None,
        }
    }
}

const STATEMENT_KEYWORDS: [&str; 8] = [
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP",
];

/// Pulls the SQL statement out of a model response: a ```sql fence, then a
/// bare fence, then the first line that opens with a statement keyword
/// (continued until a line ending in `;`). Returns an empty string when
/// nothing looks like SQL.
pub fn extract_sql(content: &str) -> String {
    if let Some(start) = content.find("```sql") {
        let body = &content[start + 6..];
        let end = body.find("```").unwrap_or(body.len());
        debug!("Extracted SQL from ```sql block");
        return clean(&body[..end]);
    }

    if let Some(start) = content.find("```") {
        let body = &content[start + 3..];
        if let Some(end) = body.find("```") {
            debug!("Extracted SQL from bare code block");
            return clean(&body[..end]);
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim().trim_start_matches('`');
        let upper = trimmed.to_uppercase();
        if !STATEMENT_KEYWORDS.iter().any(|kw| starts_with_word(&upper, kw)) {
            continue;
        }

        let mut sql = trimmed.to_string();
        if !sql.trim_end().ends_with(';') {
            for next in &lines[i + 1..] {
                let next = next.trim();
                if next.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
        }

        debug!("Extracted SQL using line scanning");
        return clean(&sql);
    }

    String::new()
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.strip_prefix(word)
        .is_some_and(|rest| rest.chars().next().is_none_or(|c| !c.is_alphanumeric() && c != '_'))
}

fn clean(sql: &str) -> String {
    sql.trim().trim_matches('`').trim().to_string()
}
