use super::PromptError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const BUILT_IN_EXAMPLES: &str = include_str!("../../assets/few_shot_examples.json");

/// A question paired with the SQL that answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

/// Loads exemplars from `path`, or the built-in banking set when `None`.
pub fn load_examples(path: Option<&Path>) -> Result<Vec<FewShotExample>, PromptError> {
    let examples: Vec<FewShotExample> = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| PromptError::Examples {
                path: path.display().to_string(),
                reason: source.to_string(),
            })?;
            serde_json::from_str(&raw).map_err(|e| PromptError::Examples {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        }
        None => serde_json::from_str(BUILT_IN_EXAMPLES).map_err(|e| PromptError::Examples {
            path: "<built-in>".to_string(),
            reason: e.to_string(),
        })?,
    };

    info!("Loaded {} few-shot examples", examples.len());
    Ok(examples)
}
