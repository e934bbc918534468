use super::LlmManager;
use crate::prompt::{self, PromptError};
use minijinja::{Environment, context};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const READ_ONLY_REJECTION: &str =
    "Data manipulation not allowed. Only read-only (SELECT) queries are supported.";
pub const OFF_TOPIC_REJECTION: &str =
    "I can only answer questions about the bank's data, such as customers, accounts, loans and transactions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AskQuestion,
    Greet,
    Fallback,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::AskQuestion => "ask_question",
            Intent::Greet => "greet",
            Intent::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentDecision {
    pub intent: Intent,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("invalid destructive intent word list: {0}")]
    Pattern(#[from] regex::Error),
}

/// Compiled size cap for the destructive-word filter.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

const GREETINGS: [&str; 12] = [
    "hi",
    "hello",
    "hey",
    "hi there",
    "hello there",
    "hey there",
    "good morning",
    "good afternoon",
    "good evening",
    "greetings",
    "howdy",
    "namaste",
];

pub struct IntentClassifier {
    llm: Arc<LlmManager>,
    env: Environment<'static>,
    destructive: Option<Regex>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<LlmManager>, destructive_words: &[String]) -> Result<Self, IntentError> {
        let words = destructive_words
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        let destructive = if words.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&format!(r"(?i)\b(?:{})\b", words.join("|")))
                    .size_limit(PATTERN_SIZE_LIMIT)
                    .build()?,
            )
        };

        Ok(Self {
            llm,
            env: prompt::environment()?,
            destructive,
        })
    }

    /// The decision the rules alone can make: destructive requests and
    /// plain greetings.
    pub fn screen(&self, input: &str) -> Option<IntentDecision> {
        if let Some(found) = self.destructive.as_ref().and_then(|re| re.find(input)) {
            info!("Rejected request containing '{}'", found.as_str());
            return Some(IntentDecision {
                intent: Intent::Fallback,
                reason: Some(READ_ONLY_REJECTION.to_string()),
            });
        }

        is_greeting(input).then_some(IntentDecision {
            intent: Intent::Greet,
            reason: None,
        })
    }

    /// The model's label for a message the rules left open.
    pub async fn ask_model(&self, input: &str) -> IntentDecision {

        let prompt = match self
            .env
            .get_template("intent_prompt")
            .and_then(|t| t.render(context! { question => input }))
        {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not render intent prompt, assuming a question: {}", e);
                return ask_question();
            }
        };

        match self.llm.complete(&prompt).await {
            Ok(answer) => {
                debug!("Intent model answered '{}'", answer.trim());
                match parse_intent(&answer) {
                    Some(Intent::Fallback) => IntentDecision {
                        intent: Intent::Fallback,
                        reason: Some(OFF_TOPIC_REJECTION.to_string()),
                    },
                    Some(intent) => IntentDecision {
                        intent,
                        reason: None,
                    },
                    None => {
                        warn!("Unrecognised intent '{}', assuming a question", answer.trim());
                        ask_question()
                    }
                }
            }
            Err(e) => {
                warn!("Intent model failed, assuming a question: {}", e);
                ask_question()
            }
        }
    }
}

fn ask_question() -> IntentDecision {
    IntentDecision {
        intent: Intent::AskQuestion,
        reason: None,
    }
}

fn is_greeting(input: &str) -> bool {
    let normalized = input
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    GREETINGS.contains(&normalized.as_str())
}

fn parse_intent(answer: &str) -> Option<Intent> {
    let answer = answer.trim().to_lowercase();
    let first_line = answer.lines().next().unwrap_or_default();
    let label = first_line
        .trim_start_matches("intent:")
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_');

    match label {
        "ask_question" | "ask question" | "question" => Some(Intent::AskQuestion),
        "greet" | "greeting" => Some(Intent::Greet),
        "fallback" => Some(Intent::Fallback),
        _ if answer.contains("ask_question") => Some(Intent::AskQuestion),
        _ if answer.contains("fallback") => Some(Intent::Fallback),
        _ if answer.contains("greet") => Some(Intent::Greet),
        _ => None,
    }
}
