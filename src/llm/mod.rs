pub mod analysis;
pub mod generator;
pub mod intent;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub use analysis::{AnalysisError, ChartSuggestion, ChartType, ResultAnalyst};
pub use generator::{Generation, SqlGenerator};
pub use intent::{Intent, IntentClassifier, IntentDecision, IntentError};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    Connection(String),
    #[error("LLM response error: {0}")]
    Response(String),
    #[error("LLM configuration error: {0}")]
    Config(String),
    #[error("LLM call timed out after {0}s")]
    Timeout(u64),
}

/// A text-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    fn name(&self) -> &str;
}

pub struct LlmManager {
    provider: Box<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider: Box<dyn LlmProvider> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::Config(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        info!("Using LLM backend {} with model {}", provider.name(), config.model);
        Ok(Self::with_provider(
            provider,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn with_provider(provider: Box<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// One completion, bounded by the configured timeout.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.provider.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "LLM backend {} did not answer within {:?}",
                    self.provider.name(),
                    self.timeout
                );
                Err(LlmError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
