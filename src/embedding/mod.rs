pub mod providers;

use crate::config::EmbeddingConfig;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding connection error: {0}")]
    Connection(String),
    #[error("embedding response error: {0}")]
    Response(String),
    #[error("embedding configuration error: {0}")]
    Config(String),
    #[error("embedding request timed out after {0}s")]
    Timeout(u64),
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Stable name of the model, recorded in index manifests.
    fn model_id(&self) -> String;
}

/// Picks the configured backend and bounds every call with a timeout.
pub struct EmbeddingManager {
    embedder: Box<dyn Embedder>,
    timeout: Duration,
}

impl EmbeddingManager {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let embedder: Box<dyn Embedder> = match config.backend.as_str() {
            "local" => Box::new(providers::local::LocalEmbedder::new(config.dimensions)?),
            "ollama" => Box::new(providers::ollama::OllamaEmbedder::new(config)?),
            "remote" => Box::new(providers::remote::RemoteEmbedder::new(config)?),
            _ => {
                return Err(EmbeddingError::Config(format!(
                    "Unsupported embedding backend: {}",
                    config.backend
                )));
            }
        };

        Ok(Self::with_embedder(
            embedder,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn with_embedder(embedder: Box<dyn Embedder>, timeout: Duration) -> Self {
        Self { embedder, timeout }
    }
}

#[async_trait]
impl Embedder for EmbeddingManager {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!("Embedding {} chars", text.len());
        match tokio::time::timeout(self.timeout, self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Embedding call exceeded {:?}", self.timeout);
                Err(EmbeddingError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        debug!("Embedding batch of {} texts", texts.len());
        match tokio::time::timeout(self.timeout, self.embedder.embed_batch(texts)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Embedding batch exceeded {:?}", self.timeout);
                Err(EmbeddingError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    fn model_id(&self) -> String {
        self.embedder.model_id()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}
