use crate::config::LlmConfig;
use crate::llm::{LlmError, LlmProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    done: Option<bool>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::new();

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        info!("Sending prompt to Ollama model {}", self.model);
        debug!("Ollama API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to connect to Ollama API: {}", e);
                LlmError::Connection(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Ollama API returned error status {}: {}", status, error_text);
            return Err(LlmError::Response(format!(
                "Ollama API returned error status {}: {}",
                status, error_text
            )));
        }

        let body = response.text().await.map_err(|e| {
            error!("Failed to read Ollama response body: {}", e);
            LlmError::Response(e.to_string())
        })?;

        let parsed: OllamaResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse Ollama response: {}", e);
            debug!("Raw Ollama response: {}", body);
            LlmError::Response(format!("Failed to parse Ollama response: {}", e))
        })?;

        if parsed.done == Some(false) {
            debug!("Ollama reported an unfinished generation");
        }

        Ok(parsed.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
