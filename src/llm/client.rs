//! Generation client for API communication

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const MAX_TRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Sampling options for a generation call
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub num_predict: i32,
}

impl GenerateOptions {
    /// Settings used for theme extraction
    pub fn extraction() -> Self {
        Self {
            temperature: 0.3,
            top_p: Some(0.9),
            num_predict: 2000,
        }
    }

    /// Settings used for one-sentence description refresh
    pub fn refresh() -> Self {
        Self {
            temperature: 0.3,
            top_p: None,
            num_predict: 200,
        }
    }
}

/// Trait for LLM generation backends
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Run one prompt and return the raw completion text
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<String>;

    /// Whether the backend is reachable
    async fn is_available(&self) -> bool {
        true
    }
}

/// Generation client backed by an Ollama server
///
/// The backend is a single rate-limited endpoint; an internal semaphore
/// caps concurrent generation calls.
pub struct OllamaGeneration {
    endpoint: String,
    model: String,
    client: reqwest::Client,
    permits: Semaphore,
}

impl OllamaGeneration {
    pub fn new(endpoint: &str, model: &str, timeout: Duration, concurrency: usize) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            permits: Semaphore::new(concurrency.max(1)),
        }
    }

    async fn generate_once(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> std::result::Result<String, (String, bool)> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                num_predict: options.num_predict,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| (format!("request failed: {e}"), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err((
                format!("generation request failed: {status} - {body}"),
                status.is_server_error(),
            ));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| (format!("failed to parse generation response: {e}"), false))?;
        Ok(result.response)
    }
}

#[async_trait]
impl GenerationClient for OllamaGeneration {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<String> {
        let _permit = self.permits.acquire().await.expect("semaphore open");

        let mut last = String::new();
        for attempt in 0..MAX_TRIES {
            match self.generate_once(prompt, options).await {
                Ok(text) => return Ok(text),
                Err((message, transient)) => {
                    tracing::warn!(attempt = attempt + 1, error = %message, "generation failed");
                    last = message;
                    if !transient || attempt + 1 == MAX_TRIES {
                        break;
                    }
                    let delay = BACKOFF_BASE_MS * (1 << attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        Err(EngineError::GenerationFailed(last))
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Mock generation client for testing
///
/// Responses are keyed by a substring of the prompt; the first match wins,
/// falling back to a configurable default. A counter records how many
/// prompts reached the "backend".
pub struct MockGeneration {
    responses: Vec<(String, String)>,
    default_response: String,
    calls: AtomicUsize,
}

impl MockGeneration {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            default_response: "[]".to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a canned response for prompts containing `prompt_contains`
    pub fn add_response(mut self, prompt_contains: &str, response: &str) -> Self {
        self.responses
            .push((prompt_contains.to_string(), response.to_string()));
        self
    }

    /// Replace the fallback response
    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Number of prompts generated through this client
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Arc convenience for injection
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Default for MockGeneration {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationClient for MockGeneration {
    async fn generate(&self, prompt: &str, _options: GenerateOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (needle, response) in &self.responses {
            if prompt.contains(needle) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }
}
