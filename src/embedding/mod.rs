//! Embedding generation and caching
//!
//! Providers turn text into fixed-dimension vectors; the [`Embedder`] wraps
//! a provider with the content-addressed cache in the store, L2
//! normalization, empty-input short-circuiting, and bounded concurrent
//! fan-out for batch requests.

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::storage::Store;
use crate::vectors::l2_normalize;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Retry schedule for transient backend failures
const MAX_TRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Compute the 64-hex SHA-256 cache key for an input text
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Trait for embedding backends
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single nonempty text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension of the model
    fn dimension(&self) -> usize;

    /// Model identifier used to scope the cache
    fn model_name(&self) -> &str;

    /// Whether the backend is reachable
    async fn is_available(&self) -> bool {
        true
    }
}

/// Embedding provider backed by an Ollama server
pub struct OllamaEmbedding {
    endpoint: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OllamaEmbedding {
    pub fn new(endpoint: &str, model: &str, dimension: usize, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn embed_once(&self, text: &str) -> std::result::Result<Vec<f32>, RemoteError> {
        let url = format!("{}/api/embeddings", self.endpoint);
        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RemoteError {
                message: format!("request failed: {e}"),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError {
                message: format!("embedding request failed: {status} - {body}"),
                transient: status.is_server_error(),
            });
        }

        let result: OllamaEmbeddingResponse = response.json().await.map_err(|e| RemoteError {
            message: format!("failed to parse embedding response: {e}"),
            transient: false,
        })?;
        Ok(result.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match with_backoff(|| self.embed_once(text)).await {
            Ok(vector) => Ok(vector),
            Err(e) => Err(EngineError::EmbeddingFailed {
                texts: vec![text.to_string()],
                source_message: e.message,
            }),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

struct RemoteError {
    message: String,
    transient: bool,
}

/// Retry a remote call on transient failures with capped backoff
async fn with_backoff<T, F, Fut>(mut call: F) -> std::result::Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, RemoteError>>,
{
    let mut last = None;
    for attempt in 0..MAX_TRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let transient = e.transient;
                tracing::warn!(attempt = attempt + 1, error = %e.message, "remote call failed");
                last = Some(e);
                if !transient || attempt + 1 == MAX_TRIES {
                    break;
                }
                let delay = BACKOFF_BASE_MS * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
    Err(last.unwrap_or(RemoteError {
        message: "unknown remote error".to_string(),
        transient: false,
    }))
}

/// Deterministic hashed bag-of-words provider for tests
///
/// Tokens listed under a topic all land on that topic's dedicated axis, so
/// two texts about the same topic come out strongly aligned; every other
/// token is hashed into the remaining axes. Vectors are unit-normalized
/// and a counter records how many texts reached the "backend".
pub struct MockEmbedding {
    dimension: usize,
    topics: Vec<Vec<String>>,
    calls: AtomicUsize,
}

impl MockEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            topics: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Reserve one axis per topic, recognized by its keyword list
    pub fn with_topics(dimension: usize, topics: &[&[&str]]) -> Self {
        Self {
            dimension,
            topics: topics
                .iter()
                .map(|words| words.iter().map(|w| w.to_string()).collect())
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of texts embedded through this provider
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let topic = self.topics.iter().position(|words| words.contains(&token));
            match topic {
                Some(axis) => vector[axis] += 1.0,
                None => {
                    let bucket = self.topics.len()
                        + (fnv1a(&token) as usize) % (self.dimension - self.topics.len()).max(1);
                    vector[bucket] += 1.0;
                }
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Cache-aware embedding front end shared by every component
///
/// Read-through against the store's content-addressed cache; misses fan
/// out to the provider under a bounded semaphore and every returned vector
/// is unit-normalized before it is cached or handed back.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<Store>,
    semaphore: Arc<Semaphore>,
    cancel: CancelToken,
    shutdown_timeout: Duration,
    batch_size: usize,
}

impl Embedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<Store>,
        parallelism: usize,
        shutdown_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            store,
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            cancel,
            shutdown_timeout,
            batch_size: 100,
        }
    }

    /// Cap on how many cache misses are dispatched per round trip group
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn backend_available(&self) -> bool {
        self.provider.is_available().await
    }

    /// Embed one text; empty input yields the zero vector without any
    /// backend traffic
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_many(&texts).await?;
        Ok(vectors.pop().expect("one vector per input"))
    }

    /// Embed a batch; cache hits are served locally, misses are deduplicated
    /// and fanned out concurrently
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.cancel.ensure_active()?;
        let dim = self.provider.dimension();
        let model = self.provider.model_name().to_string();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        // Unique miss text -> indexes waiting on it
        let mut misses: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results[i] = Some(vec![0.0; dim]);
                continue;
            }
            let hash = text_hash(text);
            if let Some(mut cached) = self.store.cache_get(&hash, &model)? {
                l2_normalize(&mut cached);
                results[i] = Some(cached);
            } else {
                misses.entry(text.clone()).or_default().push(i);
            }
        }

        if !misses.is_empty() {
            tracing::debug!(count = misses.len(), "embedding cache misses");
            let mut miss_list: Vec<(String, Vec<usize>)> = misses.into_iter().collect();
            miss_list.sort_by(|a, b| a.1[0].cmp(&b.1[0]));

            let mut failed: Vec<String> = Vec::new();
            let mut first_message = String::new();
            let mut cancelled = false;

            // Misses go out in groups so one oversized batch cannot hold the
            // backend for the whole deadline
            for group in miss_list.chunks(self.batch_size) {
                let mut handles = Vec::with_capacity(group.len());
                for (text, indexes) in group {
                    let text = text.clone();
                    let indexes = indexes.clone();
                    let provider = Arc::clone(&self.provider);
                    let semaphore = Arc::clone(&self.semaphore);
                    let cancel = self.cancel.clone();
                    let grace = self.shutdown_timeout;
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                        if cancel.is_cancelled() {
                            return (text, indexes, Err(EngineError::Cancelled));
                        }
                        let result = tokio::select! {
                            r = provider.embed(&text) => r,
                            _ = async {
                                cancel.cancelled().await;
                                tokio::time::sleep(grace).await;
                            } => Err(EngineError::Cancelled),
                        };
                        (text, indexes, result)
                    }));
                }

                for handle in handles {
                    let (text, indexes, result) = handle.await.map_err(|e| {
                        EngineError::EmbeddingFailed {
                            texts: Vec::new(),
                            source_message: format!("embedding task panicked: {e}"),
                        }
                    })?;
                    match result {
                        Ok(mut vector) => {
                            l2_normalize(&mut vector);
                            self.store.cache_put(&text_hash(&text), &vector, &model)?;
                            for i in indexes {
                                results[i] = Some(vector.clone());
                            }
                        }
                        Err(EngineError::Cancelled) => cancelled = true,
                        Err(EngineError::EmbeddingFailed {
                            texts,
                            source_message,
                        }) => {
                            if first_message.is_empty() {
                                first_message = source_message;
                            }
                            failed.extend(texts);
                            failed.push(text);
                            failed.dedup();
                        }
                        Err(other) => return Err(other),
                    }
                }

                // A failed or cancelled group stops later groups from
                // dispatching at all
                if cancelled {
                    return Err(EngineError::Cancelled);
                }
                if !failed.is_empty() {
                    return Err(EngineError::EmbeddingFailed {
                        texts: failed,
                        source_message: first_message,
                    });
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.expect("every slot filled"))
            .collect())
    }
}
