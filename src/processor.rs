//! Batch orchestration
//!
//! Drives one batch end-to-end through the pipeline: persist responses
//! with embeddings, extract candidates, match and dedupe, highlight and
//! persist assignments, then run the evolution passes and commit the
//! batch metadata. Responses persisted in step one are immutable and
//! survive a failed batch; everything else rolls back together.

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::embedding::{Embedder, EmbeddingProvider, OllamaEmbedding};
use crate::error::{EngineError, Result};
use crate::evolve::{BatchEvolution, EvolverThresholds, PendingAssignment, ThemeEvolver};
use crate::extract::ThemeExtractor;
use crate::highlight::KeywordHighlighter;
use crate::llm::{GenerationClient, OllamaGeneration};
use crate::models::{
    BatchData, BatchMetadata, BatchResult, EvolutionAction, SurveyResponse, Theme,
};
use crate::storage::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-batch outcome of `process_many`
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: i64,
    pub result: Result<BatchResult>,
}

/// Component health snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub generation_backend: bool,
    pub embedding_backend: bool,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.store && self.generation_backend && self.embedding_backend
    }
}

/// Orchestrates the theme evolution pipeline
pub struct BatchProcessor {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    extractor: Arc<ThemeExtractor>,
    highlighter: KeywordHighlighter,
    evolver: ThemeEvolver,
    generation: Arc<dyn GenerationClient>,
    batch_timeout: Duration,
    cancel: CancelToken,
}

impl BatchProcessor {
    /// Wire the pipeline with explicit backends (tests inject mocks here)
    pub fn new(
        config: &EngineConfig,
        store: Arc<Store>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        generation: Arc<dyn GenerationClient>,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;

        let embedder = Arc::new(
            Embedder::new(
                embedding_provider,
                Arc::clone(&store),
                config.processing.embed_parallelism,
                Duration::from_secs(config.processing.shutdown_timeout),
                cancel.clone(),
            )
            .with_batch_size(config.processing.batch_size),
        );
        let extractor = Arc::new(ThemeExtractor::new(
            Arc::clone(&generation),
            Arc::clone(&embedder),
            &config.ollama.generation_model,
            config.processing.prompt_char_limit,
            cancel.clone(),
        ));
        let highlighter = KeywordHighlighter::new(
            Arc::clone(&embedder),
            config.ngrams.clone(),
            config.thresholds.min_contribution,
            config.processing.max_keywords,
        );
        let evolver = ThemeEvolver::new(
            Arc::clone(&store),
            Arc::clone(&extractor),
            Arc::clone(&embedder),
            EvolverThresholds::from(config),
            cancel.clone(),
        );

        Ok(Self {
            store,
            embedder,
            extractor,
            highlighter,
            evolver,
            generation,
            batch_timeout: Duration::from_secs(config.processing.batch_timeout),
            cancel,
        })
    }

    /// Wire the pipeline against the configured Ollama endpoints
    pub fn with_ollama(config: &EngineConfig, store: Arc<Store>, cancel: CancelToken) -> Result<Self> {
        let embedding: Arc<dyn EmbeddingProvider> = Arc::new(OllamaEmbedding::new(
            &config.ollama.base_url,
            &config.ollama.embedding_model,
            config.ollama.embedding_dim,
            Duration::from_secs(config.ollama.embedding_timeout),
        ));
        let generation: Arc<dyn GenerationClient> = Arc::new(OllamaGeneration::new(
            &config.ollama.base_url,
            &config.ollama.generation_model,
            Duration::from_secs(config.ollama.generation_timeout),
            config.processing.llm_concurrency,
        ));
        Self::new(config, store, embedding, generation, cancel)
    }

    /// Process one batch end-to-end
    ///
    /// Returns a fully populated result or the single error that aborted
    /// the batch. Responses persisted before the transaction opened are
    /// retained either way.
    pub async fn process_batch(&self, batch: BatchData) -> Result<BatchResult> {
        let outcome = tokio::time::timeout(self.batch_timeout, self.run_pipeline(&batch)).await;
        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => {
                tracing::warn!(batch_id = batch.batch_id, "batch deadline exceeded");
                Err(EngineError::Cancelled)
            }
        };

        match result {
            Ok(result) => Ok(result),
            Err(error) => {
                if self.store.in_transaction() {
                    if let Err(rollback_error) = self.store.rollback_batch() {
                        tracing::error!(%rollback_error, "rollback failed");
                    }
                }
                tracing::error!(batch_id = batch.batch_id, %error, "batch failed");
                Err(error)
            }
        }
    }

    async fn run_pipeline(&self, batch: &BatchData) -> Result<BatchResult> {
        let start = Instant::now();
        self.cancel.ensure_active()?;
        self.validate_batch(batch)?;
        tracing::info!(
            batch_id = batch.batch_id,
            responses = batch.responses.len(),
            "processing batch"
        );

        // Step 1: persist responses with embeddings (immutable, outside tx)
        let responses = self.ingest_responses(batch).await?;
        self.cancel.ensure_active()?;

        self.store.begin_batch()?;

        // Step 2: propose candidate themes
        let texts: Vec<&str> = batch.responses.iter().map(|s| s.as_str()).collect();
        let candidates = self
            .extractor
            .extract(&batch.question, &texts, batch.batch_id)
            .await?;
        self.cancel.ensure_active()?;

        // Step 3: match against the catalog, then fold candidates in
        let mut state = BatchEvolution::new();
        let mut pending = self.evolver.match_to_existing(&responses, &mut state)?;
        let (from_candidates, _created) =
            self.evolver
                .dedupe_candidates(candidates, &responses, batch.batch_id, &mut state)?;
        pending.extend(from_candidates);

        // Steps 4-5: highlight keywords and persist assignments
        self.persist_assignments(&responses, pending, batch.batch_id)
            .await?;
        self.cancel.ensure_active()?;

        // Step 6: evolution passes in fixed order
        self.evolver.detect_merges(batch.batch_id, &mut state).await?;
        self.evolver.detect_splits(batch.batch_id, &mut state).await?;
        self.evolver
            .refresh_descriptions(batch.batch_id, &mut state)
            .await?;
        self.evolver.retire_empty(batch.batch_id, &mut state)?;

        // Step 7: batch metadata and commit
        let evolution = self.store.evolution_by_batch(batch.batch_id)?;
        let themes_created = count_actions(&evolution, EvolutionAction::Created);
        let themes_updated = count_actions(&evolution, EvolutionAction::Updated);
        let themes_deleted = count_actions(&evolution, EvolutionAction::Merged)
            + count_actions(&evolution, EvolutionAction::Split)
            + count_actions(&evolution, EvolutionAction::Retired);

        let processing_time_seconds = start.elapsed().as_secs_f64();
        self.store.put_batch_metadata(&BatchMetadata {
            batch_id: batch.batch_id,
            question: batch.question.clone(),
            total_responses: responses.len() as i64,
            new_themes_count: themes_created as i64,
            updated_themes_count: themes_updated as i64,
            deleted_themes_count: themes_deleted as i64,
            processing_time_seconds,
        })?;
        self.store.commit_batch()?;

        tracing::info!(
            batch_id = batch.batch_id,
            themes_created,
            themes_updated,
            themes_deleted,
            elapsed = processing_time_seconds,
            "batch committed"
        );

        Ok(BatchResult {
            batch_id: batch.batch_id,
            question: batch.question.clone(),
            processing_time_seconds,
            total_responses: responses.len(),
            themes_created,
            themes_updated,
            themes_deleted,
            evolution,
        })
    }

    /// Process batches sequentially in the given order
    ///
    /// A failure aborts the remaining batches unless `continue_on_error`
    /// is set, in which case each failure is reported independently and
    /// the catalog is as of the last successful batch.
    pub async fn process_many(
        &self,
        batches: Vec<BatchData>,
        continue_on_error: bool,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(batches.len());
        for batch in batches {
            let batch_id = batch.batch_id;
            let result = self.process_batch(batch).await;
            let failed = result.is_err();
            outcomes.push(BatchOutcome { batch_id, result });
            if failed && !continue_on_error {
                break;
            }
        }
        outcomes
    }

    /// Probe the store and both remote backends
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            store: self.store.stats().is_ok(),
            generation_backend: self.generation.is_available().await,
            embedding_backend: self.embedder.backend_available().await,
        }
    }

    /// Fire the ambient cancellation token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn validate_batch(&self, batch: &BatchData) -> Result<()> {
        if batch.question.trim().is_empty() {
            return Err(EngineError::InputInvalid(
                "batch question must not be empty".to_string(),
            ));
        }
        if self.store.get_batch_metadata(batch.batch_id)?.is_some() {
            return Err(EngineError::IntegrityConflict(format!(
                "batch {} was already processed",
                batch.batch_id
            )));
        }
        if let Some(latest) = self.store.latest_batch_id()? {
            if batch.batch_id < latest {
                return Err(EngineError::InputInvalid(format!(
                    "batch ids must be monotonic: got {} after {latest}",
                    batch.batch_id
                )));
            }
        }
        Ok(())
    }

    async fn ingest_responses(&self, batch: &BatchData) -> Result<Vec<SurveyResponse>> {
        let embeddings = self.embedder.embed_many(&batch.responses).await?;
        let mut responses = Vec::with_capacity(batch.responses.len());
        for (text, embedding) in batch.responses.iter().zip(embeddings) {
            let mut response = SurveyResponse {
                id: None,
                batch_id: batch.batch_id,
                question: batch.question.clone(),
                text: text.clone(),
                embedding,
            };
            response.id = Some(self.store.put_response(&response)?);
            responses.push(response);
        }
        Ok(responses)
    }

    /// Deduplicate planned assignments, highlight each pair, and persist
    async fn persist_assignments(
        &self,
        responses: &[SurveyResponse],
        pending: Vec<PendingAssignment>,
        batch_id: i64,
    ) -> Result<()> {
        // Highest confidence wins when a pair was planned twice
        let mut unique: HashMap<(i64, i64), f32> = HashMap::new();
        for p in pending {
            let entry = unique.entry((p.response_id, p.theme_id)).or_insert(p.confidence);
            if p.confidence > *entry {
                *entry = p.confidence;
            }
        }

        let by_id: HashMap<i64, &SurveyResponse> = responses
            .iter()
            .filter_map(|r| r.id.map(|id| (id, r)))
            .collect();
        let mut themes: HashMap<i64, Theme> = HashMap::new();

        let mut pairs: Vec<((i64, i64), f32)> = unique.into_iter().collect();
        pairs.sort_by_key(|((response_id, theme_id), _)| (*response_id, *theme_id));

        for ((response_id, theme_id), confidence) in pairs {
            let Some(response) = by_id.get(&response_id) else {
                continue;
            };
            if !themes.contains_key(&theme_id) {
                match self.store.get_theme(theme_id)? {
                    Some(theme) => {
                        themes.insert(theme_id, theme);
                    }
                    None => continue,
                }
            }
            let theme = &themes[&theme_id];

            let keywords = self
                .highlighter
                .highlight(&response.text, &theme.embedding)
                .await?;
            self.store
                .put_assignment(response_id, theme_id, confidence, &keywords, batch_id)?;
        }
        Ok(())
    }
}

fn count_actions(entries: &[crate::models::EvolutionEntry], action: EvolutionAction) -> usize {
    entries.iter().filter(|e| e.action == action).count()
}
