//! Engine configuration
//!
//! Every recognized option with its default, loaded from a TOML document.
//! Validation happens before any component is constructed.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Ollama endpoint and model selection
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Similarity and drift thresholds
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Batch processing knobs
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// N-gram extraction settings for the keyword highlighter
    #[serde(default)]
    pub ngrams: NgramConfig,
}

/// Ollama backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for theme extraction and description refresh
    #[serde(default = "default_generation_model")]
    pub generation_model: String,

    /// Model used for embeddings
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Output dimension of the embedding model
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Timeout for a generation call, in seconds
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout: u64,

    /// Timeout for an embedding call, in seconds
    #[serde(default = "default_embedding_timeout")]
    pub embedding_timeout: u64,
}

/// Similarity thresholds that drive theme evolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum cosine similarity for assigning a response to a theme
    #[serde(default = "default_similarity_match")]
    pub similarity_match: f32,

    /// Lower bound for "near" candidates that feed description refresh
    #[serde(default = "default_similarity_update")]
    pub similarity_update: f32,

    /// Similarity at which two themes (or a candidate and a theme) merge
    #[serde(default = "default_similarity_merge")]
    pub similarity_merge: f32,

    /// Intra-theme embedding variance that triggers a split
    #[serde(default = "default_split_variance")]
    pub split_variance: f32,

    /// Cosine distance a refreshed embedding must move before it is applied
    #[serde(default = "default_drift_update")]
    pub drift_update: f32,

    /// Minimum marginal contribution for a highlighted keyword
    #[serde(default = "default_min_contribution")]
    pub min_contribution: f32,

    /// Minimum members each side of a split must keep
    #[serde(default = "default_min_responses_per_theme")]
    pub min_responses_per_theme: usize,
}

/// Batch processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Remote embedding calls grouped per round trip
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum highlighted keywords kept per assignment
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,

    /// Concurrent in-flight embedding requests
    #[serde(default = "default_embed_parallelism")]
    pub embed_parallelism: usize,

    /// Concurrent in-flight generation requests
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,

    /// Total wall-clock deadline for one batch, in seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,

    /// Grace period for in-flight remote calls on cancellation, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Character budget for the extraction prompt
    #[serde(default = "default_prompt_char_limit")]
    pub prompt_char_limit: usize,

    /// Maximum freshly assigned responses fed to a description refresh
    #[serde(default = "default_refresh_sample_size")]
    pub refresh_sample_size: usize,
}

/// N-gram candidate generation for the highlighter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgramConfig {
    #[serde(default = "default_true")]
    pub unigrams: bool,

    #[serde(default = "default_true")]
    pub bigrams: bool,

    #[serde(default = "default_true")]
    pub trigrams: bool,

    /// Minimum token length for a unigram candidate
    #[serde(default = "default_min_word_length")]
    pub min_word_length: usize,

    /// Maximum stopwords tolerated inside a multi-word phrase
    #[serde(default = "default_max_stopwords_in_phrase")]
    pub max_stopwords_in_phrase: usize,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_generation_model() -> String {
    "llama3.1".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_dim() -> usize {
    768
}

fn default_generation_timeout() -> u64 {
    120
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_similarity_match() -> f32 {
    0.75
}

fn default_similarity_update() -> f32 {
    0.50
}

fn default_similarity_merge() -> f32 {
    0.85
}

fn default_split_variance() -> f32 {
    0.40
}

fn default_drift_update() -> f32 {
    0.20
}

fn default_min_contribution() -> f32 {
    0.05
}

fn default_min_responses_per_theme() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_max_keywords() -> usize {
    10
}

fn default_embed_parallelism() -> usize {
    8
}

fn default_llm_concurrency() -> usize {
    1
}

fn default_batch_timeout() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_prompt_char_limit() -> usize {
    12_000
}

fn default_refresh_sample_size() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_min_word_length() -> usize {
    3
}

fn default_max_stopwords_in_phrase() -> usize {
    1
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            generation_model: default_generation_model(),
            embedding_model: default_embedding_model(),
            embedding_dim: default_embedding_dim(),
            generation_timeout: default_generation_timeout(),
            embedding_timeout: default_embedding_timeout(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            similarity_match: default_similarity_match(),
            similarity_update: default_similarity_update(),
            similarity_merge: default_similarity_merge(),
            split_variance: default_split_variance(),
            drift_update: default_drift_update(),
            min_contribution: default_min_contribution(),
            min_responses_per_theme: default_min_responses_per_theme(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_keywords: default_max_keywords(),
            embed_parallelism: default_embed_parallelism(),
            llm_concurrency: default_llm_concurrency(),
            batch_timeout: default_batch_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            prompt_char_limit: default_prompt_char_limit(),
            refresh_sample_size: default_refresh_sample_size(),
        }
    }
}

impl Default for NgramConfig {
    fn default() -> Self {
        Self {
            unigrams: default_true(),
            bigrams: default_true(),
            trigrams: default_true(),
            min_word_length: default_min_word_length(),
            max_stopwords_in_phrase: default_max_stopwords_in_phrase(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or return defaults if absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                EngineError::ConfigurationInvalid(format!("failed to read {path:?}: {e}"))
            })?;
            let config: EngineConfig = toml::from_str(&content).map_err(|e| {
                EngineError::ConfigurationInvalid(format!("failed to parse {path:?}: {e}"))
            })?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject invalid settings before any component is constructed
    pub fn validate(&self) -> Result<()> {
        fn check_unit(name: &str, value: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(EngineError::ConfigurationInvalid(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
            Ok(())
        }

        check_unit("thresholds.similarity_match", self.thresholds.similarity_match)?;
        check_unit("thresholds.similarity_update", self.thresholds.similarity_update)?;
        check_unit("thresholds.similarity_merge", self.thresholds.similarity_merge)?;
        check_unit("thresholds.split_variance", self.thresholds.split_variance)?;
        check_unit("thresholds.drift_update", self.thresholds.drift_update)?;
        check_unit("thresholds.min_contribution", self.thresholds.min_contribution)?;

        if self.thresholds.similarity_update > self.thresholds.similarity_match {
            return Err(EngineError::ConfigurationInvalid(
                "thresholds.similarity_update must not exceed thresholds.similarity_match"
                    .to_string(),
            ));
        }

        if self.ollama.embedding_dim == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "ollama.embedding_dim must be positive".to_string(),
            ));
        }

        if self.processing.embed_parallelism == 0 || self.processing.llm_concurrency == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "processing parallelism limits must be positive".to_string(),
            ));
        }

        if self.thresholds.min_responses_per_theme == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "thresholds.min_responses_per_theme must be positive".to_string(),
            ));
        }

        if self.ngrams.min_word_length == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "ngrams.min_word_length must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.ollama.embedding_model, "nomic-embed-text");
        assert_eq!(config.ollama.embedding_dim, 768);
        assert_eq!(config.ollama.generation_model, "llama3.1");
        assert!((config.thresholds.similarity_match - 0.75).abs() < f32::EPSILON);
        assert!((config.thresholds.similarity_merge - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.processing.embed_parallelism, 8);
        assert_eq!(config.processing.llm_concurrency, 1);
        assert_eq!(config.ngrams.min_word_length, 3);
        config.validate().unwrap();
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = EngineConfig::default();
        config.thresholds.similarity_merge = 1.5;
        assert!(matches!(
            config.validate(),
            Err(EngineError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn inverted_update_match_pair_is_rejected() {
        let mut config = EngineConfig::default();
        config.thresholds.similarity_update = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig =
            toml::from_str("[ollama]\ngeneration_model = \"mistral\"\n").unwrap();
        assert_eq!(config.ollama.generation_model, "mistral");
        assert_eq!(config.ollama.embedding_model, "nomic-embed-text");
        assert_eq!(config.processing.batch_timeout, 300);
    }
}
