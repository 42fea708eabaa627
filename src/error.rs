//! Error taxonomy for the theme evolution engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine components
#[derive(Error, Debug)]
pub enum EngineError {
    /// Embedding backend failed after retries; carries the offending texts
    #[error("embedding failed for {} text(s): {source_message}", texts.len())]
    EmbeddingFailed {
        texts: Vec<String>,
        source_message: String,
    },

    /// LLM generation backend failed after retries
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The extractor could not parse the model output even after the
    /// reformat retry; recovered locally, never fatal for a batch
    #[error("extractor could not parse model output: {0}")]
    ExtractorParseFailed(String),

    /// Uniqueness or foreign-key violation in the store
    #[error("integrity conflict: {0}")]
    IntegrityConflict(String),

    /// The store could not be reached or a statement failed
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The ambient cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// Configuration rejected before any state mutation
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Batch input rejected before any state mutation
    #[error("invalid input: {0}")]
    InputInvalid(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, message) => {
                if code.code == rusqlite::ErrorCode::ConstraintViolation {
                    EngineError::IntegrityConflict(
                        message.clone().unwrap_or_else(|| err.to_string()),
                    )
                } else {
                    EngineError::StoreUnavailable(err.to_string())
                }
            }
            _ => EngineError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::StoreUnavailable(format!("payload serialization failed: {err}"))
    }
}

impl EngineError {
    /// Whether the error aborts the current batch (as opposed to being
    /// recovered inside a component)
    pub fn aborts_batch(&self) -> bool {
        !matches!(self, EngineError::ExtractorParseFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_integrity_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: 2067,
            },
            Some("UNIQUE constraint failed".to_string()),
        );
        assert!(matches!(
            EngineError::from(err),
            EngineError::IntegrityConflict(_)
        ));
    }

    #[test]
    fn parse_failure_is_recoverable() {
        assert!(!EngineError::ExtractorParseFailed("x".into()).aborts_batch());
        assert!(EngineError::Cancelled.aborts_batch());
    }
}
