//! thematic - Incremental theme evolution for free-text survey responses
//!
//! This library organizes batches of short survey responses into a small,
//! evolving set of named themes: it extracts candidates with a local LLM,
//! embeds responses and themes into a shared vector space, assigns
//! responses to themes with highlighted keywords, and keeps the living
//! catalog coherent by merging, splitting, refreshing, and retiring
//! themes as evidence accumulates.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evolve;
pub mod extract;
pub mod highlight;
pub mod llm;
pub mod models;
pub mod processor;
pub mod storage;
pub mod vectors;

/// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use models::{BatchData, BatchResult, Theme, ThemeStatus};
pub use processor::BatchProcessor;
pub use storage::Store;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "thematic";
