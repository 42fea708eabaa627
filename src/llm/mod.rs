//! LLM generation backend
//!
//! This module handles:
//! - The generation client contract and its Ollama implementation
//! - Prompt templates for extraction, refresh, and cluster naming
//! - A mock client for tests

mod client;
mod prompts;

pub use client::{GenerateOptions, GenerationClient, MockGeneration, OllamaGeneration};
pub use prompts::{
    cluster_naming_prompt, extraction_prompt, format_responses, reformat_retry_prompt,
    refresh_description_prompt,
};
