//! Command implementations

use super::OutputFormat;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::models::{BatchData, BatchResult};
use crate::processor::{BatchOutcome, BatchProcessor};
use crate::storage::Store;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Load batches from a JSON file
pub fn load_batches(path: &Path) -> Result<Vec<BatchData>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {path:?}"))?;
    let batches: Vec<BatchData> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse batch file {path:?}"))?;
    Ok(batches)
}

/// Process batches against the configured backends
pub fn process(
    db_path: &Path,
    config_path: &Path,
    input: &Path,
    continue_on_error: bool,
    format: OutputFormat,
) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let batches = load_batches(input)?;
    if batches.is_empty() {
        println!("No batches in {input:?}, nothing to do.");
        return Ok(());
    }

    let store = Arc::new(Store::open(db_path)?);
    let cancel = CancelToken::new();

    let rt = tokio::runtime::Runtime::new()?;
    let outcomes = rt.block_on(async {
        let processor = BatchProcessor::with_ollama(&config, store, cancel.clone())?;

        // Ctrl-C cancels the in-flight batch; committed batches stay
        let ctrl_c_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling current batch");
                ctrl_c_cancel.cancel();
            }
        });

        Ok::<_, anyhow::Error>(processor.process_many(batches, continue_on_error).await)
    })?;

    match format {
        OutputFormat::Json => print_outcomes_json(&outcomes)?,
        OutputFormat::Text => print_outcomes_text(&outcomes),
    }

    if outcomes.iter().any(|o| o.result.is_err()) {
        anyhow::bail!("one or more batches failed");
    }
    Ok(())
}

/// Show catalog statistics
pub fn stats(db_path: &Path, format: OutputFormat) -> Result<()> {
    let store = Store::open(db_path)?;
    let stats = store.stats()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("Catalog statistics");
            println!("==================");
            println!("Active themes:     {}", stats.active_themes);
            println!("Total responses:   {}", stats.total_responses);
            println!("Total assignments: {}", stats.total_assignments);
            println!("Processed batches: {}", stats.total_batches);
            println!("Cached embeddings: {}", stats.cached_embeddings);
        }
    }
    Ok(())
}

/// Probe the store and both LLM backends
pub fn health(db_path: &Path, config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let store = Arc::new(Store::open(db_path)?);

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let processor = BatchProcessor::with_ollama(&config, store, CancelToken::new())?;
        Ok::<_, anyhow::Error>(processor.health().await)
    })?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            let mark = |ok: bool| if ok { "ok" } else { "UNREACHABLE" };
            println!("store:              {}", mark(report.store));
            println!("generation backend: {}", mark(report.generation_backend));
            println!("embedding backend:  {}", mark(report.embedding_backend));
        }
    }

    if !report.all_healthy() {
        anyhow::bail!("one or more components are unhealthy");
    }
    Ok(())
}

/// Print the effective configuration as TOML
pub fn show_config(config_path: &Path) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn print_outcomes_text(outcomes: &[BatchOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(result) => print_result_text(result),
            Err(error) => println!("Batch {}: FAILED ({error})", outcome.batch_id),
        }
    }

    let succeeded: Vec<&BatchResult> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .collect();
    if succeeded.len() > 1 {
        let total_responses: usize = succeeded.iter().map(|r| r.total_responses).sum();
        let created: usize = succeeded.iter().map(|r| r.themes_created).sum();
        let updated: usize = succeeded.iter().map(|r| r.themes_updated).sum();
        let deleted: usize = succeeded.iter().map(|r| r.themes_deleted).sum();
        let mean_seconds: f64 = succeeded
            .iter()
            .map(|r| r.processing_time_seconds)
            .sum::<f64>()
            / succeeded.len() as f64;

        println!();
        println!("Summary");
        println!("=======");
        println!("Batches processed: {}", succeeded.len());
        println!("Total responses:   {total_responses}");
        println!("Themes created:    {created}");
        println!("Themes updated:    {updated}");
        println!("Themes deleted:    {deleted}");
        println!("Mean batch time:   {mean_seconds:.2}s");
    }
}

fn print_result_text(result: &BatchResult) {
    println!(
        "Batch {}: {} responses in {:.2}s",
        result.batch_id, result.total_responses, result.processing_time_seconds
    );
    println!(
        "  themes: +{} created, {} updated, {} deleted",
        result.themes_created, result.themes_updated, result.themes_deleted
    );
    for entry in &result.evolution {
        let name = entry.details.theme_name.as_deref().unwrap_or("");
        println!("  {} theme {} {}", entry.action, entry.theme_id, name);
    }
}

fn print_outcomes_json(outcomes: &[BatchOutcome]) -> Result<()> {
    let rendered: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|outcome| match &outcome.result {
            Ok(result) => serde_json::to_value(result).unwrap_or_default(),
            Err(error) => serde_json::json!({
                "batch_id": outcome.batch_id,
                "error": error.to_string(),
            }),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
