//! LLM-driven theme extraction
//!
//! Proposes candidate themes for a batch of responses and refreshes theme
//! descriptions when new evidence accumulates. Model output is strict
//! JSON; one reformat retry is attempted before the extractor gives up
//! and reports an empty candidate list.

use crate::cancel::CancelToken;
use crate::embedding::Embedder;
use crate::error::{EngineError, Result};
use crate::llm::{
    cluster_naming_prompt, extraction_prompt, format_responses, reformat_retry_prompt,
    refresh_description_prompt, GenerateOptions, GenerationClient,
};
use crate::models::{Theme, ThemeOrigin, ThemeStatus};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Maximum length of a theme name accepted from the model
const NAME_MAX_CHARS: usize = 60;

/// Maximum candidates kept from a single extraction
const MAX_CANDIDATES: usize = 10;

/// Theme extractor backed by the generation client
pub struct ThemeExtractor {
    client: Arc<dyn GenerationClient>,
    embedder: Arc<Embedder>,
    model_label: String,
    prompt_char_limit: usize,
    cancel: CancelToken,
}

#[derive(Debug, Deserialize)]
struct RawTheme {
    name: String,
    description: String,
}

impl ThemeExtractor {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        embedder: Arc<Embedder>,
        model_label: &str,
        prompt_char_limit: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            client,
            embedder,
            model_label: model_label.to_string(),
            prompt_char_limit,
            cancel,
        }
    }

    /// Propose candidate themes for a batch
    ///
    /// Responses that exceed the prompt budget are stride-sampled in
    /// insertion order so every batch yields some candidates. A second
    /// parse failure is recovered as an empty list, never a batch error.
    pub async fn extract(
        &self,
        question: &str,
        responses: &[&str],
        batch_id: i64,
    ) -> Result<Vec<Theme>> {
        self.cancel.ensure_active()?;
        let nonempty: Vec<&str> = responses
            .iter()
            .copied()
            .filter(|r| !r.trim().is_empty())
            .collect();
        if nonempty.is_empty() {
            return Ok(Vec::new());
        }

        let packed = pack_responses(&nonempty, self.prompt_char_limit);
        let formatted = format_responses(&packed);
        tracing::debug!(
            batch_id,
            total = nonempty.len(),
            packed = packed.len(),
            "extracting themes"
        );

        let prompt = extraction_prompt(question, &formatted);
        let output = self
            .client
            .generate(&prompt, GenerateOptions::extraction())
            .await?;

        let raw = match parse_theme_json(&output) {
            Ok(items) => items,
            Err(first_error) => {
                tracing::warn!(batch_id, error = %first_error, "extractor parse failed, retrying");
                let retry_prompt = reformat_retry_prompt(question, &formatted);
                let retry_output = self
                    .client
                    .generate(&retry_prompt, GenerateOptions::extraction())
                    .await?;
                match parse_theme_json(&retry_output) {
                    Ok(items) => items,
                    Err(second_error) => {
                        tracing::warn!(
                            batch_id,
                            error = %EngineError::ExtractorParseFailed(second_error),
                            "extractor parse failed twice, yielding no candidates"
                        );
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let validated = validate_candidates(raw);
        if validated.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = validated
            .iter()
            .map(|(name, description)| Theme::embedding_text(name, description))
            .collect();
        let embeddings = self.embedder.embed_many(&texts).await?;

        Ok(validated
            .into_iter()
            .zip(embeddings)
            .map(|((name, description), embedding)| Theme {
                id: None,
                name,
                description,
                embedding,
                status: ThemeStatus::Active,
                created_at_batch: batch_id,
                last_updated_batch: batch_id,
                parent_theme_id: None,
                response_count: 0,
                metadata: ThemeOrigin::Extracted {
                    model: self.model_label.clone(),
                    batch_id,
                },
            })
            .collect())
    }

    /// Produce a revised one-sentence description for a theme
    ///
    /// Falls back to the existing description when the model returns
    /// nothing usable.
    pub async fn refresh_description(
        &self,
        theme: &Theme,
        new_responses: &[&str],
    ) -> Result<String> {
        self.cancel.ensure_active()?;
        let formatted = format_responses(new_responses);
        let prompt = refresh_description_prompt(&theme.name, &theme.description, &formatted);
        let output = self
            .client
            .generate(&prompt, GenerateOptions::refresh())
            .await?;

        let revised = output
            .trim()
            .trim_matches(&['"', '\''][..])
            .trim()
            .to_string();
        if revised.is_empty() {
            tracing::warn!(theme = %theme.name, "empty refreshed description, keeping original");
            Ok(theme.description.clone())
        } else {
            Ok(revised)
        }
    }

    /// Name one child cluster promoted out of a split
    ///
    /// On persistent parse failure the child falls back to a name derived
    /// from the parent, so a split never aborts on naming alone.
    pub async fn name_cluster(
        &self,
        parent: &Theme,
        member_responses: &[&str],
        cluster_index: usize,
    ) -> Result<(String, String)> {
        self.cancel.ensure_active()?;
        let formatted = format_responses(member_responses);
        let prompt = cluster_naming_prompt(&parent.name, &formatted);
        let output = self
            .client
            .generate(&prompt, GenerateOptions::extraction())
            .await?;

        let fallback = || {
            (
                truncate_name(&format!("{} (group {})", parent.name, cluster_index + 1)),
                parent.description.clone(),
            )
        };

        match parse_theme_json(&output) {
            Ok(items) => {
                let named = validate_candidates(items).into_iter().next();
                Ok(named.unwrap_or_else(fallback))
            }
            Err(error) => {
                tracing::warn!(parent = %parent.name, %error, "cluster naming parse failed");
                Ok(fallback())
            }
        }
    }
}

/// Deterministically sub-sample responses to fit the prompt budget
///
/// Tries increasing strides until the formatted block fits; order is
/// preserved. A single oversized response is truncated rather than
/// dropped.
fn pack_responses<'a>(responses: &[&'a str], char_limit: usize) -> Vec<&'a str> {
    for stride in 1..=responses.len() {
        let selected: Vec<&str> = responses.iter().copied().step_by(stride).collect();
        let length: usize = selected
            .iter()
            .map(|r| r.len() + "Response 999: \n".len())
            .sum();
        if length <= char_limit {
            return selected;
        }
    }
    // Even one response is over budget: keep a truncated prefix of the first
    let first = responses[0];
    let cut = first
        .char_indices()
        .take_while(|(i, _)| *i < char_limit)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    vec![&first[..cut]]
}

/// Extract and parse the JSON array from raw model output
fn parse_theme_json(output: &str) -> std::result::Result<Vec<RawTheme>, String> {
    let start = output
        .find('[')
        .ok_or_else(|| "no JSON array found in output".to_string())?;
    let end = output
        .rfind(']')
        .ok_or_else(|| "no complete JSON array found in output".to_string())?;
    if end < start {
        return Err("malformed JSON array bounds".to_string());
    }

    serde_json::from_str::<Vec<RawTheme>>(&output[start..=end])
        .map_err(|e| format!("invalid JSON array: {e}"))
}

/// Trim, enforce the name budget, and dedupe by case-folded name
fn validate_candidates(raw: Vec<RawTheme>) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let name = item.name.trim().to_string();
        let description = item.description.trim().to_string();
        if name.is_empty() || description.is_empty() {
            continue;
        }
        if name.chars().count() > NAME_MAX_CHARS {
            continue;
        }
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        out.push((name, description));
        if out.len() == MAX_CANDIDATES {
            break;
        }
    }
    out
}

fn truncate_name(name: &str) -> String {
    name.chars().take(NAME_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedding;
    use crate::llm::MockGeneration;
    use crate::storage::Store;
    use std::time::Duration;

    fn extractor_with(client: Arc<MockGeneration>) -> ThemeExtractor {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let embedder = Arc::new(Embedder::new(
            Arc::new(MockEmbedding::new(16)),
            store,
            4,
            Duration::from_secs(5),
            CancelToken::new(),
        ));
        ThemeExtractor::new(client, embedder, "mock-gen", 12_000, CancelToken::new())
    }

    #[test]
    fn parse_tolerates_prose_and_fences() {
        let output = r#"Here are the themes:
```json
[{"name": "API Challenges", "description": "Problems with APIs"}]
```
Hope that helps!"#;
        let parsed = parse_theme_json(output).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "API Challenges");
    }

    #[test]
    fn parse_rejects_missing_array() {
        assert!(parse_theme_json("no json here").is_err());
        assert!(parse_theme_json("{\"name\": \"x\"}").is_err());
    }

    #[test]
    fn validation_dedupes_and_enforces_budget() {
        let raw = vec![
            RawTheme {
                name: " API Challenges ".to_string(),
                description: " Problems ".to_string(),
            },
            RawTheme {
                name: "api challenges".to_string(),
                description: "duplicate by case-folded name".to_string(),
            },
            RawTheme {
                name: "x".repeat(61),
                description: "name too long".to_string(),
            },
            RawTheme {
                name: "Empty".to_string(),
                description: "  ".to_string(),
            },
        ];
        let validated = validate_candidates(raw);
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].0, "API Challenges");
        assert_eq!(validated[0].1, "Problems");
    }

    #[test]
    fn packing_is_deterministic_and_ordered() {
        let responses: Vec<String> = (0..20).map(|i| format!("response number {i:02}")).collect();
        let refs: Vec<&str> = responses.iter().map(|s| s.as_str()).collect();

        let all = pack_responses(&refs, 10_000);
        assert_eq!(all.len(), 20);

        let sampled = pack_responses(&refs, 200);
        assert!(sampled.len() < 20);
        assert_eq!(sampled, pack_responses(&refs, 200));
        // Insertion order preserved
        let positions: Vec<usize> = sampled
            .iter()
            .map(|s| refs.iter().position(|r| r == s).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn extract_builds_embedded_themes() {
        let client = MockGeneration::new()
            .with_default(r#"[{"name": "API Challenges", "description": "Problems with APIs"}]"#)
            .shared();
        let extractor = extractor_with(Arc::clone(&client));

        let themes = extractor
            .extract("What challenges?", &["API integration is hard"], 1)
            .await
            .unwrap();
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].name, "API Challenges");
        assert_eq!(themes[0].status, ThemeStatus::Active);
        assert_eq!(themes[0].created_at_batch, 1);
        assert!(!themes[0].embedding.is_empty());
    }

    #[tokio::test]
    async fn parse_failure_retries_then_recovers_empty() {
        // First call yields junk; the stricter retry prompt gets valid JSON
        let client = MockGeneration::new()
            .add_response(
                "IMPORTANT",
                r#"[{"name": "Recovered", "description": "after retry"}]"#,
            )
            .with_default("total junk, no json")
            .shared();
        let extractor = extractor_with(Arc::clone(&client));
        let themes = extractor.extract("q", &["a response"], 1).await.unwrap();
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].name, "Recovered");
        assert_eq!(client.call_count(), 2);

        // Junk both times: empty list, not an error
        let stubborn = MockGeneration::new().with_default("junk").shared();
        let extractor = extractor_with(Arc::clone(&stubborn));
        let themes = extractor.extract("q", &["a response"], 1).await.unwrap();
        assert!(themes.is_empty());
        assert_eq!(stubborn.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_batch_never_reaches_the_model() {
        let client = MockGeneration::new().shared();
        let extractor = extractor_with(Arc::clone(&client));
        let themes = extractor.extract("q", &["", "   "], 1).await.unwrap();
        assert!(themes.is_empty());
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn cluster_naming_falls_back_to_parent() {
        let client = MockGeneration::new().with_default("not json").shared();
        let extractor = extractor_with(client);
        let parent = Theme {
            id: Some(1),
            name: "Remote Work".to_string(),
            description: "Challenges of remote work".to_string(),
            embedding: vec![1.0],
            status: ThemeStatus::Active,
            created_at_batch: 1,
            last_updated_batch: 1,
            parent_theme_id: None,
            response_count: 4,
            metadata: ThemeOrigin::Seeded,
        };
        let (name, description) = extractor
            .name_cluster(&parent, &["one", "two"], 1)
            .await
            .unwrap();
        assert_eq!(name, "Remote Work (group 2)");
        assert_eq!(description, parent.description);
    }
}
