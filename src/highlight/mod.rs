//! Similarity-based keyword highlighting
//!
//! For a response/theme pair, finds the phrases whose embeddings best
//! explain the match. A phrase scores by its marginal contribution: how
//! much more similar it is to the theme than the whole response is. That
//! keeps highlights that explain the assignment rather than phrases that
//! merely resemble the theme in isolation.

mod stopwords;

pub use stopwords::is_stopword;

use crate::config::NgramConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::HighlightedKeyword;
use crate::vectors::cosine_similarity;
use std::collections::HashSet;
use std::sync::Arc;

/// Keyword highlighter for response/theme pairs
pub struct KeywordHighlighter {
    embedder: Arc<Embedder>,
    ngrams: NgramConfig,
    min_contribution: f32,
    max_keywords: usize,
}

impl KeywordHighlighter {
    pub fn new(
        embedder: Arc<Embedder>,
        ngrams: NgramConfig,
        min_contribution: f32,
        max_keywords: usize,
    ) -> Self {
        Self {
            embedder,
            ngrams,
            min_contribution,
            max_keywords,
        }
    }

    /// Highlight the phrases that explain a response/theme similarity
    ///
    /// Deterministic for fixed embeddings: candidates are enumerated in
    /// first-occurrence order and ties break by longer phrase, then
    /// earliest position, then lexicographically.
    pub async fn highlight(
        &self,
        response_text: &str,
        theme_embedding: &[f32],
    ) -> Result<Vec<HighlightedKeyword>> {
        if response_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let phrases = self.extract_phrases(response_text);
        if phrases.is_empty() {
            return Ok(Vec::new());
        }

        // The response vector is a cache hit when the batch already embedded it
        let response_embedding = self.embedder.embed(response_text).await?;
        let base_similarity = cosine_similarity(theme_embedding, &response_embedding);

        let phrase_embeddings = self.embedder.embed_many(&phrases).await?;

        let mut keywords: Vec<HighlightedKeyword> = phrases
            .iter()
            .zip(phrase_embeddings.iter())
            .filter_map(|(phrase, embedding)| {
                let score = cosine_similarity(theme_embedding, embedding) - base_similarity;
                if score >= self.min_contribution {
                    let positions = find_phrase_positions(response_text, phrase);
                    Some(HighlightedKeyword {
                        keyword: phrase.clone(),
                        score,
                        positions,
                    })
                } else {
                    None
                }
            })
            .collect();

        keywords.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_len = a.keyword.split(' ').count();
                    let b_len = b.keyword.split(' ').count();
                    b_len.cmp(&a_len)
                })
                .then_with(|| {
                    a.positions
                        .first()
                        .copied()
                        .unwrap_or(usize::MAX)
                        .cmp(&b.positions.first().copied().unwrap_or(usize::MAX))
                })
                .then_with(|| a.keyword.cmp(&b.keyword))
        });
        keywords.truncate(self.max_keywords);
        Ok(keywords)
    }

    /// Enumerate candidate phrases: unigrams, bigrams, and trigrams after
    /// lowercasing and stopword-aware filtering, deduplicated preserving
    /// the earliest occurrence
    fn extract_phrases(&self, text: &str) -> Vec<String> {
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();

        let mut phrases = Vec::new();

        if self.ngrams.unigrams {
            phrases.extend(
                words
                    .iter()
                    .filter(|w| !is_stopword(w) && w.chars().count() >= self.ngrams.min_word_length)
                    .cloned(),
            );
        }

        if self.ngrams.bigrams {
            for pair in words.windows(2) {
                if is_stopword(&pair[0]) && is_stopword(&pair[1]) {
                    continue;
                }
                phrases.push(format!("{} {}", pair[0], pair[1]));
            }
        }

        if self.ngrams.trigrams {
            for triple in words.windows(3) {
                let stopword_count = triple.iter().filter(|w| is_stopword(w)).count();
                if stopword_count > self.ngrams.max_stopwords_in_phrase {
                    continue;
                }
                phrases.push(format!("{} {} {}", triple[0], triple[1], triple[2]));
            }
        }

        let mut seen = HashSet::new();
        phrases.retain(|p| seen.insert(p.clone()));
        phrases
    }
}

/// Character offsets of every case-insensitive occurrence of a phrase
fn find_phrase_positions(text: &str, phrase: &str) -> Vec<usize> {
    let haystack: Vec<char> = text.to_lowercase().chars().collect();
    let needle: Vec<char> = phrase.chars().collect();
    if needle.is_empty() || haystack.len() < needle.len() {
        return Vec::new();
    }

    let mut positions = Vec::new();
    for start in 0..=(haystack.len() - needle.len()) {
        if haystack[start..start + needle.len()] == needle[..] {
            positions.push(start);
        }
    }
    positions
}
