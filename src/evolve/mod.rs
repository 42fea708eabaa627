//! Theme evolution: matching, dedup, merges, splits, refreshes
//!
//! The five passes run in a fixed order within a batch — match, dedupe,
//! merge, split, refresh — so merges always see the post-dedup catalog
//! and splits always see post-merge assignments. A theme changes state at
//! most once per batch; the per-batch bookkeeping enforces that.

use crate::cancel::CancelToken;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::extract::ThemeExtractor;
use crate::models::{
    EvolutionAction, EvolutionDetails, EvolutionEntry, SurveyResponse, Theme, ThemeOrigin,
    ThemeStatus,
};
use crate::storage::Store;
use crate::vectors::{cluster_variance, cosine_similarity, kmeans, weighted_average};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Candidate themes considered per response during matching
const MATCH_CANDIDATES: usize = 3;

/// Minimum new or near responses before a description refresh is attempted
const REFRESH_MIN_RESPONSES: usize = 3;

/// An assignment planned during matching, persisted after highlighting
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAssignment {
    pub response_id: i64,
    pub theme_id: i64,
    pub confidence: f32,
}

/// Per-batch bookkeeping shared across the evolver passes
#[derive(Debug, Default)]
pub struct BatchEvolution {
    /// Themes that already changed state this batch; at most one
    /// transition per theme per batch
    transitioned: HashSet<i64>,
    /// Theme -> responses (new and near matches) feeding description refresh
    refresh_pool: HashMap<i64, Vec<i64>>,
}

impl BatchEvolution {
    pub fn new() -> Self {
        Self::default()
    }

    fn note_response(&mut self, theme_id: i64, response_id: i64) {
        let pool = self.refresh_pool.entry(theme_id).or_default();
        if !pool.contains(&response_id) {
            pool.push(response_id);
        }
    }

    fn mark_transitioned(&mut self, theme_id: i64) {
        self.transitioned.insert(theme_id);
    }

    fn has_transitioned(&self, theme_id: i64) -> bool {
        self.transitioned.contains(&theme_id)
    }

    /// Merge the refresh pool of an absorbed theme into its survivor
    fn move_pool(&mut self, from: i64, to: i64) {
        if let Some(moved) = self.refresh_pool.remove(&from) {
            for response_id in moved {
                self.note_response(to, response_id);
            }
        }
    }
}

/// Configuration slice the evolver needs
#[derive(Debug, Clone)]
pub struct EvolverThresholds {
    pub similarity_match: f32,
    pub similarity_update: f32,
    pub similarity_merge: f32,
    pub split_variance: f32,
    pub drift_update: f32,
    pub min_responses_per_theme: usize,
    pub refresh_sample_size: usize,
}

impl From<&crate::config::EngineConfig> for EvolverThresholds {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            similarity_match: config.thresholds.similarity_match,
            similarity_update: config.thresholds.similarity_update,
            similarity_merge: config.thresholds.similarity_merge,
            split_variance: config.thresholds.split_variance,
            drift_update: config.thresholds.drift_update,
            min_responses_per_theme: config.thresholds.min_responses_per_theme,
            refresh_sample_size: config.processing.refresh_sample_size,
        }
    }
}

/// Drives all mutation of the living theme catalog
pub struct ThemeEvolver {
    store: Arc<Store>,
    extractor: Arc<ThemeExtractor>,
    embedder: Arc<Embedder>,
    thresholds: EvolverThresholds,
    cancel: CancelToken,
}

impl ThemeEvolver {
    pub fn new(
        store: Arc<Store>,
        extractor: Arc<ThemeExtractor>,
        embedder: Arc<Embedder>,
        thresholds: EvolverThresholds,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            thresholds,
            cancel,
        }
    }

    /// Pass (a): match responses against the live catalog
    ///
    /// A response is assigned to every candidate at or above the match
    /// threshold (multi-label, up to three). Candidates in the near band
    /// feed the refresh pool instead.
    pub fn match_to_existing(
        &self,
        responses: &[SurveyResponse],
        state: &mut BatchEvolution,
    ) -> Result<Vec<PendingAssignment>> {
        let mut pending = Vec::new();
        for response in responses {
            let Some(response_id) = response.id else {
                continue;
            };
            let candidates = self.store.find_similar_themes(
                &response.embedding,
                self.thresholds.similarity_update,
                MATCH_CANDIDATES,
            )?;

            for (theme, similarity) in candidates {
                let theme_id = theme.id.expect("stored theme has id");
                if similarity >= self.thresholds.similarity_match {
                    pending.push(PendingAssignment {
                        response_id,
                        theme_id,
                        confidence: similarity.clamp(0.0, 1.0),
                    });
                    state.note_response(theme_id, response_id);
                    tracing::debug!(response_id, theme = %theme.name, similarity, "matched");
                } else {
                    // Near candidate: evidence for refresh, not an assignment
                    state.note_response(theme_id, response_id);
                }
            }
        }
        Ok(pending)
    }

    /// Pass (b): fold freshly extracted candidates into the catalog
    ///
    /// A candidate close to an existing theme is dropped and its intended
    /// responses routed there; anything novel becomes a new active theme.
    /// Returns planned assignments plus the number of themes created.
    pub fn dedupe_candidates(
        &self,
        candidates: Vec<Theme>,
        responses: &[SurveyResponse],
        batch_id: i64,
        state: &mut BatchEvolution,
    ) -> Result<(Vec<PendingAssignment>, usize)> {
        let mut pending = Vec::new();
        let mut created = 0usize;

        for candidate in candidates {
            self.cancel.ensure_active()?;
            let intended: Vec<(&SurveyResponse, f32)> = responses
                .iter()
                .filter_map(|r| {
                    let sim = cosine_similarity(&r.embedding, &candidate.embedding);
                    (sim >= self.thresholds.similarity_match).then_some((r, sim))
                })
                .collect();

            let best_existing = self
                .store
                .find_similar_themes(&candidate.embedding, self.thresholds.similarity_merge, 1)?
                .into_iter()
                .next();

            match best_existing {
                Some((existing, similarity)) => {
                    let existing_id = existing.id.expect("stored theme has id");
                    tracing::info!(
                        candidate = %candidate.name,
                        existing = %existing.name,
                        similarity,
                        "dropping duplicate candidate"
                    );
                    let mut affected = 0i64;
                    for (response, _) in &intended {
                        let response_id = response.id.expect("persisted response has id");
                        let confidence =
                            cosine_similarity(&response.embedding, &existing.embedding);
                        pending.push(PendingAssignment {
                            response_id,
                            theme_id: existing_id,
                            confidence: confidence.clamp(0.0, 1.0),
                        });
                        state.note_response(existing_id, response_id);
                        affected += 1;
                    }
                    if affected > 0 {
                        self.store.append_evolution(&EvolutionEntry {
                            id: None,
                            batch_id,
                            action: EvolutionAction::Reassigned,
                            theme_id: existing_id,
                            related_theme_id: None,
                            affected_response_count: affected,
                            details: EvolutionDetails {
                                theme_name: Some(candidate.name.clone()),
                                similarity: Some(similarity),
                                reason: Some("duplicate candidate absorbed".to_string()),
                                ..Default::default()
                            },
                        })?;
                    }
                }
                None => {
                    let theme_id = self.store.put_theme(&candidate)?;
                    created += 1;
                    tracing::info!(theme = %candidate.name, theme_id, "created theme");
                    self.store.append_evolution(&EvolutionEntry {
                        id: None,
                        batch_id,
                        action: EvolutionAction::Created,
                        theme_id,
                        related_theme_id: None,
                        affected_response_count: intended.len() as i64,
                        details: EvolutionDetails {
                            theme_name: Some(candidate.name.clone()),
                            new_description: Some(candidate.description.clone()),
                            ..Default::default()
                        },
                    })?;
                    for (response, similarity) in &intended {
                        let response_id = response.id.expect("persisted response has id");
                        pending.push(PendingAssignment {
                            response_id,
                            theme_id,
                            confidence: similarity.clamp(0.0, 1.0),
                        });
                        state.note_response(theme_id, response_id);
                    }
                }
            }
        }
        Ok((pending, created))
    }

    /// Pass (c): merge overlapping active themes
    ///
    /// Pairwise comparison over the whole catalog; the theme carrying more
    /// responses survives (ties break to the lower id). Returns the number
    /// of merges executed.
    pub async fn detect_merges(&self, batch_id: i64, state: &mut BatchEvolution) -> Result<usize> {
        let themes = self.store.themes_by_status(ThemeStatus::Active)?;
        let mut pairs: Vec<(i64, i64, f32)> = Vec::new();
        for (i, a) in themes.iter().enumerate() {
            for b in themes.iter().skip(i + 1) {
                let similarity = cosine_similarity(&a.embedding, &b.embedding);
                if similarity >= self.thresholds.similarity_merge {
                    pairs.push((a.id.unwrap(), b.id.unwrap(), similarity));
                }
            }
        }
        pairs.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged = 0usize;
        for (a, b, similarity) in pairs {
            if state.has_transitioned(a) || state.has_transitioned(b) {
                continue;
            }
            self.cancel.ensure_active()?;
            self.merge_pair(a, b, similarity, batch_id, state).await?;
            merged += 1;
        }
        Ok(merged)
    }

    async fn merge_pair(
        &self,
        a: i64,
        b: i64,
        similarity: f32,
        batch_id: i64,
        state: &mut BatchEvolution,
    ) -> Result<()> {
        let theme_a = self.store.get_theme(a)?.expect("theme exists");
        let theme_b = self.store.get_theme(b)?.expect("theme exists");

        // Survivor carries more responses; ties break to the lower id
        let (survivor, loser) = if theme_a.response_count > theme_b.response_count
            || (theme_a.response_count == theme_b.response_count && a < b)
        {
            (theme_a, theme_b)
        } else {
            (theme_b, theme_a)
        };
        let survivor_id = survivor.id.unwrap();
        let loser_id = loser.id.unwrap();
        tracing::info!(
            survivor = %survivor.name,
            loser = %loser.name,
            similarity,
            "merging themes"
        );

        let merged_embedding = weighted_average(
            &survivor.embedding,
            survivor.response_count.max(1) as f32,
            &loser.embedding,
            loser.response_count.max(1) as f32,
        );

        // Refresh the survivor's description against the absorbed members
        let sample = self.member_texts(loser_id, self.thresholds.refresh_sample_size)?;
        let description = if sample.is_empty() {
            survivor.description.clone()
        } else {
            let refs: Vec<&str> = sample.iter().map(|s| s.as_str()).collect();
            self.extractor.refresh_description(&survivor, &refs).await?
        };

        let mut retired = loser.clone();
        retired.status = ThemeStatus::Merged;
        retired.parent_theme_id = Some(survivor_id);
        retired.last_updated_batch = batch_id;
        self.store.update_theme(&retired)?;

        let affected = self
            .store
            .rewrite_assignments(loser_id, survivor_id, batch_id)?;

        // Re-read for the post-rewrite response count
        let mut updated = self.store.get_theme(survivor_id)?.expect("survivor exists");
        updated.embedding = merged_embedding;
        updated.description = description;
        updated.last_updated_batch = batch_id;
        updated.metadata = ThemeOrigin::MergeSurvivor {
            absorbed_id: loser_id,
        };
        self.store.update_theme(&updated)?;

        self.store.append_evolution(&EvolutionEntry {
            id: None,
            batch_id,
            action: EvolutionAction::Merged,
            theme_id: survivor_id,
            related_theme_id: Some(loser_id),
            affected_response_count: affected as i64,
            details: EvolutionDetails {
                theme_name: Some(loser.name.clone()),
                similarity: Some(similarity),
                ..Default::default()
            },
        })?;

        state.mark_transitioned(loser_id);
        state.mark_transitioned(survivor_id);
        state.move_pool(loser_id, survivor_id);
        Ok(())
    }

    /// Pass (d): split themes whose members have drifted apart
    ///
    /// A theme with enough assignments and high intra-cluster variance is
    /// divided by 2-means; both children must keep the minimum member
    /// count or the split is abandoned. Returns the number of splits.
    pub async fn detect_splits(&self, batch_id: i64, state: &mut BatchEvolution) -> Result<usize> {
        let themes = self.store.themes_by_status(ThemeStatus::Active)?;
        let mut splits = 0usize;

        for theme in themes {
            let theme_id = theme.id.unwrap();
            if state.has_transitioned(theme_id) {
                continue;
            }
            let assignments = self.store.assignments_by_theme(theme_id)?;
            if assignments.len() < self.thresholds.min_responses_per_theme * 2 {
                continue;
            }
            self.cancel.ensure_active()?;

            // Collect member embeddings in a stable order
            let mut members: Vec<(i64, SurveyResponse)> = Vec::new();
            for assignment in &assignments {
                if let Some(response) = self.store.get_response(assignment.response_id)? {
                    if !crate::vectors::is_zero(&response.embedding) {
                        members.push((assignment.response_id, response));
                    }
                }
            }
            members.sort_by_key(|(id, _)| *id);
            if members.len() < self.thresholds.min_responses_per_theme * 2 {
                continue;
            }

            let vectors: Vec<&[f32]> = members
                .iter()
                .map(|(_, r)| r.embedding.as_slice())
                .collect();
            let variance = cluster_variance(&vectors);
            if variance <= self.thresholds.split_variance {
                tracing::debug!(theme = %theme.name, variance, "split rejected");
                continue;
            }

            let (labels, _) = kmeans(&vectors, 2, 20);
            let cluster_sizes = [
                labels.iter().filter(|&&l| l == 0).count(),
                labels.iter().filter(|&&l| l == 1).count(),
            ];
            if cluster_sizes
                .iter()
                .any(|&size| size < self.thresholds.min_responses_per_theme)
            {
                tracing::debug!(theme = %theme.name, ?cluster_sizes, "split abandoned");
                continue;
            }
            tracing::info!(theme = %theme.name, variance, ?cluster_sizes, "splitting theme");

            let mut child_ids = Vec::with_capacity(2);
            for cluster in 0..2 {
                let member_vectors: Vec<&[f32]> = members
                    .iter()
                    .zip(&labels)
                    .filter(|(_, l)| **l == cluster)
                    .map(|((_, r), _)| r.embedding.as_slice())
                    .collect();
                let member_texts: Vec<&str> = members
                    .iter()
                    .zip(&labels)
                    .filter(|(_, l)| **l == cluster)
                    .map(|((_, r), _)| r.text.as_str())
                    .take(self.thresholds.refresh_sample_size)
                    .collect();

                let (name, description) = self
                    .extractor
                    .name_cluster(&theme, &member_texts, cluster)
                    .await?;

                let child = Theme {
                    id: None,
                    name,
                    description,
                    embedding: crate::vectors::centroid(&member_vectors),
                    status: ThemeStatus::Active,
                    created_at_batch: batch_id,
                    last_updated_batch: batch_id,
                    parent_theme_id: Some(theme_id),
                    response_count: 0,
                    metadata: ThemeOrigin::SplitChild {
                        parent_id: theme_id,
                        cluster,
                    },
                };
                child_ids.push(self.store.put_theme(&child)?);
            }

            let routing: Vec<(i64, i64)> = members
                .iter()
                .zip(&labels)
                .map(|((response_id, _), &label)| (*response_id, child_ids[label]))
                .collect();
            let moved = self.store.reassign_to_children(theme_id, &routing, batch_id)?;

            let mut parent = self.store.get_theme(theme_id)?.expect("parent exists");
            parent.status = ThemeStatus::Split;
            parent.last_updated_batch = batch_id;
            self.store.update_theme(&parent)?;

            self.store.append_evolution(&EvolutionEntry {
                id: None,
                batch_id,
                action: EvolutionAction::Split,
                theme_id,
                related_theme_id: child_ids.first().copied(),
                affected_response_count: moved as i64,
                details: EvolutionDetails {
                    theme_name: Some(theme.name.clone()),
                    child_theme_ids: child_ids.clone(),
                    drift_score: Some(variance),
                    ..Default::default()
                },
            })?;

            state.mark_transitioned(theme_id);
            for child in child_ids {
                state.mark_transitioned(child);
            }
            splits += 1;
        }
        Ok(splits)
    }

    /// Pass (e): refresh descriptions of themes with enough new evidence
    ///
    /// The revised description is adopted only when it moves the theme
    /// embedding further than the drift threshold. Returns the number of
    /// themes updated.
    pub async fn refresh_descriptions(
        &self,
        batch_id: i64,
        state: &mut BatchEvolution,
    ) -> Result<usize> {
        let mut theme_ids: Vec<i64> = state.refresh_pool.keys().copied().collect();
        theme_ids.sort_unstable();

        let mut updated = 0usize;
        for theme_id in theme_ids {
            if state.has_transitioned(theme_id) {
                continue;
            }
            let pool = state.refresh_pool.get(&theme_id).cloned().unwrap_or_default();
            if pool.len() < REFRESH_MIN_RESPONSES {
                continue;
            }
            let Some(theme) = self.store.get_theme(theme_id)? else {
                continue;
            };
            if theme.status != ThemeStatus::Active {
                continue;
            }
            self.cancel.ensure_active()?;

            let mut texts = Vec::new();
            for response_id in pool.iter().take(self.thresholds.refresh_sample_size) {
                if let Some(response) = self.store.get_response(*response_id)? {
                    if !response.text.trim().is_empty() {
                        texts.push(response.text);
                    }
                }
            }
            if texts.is_empty() {
                continue;
            }

            let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
            let description = self.extractor.refresh_description(&theme, &refs).await?;
            let new_embedding = self
                .embedder
                .embed(&Theme::embedding_text(&theme.name, &description))
                .await?;

            let shift = 1.0 - cosine_similarity(&theme.embedding, &new_embedding);
            if shift <= self.thresholds.drift_update {
                tracing::debug!(theme = %theme.name, shift, "refresh below drift threshold");
                continue;
            }
            tracing::info!(theme = %theme.name, shift, "refreshing description");

            let mut revised = theme.clone();
            revised.description = description.clone();
            revised.embedding = new_embedding;
            revised.last_updated_batch = batch_id;
            self.store.update_theme(&revised)?;

            self.store.append_evolution(&EvolutionEntry {
                id: None,
                batch_id,
                action: EvolutionAction::Updated,
                theme_id,
                related_theme_id: None,
                affected_response_count: pool.len() as i64,
                details: EvolutionDetails {
                    theme_name: Some(theme.name.clone()),
                    old_description: Some(theme.description.clone()),
                    new_description: Some(description),
                    embedding_shift: Some(shift),
                    ..Default::default()
                },
            })?;

            state.mark_transitioned(theme_id);
            updated += 1;
        }
        Ok(updated)
    }

    /// Retire pre-existing active themes whose live assignments dropped to
    /// zero during this batch's rewrites
    pub fn retire_empty(&self, batch_id: i64, state: &mut BatchEvolution) -> Result<usize> {
        let mut retired = 0usize;
        for theme in self.store.themes_by_status(ThemeStatus::Active)? {
            let theme_id = theme.id.unwrap();
            if theme.response_count == 0
                && theme.created_at_batch < batch_id
                && !state.has_transitioned(theme_id)
            {
                self.store
                    .soft_retire_theme(theme_id, "no live assignments", batch_id)?;
                state.mark_transitioned(theme_id);
                retired += 1;
            }
        }
        Ok(retired)
    }

    fn member_texts(&self, theme_id: i64, limit: usize) -> Result<Vec<String>> {
        let mut texts = Vec::new();
        for assignment in self.store.assignments_by_theme(theme_id)?.iter().take(limit) {
            if let Some(response) = self.store.get_response(assignment.response_id)? {
                if !response.text.trim().is_empty() {
                    texts.push(response.text);
                }
            }
        }
        Ok(texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedding;
    use crate::llm::MockGeneration;
    use crate::vectors::l2_normalize;
    use std::time::Duration;

    fn unit(raw: &[f32]) -> Vec<f32> {
        let mut v = raw.to_vec();
        l2_normalize(&mut v);
        v
    }

    struct Fixture {
        store: Arc<Store>,
        evolver: ThemeEvolver,
    }

    fn fixture(generation: Arc<MockGeneration>) -> Fixture {
        fixture_with_embedding(generation, MockEmbedding::new(16))
    }

    fn fixture_with_embedding(generation: Arc<MockGeneration>, provider: MockEmbedding) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let embedder = Arc::new(Embedder::new(
            Arc::new(provider),
            Arc::clone(&store),
            4,
            Duration::from_secs(5),
            CancelToken::new(),
        ));
        let extractor = Arc::new(ThemeExtractor::new(
            generation,
            Arc::clone(&embedder),
            "mock-gen",
            12_000,
            CancelToken::new(),
        ));
        let thresholds = EvolverThresholds {
            similarity_match: 0.75,
            similarity_update: 0.50,
            similarity_merge: 0.85,
            split_variance: 0.40,
            drift_update: 0.20,
            min_responses_per_theme: 2,
            refresh_sample_size: 20,
        };
        let evolver = ThemeEvolver::new(
            Arc::clone(&store),
            extractor,
            embedder,
            thresholds,
            CancelToken::new(),
        );
        Fixture { store, evolver }
    }

    fn seed_theme(store: &Store, name: &str, embedding: Vec<f32>, batch: i64) -> i64 {
        store
            .put_theme(&Theme {
                id: None,
                name: name.to_string(),
                description: format!("{name} description"),
                embedding,
                status: ThemeStatus::Active,
                created_at_batch: batch,
                last_updated_batch: batch,
                parent_theme_id: None,
                response_count: 0,
                metadata: ThemeOrigin::Seeded,
            })
            .unwrap()
    }

    fn seed_response(store: &Store, text: &str, embedding: Vec<f32>, batch: i64) -> SurveyResponse {
        let mut response = SurveyResponse {
            id: None,
            batch_id: batch,
            question: "q".to_string(),
            text: text.to_string(),
            embedding,
        };
        response.id = Some(store.put_response(&response).unwrap());
        response
    }

    #[test]
    fn matching_is_multi_label_with_near_band() {
        let f = fixture(MockGeneration::new().shared());
        let a = seed_theme(&f.store, "A", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        let b = seed_theme(&f.store, "B", unit(&[0.9, 0.4, 0.0, 0.0]), 1);
        let c = seed_theme(&f.store, "C", unit(&[0.0, 0.0, 1.0, 0.0]), 1);

        // Close to both A and B, orthogonal to C
        let response = seed_response(&f.store, "text", unit(&[1.0, 0.2, 0.0, 0.0]), 2);
        // In the near band for C only
        let near = seed_response(&f.store, "near", unit(&[0.2, 0.0, 0.65, 0.75]), 2);

        let mut state = BatchEvolution::new();
        let pending = f
            .evolver
            .match_to_existing(&[response.clone(), near.clone()], &mut state)
            .unwrap();

        let matched: HashSet<i64> = pending
            .iter()
            .filter(|p| p.response_id == response.id.unwrap())
            .map(|p| p.theme_id)
            .collect();
        assert!(matched.contains(&a));
        assert!(matched.contains(&b));
        assert!(!matched.contains(&c));
        assert!(pending.iter().all(|p| p.confidence >= 0.75));

        // The near response produced no assignment but feeds C's pool
        assert!(!pending.iter().any(|p| p.response_id == near.id.unwrap()));
        assert!(state.refresh_pool[&c].contains(&near.id.unwrap()));
    }

    #[test]
    fn dedupe_creates_novel_and_absorbs_duplicates() {
        let f = fixture(MockGeneration::new().shared());
        let existing = seed_theme(&f.store, "Existing", unit(&[1.0, 0.0, 0.0, 0.0]), 1);

        let duplicate = Theme {
            id: None,
            name: "Near Duplicate".to_string(),
            description: "overlaps the existing theme".to_string(),
            embedding: unit(&[0.98, 0.05, 0.0, 0.0]),
            status: ThemeStatus::Active,
            created_at_batch: 2,
            last_updated_batch: 2,
            parent_theme_id: None,
            response_count: 0,
            metadata: ThemeOrigin::Seeded,
        };
        let novel = Theme {
            embedding: unit(&[0.0, 0.0, 1.0, 0.0]),
            name: "Novel".to_string(),
            ..duplicate.clone()
        };

        let response = seed_response(&f.store, "dup text", unit(&[1.0, 0.02, 0.0, 0.0]), 2);

        let mut state = BatchEvolution::new();
        let (pending, created) = f
            .evolver
            .dedupe_candidates(
                vec![duplicate, novel],
                &[response.clone()],
                2,
                &mut state,
            )
            .unwrap();

        assert_eq!(created, 1, "only the novel candidate becomes a theme");
        assert_eq!(f.store.themes_by_status(ThemeStatus::Active).unwrap().len(), 2);

        // The duplicate's intended response routed to the existing theme
        assert!(pending
            .iter()
            .any(|p| p.response_id == response.id.unwrap() && p.theme_id == existing));

        let entries = f.store.evolution_by_batch(2).unwrap();
        assert!(entries.iter().any(|e| e.action == EvolutionAction::Reassigned));
        assert!(entries.iter().any(|e| e.action == EvolutionAction::Created));
    }

    #[tokio::test]
    async fn merge_prefers_heavier_theme_and_rewrites() {
        let generation = MockGeneration::new()
            .with_default("Merged description covering both member groups")
            .shared();
        let f = fixture(generation);

        let heavy = seed_theme(&f.store, "Heavy", unit(&[1.0, 0.05, 0.0, 0.0]), 1);
        let light = seed_theme(&f.store, "Light", unit(&[1.0, 0.0, 0.0, 0.0]), 1);

        for i in 0..3 {
            let r = seed_response(&f.store, &format!("heavy {i}"), unit(&[1.0, 0.05, 0.0, 0.0]), 1);
            f.store.put_assignment(r.id.unwrap(), heavy, 0.9, &[], 1).unwrap();
        }
        let lone = seed_response(&f.store, "light member", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        f.store.put_assignment(lone.id.unwrap(), light, 0.9, &[], 1).unwrap();

        let mut state = BatchEvolution::new();
        let merged = f.evolver.detect_merges(2, &mut state).await.unwrap();
        assert_eq!(merged, 1);

        let survivor = f.store.get_theme(heavy).unwrap().unwrap();
        assert_eq!(survivor.status, ThemeStatus::Active);
        assert_eq!(survivor.response_count, 4);
        assert_eq!(survivor.description, "Merged description covering both member groups");

        let absorbed = f.store.get_theme(light).unwrap().unwrap();
        assert_eq!(absorbed.status, ThemeStatus::Merged);
        assert_eq!(absorbed.parent_theme_id, Some(heavy));

        // No assignment points at the merged theme
        assert!(f.store.assignments_by_theme(light).unwrap().is_empty());
        let rewritten = f.store.assignments_by_response(lone.id.unwrap()).unwrap();
        assert_eq!(rewritten[0].theme_id, heavy);
        assert_eq!(rewritten[0].last_updated_batch, 2);

        let entries = f.store.evolution_by_batch(2).unwrap();
        let merge_entry = entries
            .iter()
            .find(|e| e.action == EvolutionAction::Merged)
            .unwrap();
        assert_eq!(merge_entry.theme_id, heavy);
        assert_eq!(merge_entry.related_theme_id, Some(light));
    }

    #[tokio::test]
    async fn merge_happens_at_most_once_per_theme_per_batch() {
        let generation = MockGeneration::new().with_default("desc").shared();
        let f = fixture(generation);

        // Three mutually similar themes: only one merge may involve each
        seed_theme(&f.store, "A", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        seed_theme(&f.store, "B", unit(&[0.99, 0.01, 0.0, 0.0]), 1);
        seed_theme(&f.store, "C", unit(&[0.98, 0.02, 0.0, 0.0]), 1);

        let mut state = BatchEvolution::new();
        let merged = f.evolver.detect_merges(2, &mut state).await.unwrap();
        assert_eq!(merged, 1, "second overlapping pair must wait for the next batch");
        assert_eq!(f.store.themes_by_status(ThemeStatus::Active).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn split_divides_drifted_theme() {
        let generation = MockGeneration::new()
            .add_response("sub-group", r#"[{"name": "Focused Child", "description": "one side"}]"#)
            .shared();
        let f = fixture(generation);

        let parent = seed_theme(&f.store, "Broad", unit(&[0.5, 0.5, 0.0, 0.0]), 1);
        // Two anti-aligned clusters of five members each
        for i in 0..5 {
            let jitter = 0.02 * i as f32;
            let r = seed_response(&f.store, &format!("east {i}"), unit(&[1.0, jitter, 0.0, 0.0]), 1);
            f.store.put_assignment(r.id.unwrap(), parent, 0.8, &[], 1).unwrap();
            let r = seed_response(&f.store, &format!("west {i}"), unit(&[-1.0, 0.0, jitter, 0.0]), 1);
            f.store.put_assignment(r.id.unwrap(), parent, 0.8, &[], 1).unwrap();
        }

        let mut state = BatchEvolution::new();
        let splits = f.evolver.detect_splits(2, &mut state).await.unwrap();
        assert_eq!(splits, 1);

        let old_parent = f.store.get_theme(parent).unwrap().unwrap();
        assert_eq!(old_parent.status, ThemeStatus::Split);
        assert!(f.store.assignments_by_theme(parent).unwrap().is_empty());

        let children: Vec<Theme> = f
            .store
            .themes_by_status(ThemeStatus::Active)
            .unwrap()
            .into_iter()
            .filter(|t| t.parent_theme_id == Some(parent))
            .collect();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!(child.response_count >= 2);
            assert_eq!(child.created_at_batch, 2);
        }

        let entries = f.store.evolution_by_batch(2).unwrap();
        let split_entry = entries
            .iter()
            .find(|e| e.action == EvolutionAction::Split)
            .unwrap();
        assert_eq!(split_entry.theme_id, parent);
        assert_eq!(split_entry.details.child_theme_ids.len(), 2);
        assert_eq!(split_entry.affected_response_count, 10);
    }

    #[tokio::test]
    async fn tight_theme_is_not_split() {
        let f = fixture(MockGeneration::new().shared());
        let parent = seed_theme(&f.store, "Tight", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        for i in 0..6 {
            let jitter = 0.01 * i as f32;
            let r = seed_response(&f.store, &format!("member {i}"), unit(&[1.0, jitter, 0.0, 0.0]), 1);
            f.store.put_assignment(r.id.unwrap(), parent, 0.9, &[], 1).unwrap();
        }

        let mut state = BatchEvolution::new();
        assert_eq!(f.evolver.detect_splits(2, &mut state).await.unwrap(), 0);
        assert_eq!(
            f.store.get_theme(parent).unwrap().unwrap().status,
            ThemeStatus::Active
        );
    }

    #[tokio::test]
    async fn refresh_applies_only_past_drift_threshold() {
        // The revised description lands on entirely different topic axes,
        // so the embedding moves far
        let generation = MockGeneration::new()
            .with_default("completely different wording about deadlines and planning pressure")
            .shared();
        let f = fixture_with_embedding(
            generation,
            MockEmbedding::with_topics(16, &[&["workload"], &["deadlines", "planning", "pressure"]]),
        );

        let theme = seed_theme(&f.store, "Workload", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        let mut state = BatchEvolution::new();
        for i in 0..3 {
            let r = seed_response(&f.store, &format!("new evidence {i}"), unit(&[0.9, 0.1, 0.0, 0.0]), 2);
            state.note_response(theme, r.id.unwrap());
        }

        let updated = f.evolver.refresh_descriptions(2, &mut state).await.unwrap();
        assert_eq!(updated, 1);
        let refreshed = f.store.get_theme(theme).unwrap().unwrap();
        assert!(refreshed.description.contains("deadlines"));
        assert_eq!(refreshed.last_updated_batch, 2);

        let entries = f.store.evolution_by_batch(2).unwrap();
        assert!(entries.iter().any(|e| e.action == EvolutionAction::Updated));
    }

    #[tokio::test]
    async fn refresh_needs_enough_new_evidence() {
        let generation = MockGeneration::new().with_default("different text").shared();
        let f = fixture(generation);
        let theme = seed_theme(&f.store, "Sparse", unit(&[1.0, 0.0, 0.0, 0.0]), 1);

        let mut state = BatchEvolution::new();
        let r = seed_response(&f.store, "only one", unit(&[0.9, 0.1, 0.0, 0.0]), 2);
        state.note_response(theme, r.id.unwrap());

        assert_eq!(f.evolver.refresh_descriptions(2, &mut state).await.unwrap(), 0);
    }

    #[test]
    fn empty_pre_existing_themes_are_retired() {
        let f = fixture(MockGeneration::new().shared());
        let stale = seed_theme(&f.store, "Stale", unit(&[1.0, 0.0, 0.0, 0.0]), 1);
        // Fresh theme from the current batch is left alone
        let fresh = seed_theme(&f.store, "Fresh", unit(&[0.0, 1.0, 0.0, 0.0]), 2);

        let mut state = BatchEvolution::new();
        let retired = f.evolver.retire_empty(2, &mut state).unwrap();
        assert_eq!(retired, 1);
        assert_eq!(
            f.store.get_theme(stale).unwrap().unwrap().status,
            ThemeStatus::Retired
        );
        assert_eq!(
            f.store.get_theme(fresh).unwrap().unwrap().status,
            ThemeStatus::Active
        );
    }
}
