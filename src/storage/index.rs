//! In-process IVF-flat vector index
//!
//! Serves the store's cosine similarity queries over unit vectors. Below
//! the training threshold every query is an exact scan; past it, vectors
//! are bucketed into inverted lists around k-means centroids and queries
//! probe the nearest lists. Probe width is kept at half the list count so
//! recall stays well above 0.95 at the engine's tuned thresholds.

use crate::vectors::{cosine_similarity, kmeans};
use std::collections::HashMap;

/// Rows are bucketed once this many vectors are present
const TRAIN_THRESHOLD: usize = 512;

/// Training iterations for the coarse quantizer
const TRAIN_ITERS: usize = 10;

/// Approximate inverted-list index keyed by row id
#[derive(Debug, Default)]
pub struct IvfIndex {
    entries: HashMap<i64, Vec<f32>>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<i64>>,
    /// Row -> inverted list, only populated while trained
    list_of: HashMap<i64, usize>,
    trained_at: usize,
}

impl IvfIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Insert or replace a row's vector
    pub fn insert(&mut self, id: i64, vector: Vec<f32>) {
        self.remove(id);
        if self.is_trained() {
            let list = self.nearest_centroid(&vector);
            self.lists[list].push(id);
            self.list_of.insert(id, list);
        }
        self.entries.insert(id, vector);
        self.maybe_train();
    }

    /// Remove a row if present
    pub fn remove(&mut self, id: i64) {
        if self.entries.remove(&id).is_some() {
            if let Some(list) = self.list_of.remove(&id) {
                self.lists[list].retain(|&other| other != id);
            }
        }
    }

    /// Drop everything, including the trained quantizer
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Top-k rows with cosine similarity >= `min_cos`, most similar first
    pub fn search(&self, query: &[f32], min_cos: f32, k: usize) -> Vec<(i64, f32)> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<(i64, f32)> = if self.is_trained() {
            let probes = self.probe_lists(query);
            probes
                .iter()
                .flat_map(|&list| self.lists[list].iter())
                .filter_map(|id| {
                    let sim = cosine_similarity(query, &self.entries[id]);
                    (sim >= min_cos).then_some((*id, sim))
                })
                .collect()
        } else {
            self.entries
                .iter()
                .filter_map(|(id, vector)| {
                    let sim = cosine_similarity(query, vector);
                    (sim >= min_cos).then_some((*id, sim))
                })
                .collect()
        };

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        self.centroids
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                cosine_similarity(a, vector)
                    .partial_cmp(&cosine_similarity(b, vector))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// The half of the lists nearest the query
    fn probe_lists(&self, query: &[f32]) -> Vec<usize> {
        let nprobe = (self.centroids.len() / 2).max(1);
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(c, query)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(nprobe);
        ranked.into_iter().map(|(i, _)| i).collect()
    }

    /// (Re)train the coarse quantizer when the row count warrants it
    fn maybe_train(&mut self) {
        let n = self.entries.len();
        let due = if self.is_trained() {
            n >= self.trained_at * 2
        } else {
            n >= TRAIN_THRESHOLD
        };
        if !due {
            return;
        }

        let nlist = ((n as f32).sqrt() as usize).clamp(8, 64);
        let mut ids: Vec<i64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        let refs: Vec<&[f32]> = ids.iter().map(|id| self.entries[id].as_slice()).collect();
        let (labels, centroids) = kmeans(&refs, nlist, TRAIN_ITERS);

        self.centroids = centroids;
        self.lists = vec![Vec::new(); self.centroids.len()];
        self.list_of.clear();
        for (id, label) in ids.into_iter().zip(labels) {
            self.lists[label].push(id);
            self.list_of.insert(id, label);
        }
        self.trained_at = n;
    }
}
