//! Vector math shared by the store index, evolver, and highlighter
//!
//! All similarity in the engine is cosine over unit vectors; storage
//! normalizes on write, so dot products and cosine agree for stored rows.

/// Compute cosine similarity between two vectors
///
/// Returns 0.0 for mismatched lengths or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// L2-normalize in place; the zero vector is left unchanged
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Whether a vector is (numerically) the zero vector
pub fn is_zero(v: &[f32]) -> bool {
    v.iter().all(|x| x.abs() <= f32::EPSILON)
}

/// Unnormalized mean of a set of vectors
pub fn mean_vector(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut mean = vec![0.0f32; first.len()];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    mean
}

/// Normalized centroid of a set of vectors
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let mut c = mean_vector(vectors);
    l2_normalize(&mut c);
    c
}

/// Weighted average of two vectors, renormalized
pub fn weighted_average(a: &[f32], wa: f32, b: &[f32], wb: f32) -> Vec<f32> {
    let total = (wa + wb).max(f32::EPSILON);
    let mut out: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x * wa + y * wb) / total)
        .collect();
    l2_normalize(&mut out);
    out
}

/// Intra-cluster variance: `1 - mean_i cos(centroid, v_i)`
pub fn cluster_variance(vectors: &[&[f32]]) -> f32 {
    if vectors.is_empty() {
        return 0.0;
    }
    let c = centroid(vectors);
    let mean_sim: f32 = vectors
        .iter()
        .map(|v| cosine_similarity(&c, v))
        .sum::<f32>()
        / vectors.len() as f32;
    1.0 - mean_sim
}

/// Deterministic k-means over unit vectors using cosine distance
///
/// Centroid initialization is farthest-point: the first input seeds the
/// first centroid, each further centroid is the input farthest (by cosine
/// distance) from all chosen so far. Returns per-input cluster labels and
/// the final normalized centroids. `k` is capped at the input count.
pub fn kmeans(vectors: &[&[f32]], k: usize, max_iters: usize) -> (Vec<usize>, Vec<Vec<f32>>) {
    let n = vectors.len();
    let k = k.min(n);
    if k == 0 {
        return (Vec::new(), Vec::new());
    }

    // Farthest-point initialization
    let mut centroids: Vec<Vec<f32>> = vec![vectors[0].to_vec()];
    while centroids.len() < k {
        let (next, _) = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let nearest = centroids
                    .iter()
                    .map(|c| cosine_similarity(c, v))
                    .fold(f32::NEG_INFINITY, f32::max);
                (i, nearest)
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("nonempty input");
        centroids.push(vectors[next].to_vec());
    }
    for c in centroids.iter_mut() {
        l2_normalize(c);
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iters {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let best = centroids
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    cosine_similarity(a, v)
                        .partial_cmp(&cosine_similarity(b, v))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(j, _)| j)
                .unwrap_or(0);
            if labels[i] != best {
                labels[i] = best;
                changed = true;
            }
        }

        for (j, c) in centroids.iter_mut().enumerate() {
            let members: Vec<&[f32]> = vectors
                .iter()
                .enumerate()
                .filter(|(i, _)| labels[*i] == j)
                .map(|(_, v)| *v)
                .collect();
            if !members.is_empty() {
                *c = centroid(&members);
            }
        }

        if !changed {
            break;
        }
    }

    (labels, centroids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-6);

        assert_eq!(cosine_similarity(&a, &[0.0; 3]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let mut z = vec![0.0, 0.0];
        l2_normalize(&mut z);
        assert!(is_zero(&z));
    }

    #[test]
    fn weighted_average_leans_toward_heavier_side() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let avg = weighted_average(&a, 3.0, &b, 1.0);
        assert!(avg[0] > avg[1]);
        let norm: f32 = avg.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn variance_low_for_tight_cluster_high_for_spread() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.99, 0.01, 0.0];
        let tight = cluster_variance(&[&a, &b]);
        assert!(tight < 0.05, "tight cluster variance was {tight}");

        let c = vec![-1.0, 0.0, 0.0];
        let spread = cluster_variance(&[&a, &c]);
        assert!(spread > 0.4, "spread cluster variance was {spread}");
    }

    #[test]
    fn kmeans_separates_two_obvious_clusters() {
        let cluster_a: Vec<Vec<f32>> = vec![
            vec![1.0, 0.0, 0.05],
            vec![1.0, 0.0, -0.05],
            vec![0.98, 0.02, 0.0],
        ];
        let cluster_b: Vec<Vec<f32>> = vec![
            vec![-1.0, 0.05, 0.0],
            vec![-1.0, -0.05, 0.0],
            vec![-0.98, 0.0, 0.02],
        ];
        let all: Vec<&[f32]> = cluster_a
            .iter()
            .chain(cluster_b.iter())
            .map(|v| v.as_slice())
            .collect();

        let (labels, centroids) = kmeans(&all, 2, 20);
        assert_eq!(centroids.len(), 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn kmeans_is_deterministic() {
        let vs: Vec<Vec<f32>> = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        let refs: Vec<&[f32]> = vs.iter().map(|v| v.as_slice()).collect();
        let first = kmeans(&refs, 2, 10);
        let second = kmeans(&refs, 2, 10);
        assert_eq!(first.0, second.0);
    }
}
