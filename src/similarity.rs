//! Vector similarity and lexical fallback scoring

use std::collections::HashSet;

/// Cosine similarity of two vectors, clamped to [0, 1].
///
/// Returns 0.0 for zero-norm or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Cosine similarity of a query against a row-major matrix of embeddings.
///
/// Rows that are empty or of mismatched dimension score 0.0.
pub fn batch_cosine_similarity(query: &[f32], rows: &[Vec<f32>]) -> Vec<f32> {
    rows.iter()
        .map(|row| cosine_similarity(query, row))
        .collect()
}

/// Offloaded variant for large matrices. The matrix product is CPU-bound, so
/// it runs on the blocking pool rather than starving the scheduler.
pub async fn batch_cosine_similarity_blocking(query: Vec<f32>, rows: Vec<Vec<f32>>) -> Vec<f32> {
    tokio::task::spawn_blocking(move || batch_cosine_similarity(&query, &rows))
        .await
        .unwrap_or_else(|_| vec![0.0; 0])
}

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Token-level Jaccard similarity, the lexical fallback used when no
/// embedding is available. Case-insensitive, whitespace tokenization.
pub fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = tokenize(a).collect();
    let set_b: HashSet<String> = tokenize(b).collect();

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_is_clamped_nonnegative() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn batch_matches_single() {
        let q = vec![1.0, 0.0];
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let sims = batch_cosine_similarity(&q, &rows);
        assert!((sims[0] - 1.0).abs() < 1e-6);
        assert!(sims[1].abs() < 1e-6);
    }

    #[test]
    fn normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn jaccard_overlap() {
        let a = "the quick brown fox";
        let b = "the slow brown dog";
        // {the, brown} / {the, quick, brown, fox, slow, dog}
        let sim = jaccard_similarity(a, b);
        assert!((sim - 2.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn jaccard_case_and_punctuation() {
        assert!((jaccard_similarity("Hello, World!", "hello world") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn jaccard_empty_is_zero() {
        assert_eq!(jaccard_similarity("", "anything"), 0.0);
    }
}
