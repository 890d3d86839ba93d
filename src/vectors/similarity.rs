//! Cosine similarity between embeddings.
//!
//! Vectors are normalized explicitly at comparison time even though stored
//! embeddings are already unit length. A zero vector produces NaN; callers
//! are expected to treat such vectors as "no embedding available" upstream.

use crate::errors::EngineError;

/// A candidate that passed the threshold in [`compare_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    /// Position of the candidate in the input slice
    pub index: usize,
    /// Cosine similarity score
    pub score: f32,
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity `dot(a, b) / (|a| * |b|)`.
///
/// Fails if either vector is empty or their lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EngineError> {
    if a.is_empty() || b.is_empty() {
        return Err(EngineError::vector("cannot compare an empty vector"));
    }
    if a.len() != b.len() {
        return Err(EngineError::vector(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    Ok(dot(a, b) / (l2_norm(a) * l2_norm(b)))
}

/// Compare `query` against every candidate in one pass.
///
/// Keeps candidates scoring `>= threshold` and returns them sorted by score,
/// highest first. Equal scores keep their input order.
pub fn compare_batch<V: AsRef<[f32]>>(
    query: &[f32],
    candidates: &[V],
    threshold: f32,
) -> Result<Vec<SimilarityMatch>, EngineError> {
    if query.is_empty() {
        return Err(EngineError::vector("cannot compare an empty query vector"));
    }

    let query_norm = l2_norm(query);
    let mut results = Vec::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let candidate = candidate.as_ref();
        if candidate.len() != query.len() {
            return Err(EngineError::vector(format!(
                "candidate {index} has {} dimensions, query has {}",
                candidate.len(),
                query.len()
            )));
        }

        let score = dot(query, candidate) / (query_norm * l2_norm(candidate));
        // NaN fails this comparison and is dropped
        if score >= threshold {
            results.push(SimilarityMatch { index, score });
        }
    }

    // stable: ties stay in candidate order
    results.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(results)
}
