//! Which dimensions of an embedding dominate it.

use std::fmt;
use std::str::FromStr;

use super::l2_norm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// `|v_i| / |v|`
    #[default]
    Magnitude,
    /// `v_i² / |v|²`, scores sum to 1
    Contribution,
}

impl FromStr for ScoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "magnitude" | "labels" => Ok(ScoreMode::Magnitude),
            "contribution" | "shap" => Ok(ScoreMode::Contribution),
            other => Err(format!("unknown score mode: {other}")),
        }
    }
}

impl fmt::Display for ScoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreMode::Magnitude => write!(f, "magnitude"),
            ScoreMode::Contribution => write!(f, "contribution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionScore {
    pub dimension: usize,
    /// Raw component value, sign included
    pub value: f32,
    pub score: f32,
}

/// Strongest dimensions of `vector` with a score of at least `threshold`,
/// highest first, at most `max_dims`. Empty for an empty or all-zero vector.
pub fn interpret(
    vector: &[f32],
    mode: ScoreMode,
    threshold: f32,
    max_dims: usize,
) -> Vec<DimensionScore> {
    let norm = l2_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return Vec::new();
    }

    let mut scores: Vec<DimensionScore> = vector
        .iter()
        .enumerate()
        .map(|(dimension, &value)| {
            let score = match mode {
                ScoreMode::Magnitude => value.abs() / norm,
                ScoreMode::Contribution => (value * value) / (norm * norm),
            };
            DimensionScore {
                dimension,
                value,
                score,
            }
        })
        .filter(|d| d.score >= threshold)
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores.truncate(max_dims);
    scores
}
