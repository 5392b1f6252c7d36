use crate::grade::round_half_up;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    pub score: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    #[error("no scores to aggregate")]
    Empty,
    #[error("weight must be a finite non-negative number, got {0}")]
    BadWeight(f64),
    #[error("weights sum to zero")]
    ZeroTotalWeight,
}

/// `round(Σ(score·weight) / Σ(weight))`, rounding half away from zero.
pub fn compute_from_scores(scores: &[WeightedScore]) -> Result<i64, AggregateError> {
    if scores.is_empty() {
        return Err(AggregateError::Empty);
    }
    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;
    for s in scores {
        if !s.weight.is_finite() || s.weight < 0.0 {
            return Err(AggregateError::BadWeight(s.weight));
        }
        weighted_sum += s.score * s.weight;
        weight_total += s.weight;
    }
    if weight_total <= 0.0 {
        return Err(AggregateError::ZeroTotalWeight);
    }
    Ok(round_half_up(weighted_sum / weight_total))
}
