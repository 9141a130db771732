//! Weighted aggregation and cost-delta computation (spec §4.6).

use crate::config::StageWeights;
use crate::judge::types::{StageVerdict, Winner};

const TIE_THRESHOLD: f64 = 0.005;

/// Mean of a side's per-criterion scores for one stage.
fn stage_average(scores: &std::collections::HashMap<String, f64>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().sum::<f64>() / scores.len() as f64
}

/// `weighted(side) = Σ_stage w_stage · avg(side, stage)` (spec §4.6).
pub fn weighted_overall(
    stage1: &StageVerdict,
    stage2: &StageVerdict,
    stage3: &StageVerdict,
    weights: StageWeights,
) -> (f64, f64) {
    let a = weights.stage1 * stage_average(&stage1.scores_a)
        + weights.stage2 * stage_average(&stage2.scores_a)
        + weights.stage3 * stage_average(&stage3.scores_a);
    let b = weights.stage1 * stage_average(&stage1.scores_b)
        + weights.stage2 * stage_average(&stage2.scores_b)
        + weights.stage3 * stage_average(&stage3.scores_b);
    (a, b)
}

/// `argmax(weighted(A), weighted(B))` with a 0.005 tie threshold.
pub fn implied_winner(weighted_a: f64, weighted_b: f64) -> Winner {
    if (weighted_a - weighted_b).abs() < TIE_THRESHOLD {
        Winner::Tie
    } else if weighted_a > weighted_b {
        Winner::A
    } else {
        Winner::B
    }
}

/// `(weighted(winner) - weighted(loser)) / weighted(loser)`, `None` if the
/// denominator is zero (spec §4.6).
pub fn quality_improvement(weighted_a: f64, weighted_b: f64, winner: Winner) -> Option<f64> {
    let (winner_score, loser_score) = match winner {
        Winner::A => (weighted_a, weighted_b),
        Winner::B => (weighted_b, weighted_a),
        Winner::Tie => return None,
    };
    if loser_score == 0.0 {
        return None;
    }
    Some((winner_score - loser_score) / loser_score)
}

/// `cost_difference = cost_B - cost_A`; `cost_difference_pct = cost_difference / cost_a`,
/// `None` if `cost_a == 0` (spec §4.6).
pub fn cost_difference_pct(cost_a: f64, cost_b: f64) -> (f64, Option<f64>) {
    let diff = cost_b - cost_a;
    if cost_a == 0.0 {
        (diff, None)
    } else {
        (diff, Some(diff / cost_a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn verdict(a: f64, b: f64) -> StageVerdict {
        let mut scores_a = HashMap::new();
        scores_a.insert("crit".to_string(), a);
        let mut scores_b = HashMap::new();
        scores_b.insert("crit".to_string(), b);
        StageVerdict {
            winner: Winner::A,
            scores_a,
            scores_b,
            reasoning: "r".to_string(),
        }
    }

    #[test]
    fn weighted_overall_matches_fixed_stage_weights() {
        let weights = StageWeights::default();
        let (a, b) = weighted_overall(&verdict(1.0, 0.0), &verdict(1.0, 0.0), &verdict(1.0, 0.0), weights);
        assert_eq!(a, 1.0);
        assert_eq!(b, 0.0);
    }

    #[test]
    fn implied_winner_respects_tie_threshold() {
        assert_eq!(implied_winner(0.80, 0.803), Winner::Tie);
        assert_eq!(implied_winner(0.80, 0.83), Winner::B);
    }

    #[test]
    fn quality_improvement_is_null_on_zero_denominator() {
        assert_eq!(quality_improvement(0.5, 0.0, Winner::A), None);
    }

    #[test]
    fn quality_improvement_computes_relative_gain() {
        let result = quality_improvement(0.6, 0.5, Winner::A).unwrap();
        assert!((result - 0.2).abs() < 1e-9);
    }

    #[test]
    fn cost_difference_pct_null_when_cost_a_zero() {
        let (diff, pct) = cost_difference_pct(0.0, 0.01);
        assert_eq!(diff, 0.01);
        assert_eq!(pct, None);
    }

    #[test]
    fn cost_difference_pct_matches_formula() {
        let (diff, pct) = cost_difference_pct(0.0001, 0.00012);
        assert!((diff - 0.00002).abs() < 1e-9);
        assert!((pct.unwrap() - 0.2).abs() < 1e-6);
    }
}
