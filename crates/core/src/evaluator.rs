//! Champion/challenger comparison.
//!
//! Scores a held-out sample through both models and decides whether the
//! challenger clears the promotion gate. This is the only path by which a
//! retrained model can affect live traffic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub min_improvement_pct: f64,
    pub min_samples: u64,
    /// One of the supported confidence levels (0.90, 0.95, 0.99). Other
    /// values are snapped to the nearest supported level.
    pub confidence_level: f64,
    pub min_accuracy_delta: f64,
    pub auto_promote: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_improvement_pct: 2.0,
            min_samples: 200,
            confidence_level: 0.95,
            min_accuracy_delta: 0.01,
            auto_promote: false,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("holdout sets differ in length: champion {champion}, challenger {challenger}")]
    MismatchedHoldout { champion: usize, challenger: usize },
    #[error("holdout set is empty")]
    EmptyHoldout,
}

/// Statistical outcome of one comparison. `challenger_wins` is the gate
/// decision; the surrounding metrics are retained for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub champion_accuracy: f64,
    pub challenger_accuracy: f64,
    pub accuracy_delta: f64,
    pub improvement_pct: f64,
    pub sample_size: u64,
    pub confidence_level: f64,
    pub z_score: f64,
    pub challenger_wins: bool,
}

/// Per-sample holdout correctness for both models, same sample order.
pub fn evaluate(
    champion_correct: &[bool],
    challenger_correct: &[bool],
    config: &EvaluationConfig,
) -> Result<EvaluationVerdict, EvaluationError> {
    if champion_correct.len() != challenger_correct.len() {
        return Err(EvaluationError::MismatchedHoldout {
            champion: champion_correct.len(),
            challenger: challenger_correct.len(),
        });
    }
    if champion_correct.is_empty() {
        return Err(EvaluationError::EmptyHoldout);
    }

    let n = champion_correct.len() as f64;
    let champion_accuracy = accuracy(champion_correct);
    let challenger_accuracy = accuracy(challenger_correct);
    let accuracy_delta = challenger_accuracy - champion_accuracy;

    let improvement_pct = if champion_accuracy > 0.0 {
        accuracy_delta / champion_accuracy * 100.0
    } else if accuracy_delta > 0.0 {
        100.0
    } else {
        0.0
    };

    // Two-proportion z test for the accuracy delta.
    let variance = champion_accuracy * (1.0 - champion_accuracy) / n
        + challenger_accuracy * (1.0 - challenger_accuracy) / n;
    let z_score = if variance > 0.0 {
        accuracy_delta / variance.sqrt()
    } else if accuracy_delta > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let confidence_level = nearest_supported_level(config.confidence_level);
    let sample_size = champion_correct.len() as u64;

    let challenger_wins = sample_size >= config.min_samples
        && accuracy_delta > config.min_accuracy_delta
        && improvement_pct > config.min_improvement_pct
        && z_score > z_critical(confidence_level);

    Ok(EvaluationVerdict {
        champion_accuracy,
        challenger_accuracy,
        accuracy_delta,
        improvement_pct,
        sample_size,
        confidence_level,
        z_score,
        challenger_wins,
    })
}

fn accuracy(outcomes: &[bool]) -> f64 {
    outcomes.iter().filter(|correct| **correct).count() as f64 / outcomes.len() as f64
}

const SUPPORTED_LEVELS: [(f64, f64); 3] = [(0.90, 1.282), (0.95, 1.645), (0.99, 2.326)];

fn nearest_supported_level(level: f64) -> f64 {
    SUPPORTED_LEVELS
        .iter()
        .min_by(|(a, _), (b, _)| {
            (a - level).abs().partial_cmp(&(b - level).abs()).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(supported, _)| *supported)
        .unwrap_or(0.95)
}

fn z_critical(level: f64) -> f64 {
    SUPPORTED_LEVELS
        .iter()
        .find(|(supported, _)| (*supported - level).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or(1.645)
}
