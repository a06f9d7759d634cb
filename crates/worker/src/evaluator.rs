//! Champion/challenger evaluation worker.
//!
//! Scores a trained candidate against the live champion on a held-out
//! sample, persists the comparison, and swaps the champion pointer through
//! the compare-and-swap version when the challenger clears the gate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use adloop_core::domain::model::{CandidateStatus, EvaluationResult, ModelCandidate, ModelId};
use adloop_core::errors::{ApplicationError, DomainError};
use adloop_core::evaluator;
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::ModelRepository;

/// Name of the single champion slot served to live traffic.
pub const CHAMPION_NAME: &str = "creative_scorer";

/// Per-sample holdout correctness for both models, same sample order.
pub struct HoldoutScores {
    pub champion_correct: Vec<bool>,
    pub challenger_correct: Vec<bool>,
}

/// Scoring runs outside this service; the evaluator only consumes the
/// per-sample correctness it reports back.
#[async_trait::async_trait]
pub trait HoldoutScorer: Send + Sync {
    async fn score(
        &self,
        champion: &ModelId,
        challenger: &ModelId,
    ) -> Result<HoldoutScores, ApplicationError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// No champion existed; the candidate was installed as the first one.
    InstalledFirstChampion,
    /// Challenger won the comparison and took the champion slot.
    Promoted,
    /// Challenger lost the comparison and was archived.
    ChampionRetained,
    /// Challenger won but automatic promotion is disabled; left as candidate
    /// for a manual decision.
    PromotionHeld,
    /// Another evaluator swapped the champion first. Retryable.
    LostPromotionRace,
}

pub struct ChallengerEvaluator {
    models: Arc<dyn ModelRepository>,
    scorer: Arc<dyn HoldoutScorer>,
    settings: SettingsHandle,
}

impl ChallengerEvaluator {
    pub fn new(
        models: Arc<dyn ModelRepository>,
        scorer: Arc<dyn HoldoutScorer>,
        settings: SettingsHandle,
    ) -> Self {
        Self { models, scorer, settings }
    }

    pub async fn evaluate_challenger(
        &self,
        challenger_id: &ModelId,
        now: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, ApplicationError> {
        let mut challenger = self
            .models
            .find_candidate(challenger_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
            .ok_or_else(|| {
                ApplicationError::Domain(DomainError::InvariantViolation(format!(
                    "model candidate {challenger_id} not found"
                )))
            })?;

        let Some(champion) = self
            .models
            .current_champion(CHAMPION_NAME)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
        else {
            return self.install_first_champion(challenger, now).await;
        };

        let scores = self.scorer.score(&champion.model_id, challenger_id).await?;
        let settings = self.settings.current();
        let verdict = evaluator::evaluate(
            &scores.champion_correct,
            &scores.challenger_correct,
            &settings.evaluation,
        )
        .map_err(|error| {
            ApplicationError::Domain(DomainError::InvariantViolation(error.to_string()))
        })?;

        let result = EvaluationResult {
            id: Uuid::new_v4().to_string(),
            champion_id: champion.model_id.clone(),
            challenger_id: challenger_id.clone(),
            champion_accuracy: verdict.champion_accuracy,
            challenger_accuracy: verdict.challenger_accuracy,
            accuracy_delta: verdict.accuracy_delta,
            improvement_pct: verdict.improvement_pct,
            sample_size: verdict.sample_size,
            confidence_level: verdict.confidence_level,
            challenger_wins: verdict.challenger_wins,
            settings_version: settings.version as u32,
            evaluated_at: now,
        };
        self.models
            .save_evaluation(result)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        if !verdict.challenger_wins {
            challenger.status = CandidateStatus::Archived;
            self.models
                .save_candidate(challenger)
                .await
                .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
            info!(
                event_name = "evaluator.champion.retained",
                correlation_id = %challenger_id,
                champion_id = %champion.model_id,
                accuracy_delta = verdict.accuracy_delta,
                "challenger lost, archived"
            );
            return Ok(EvaluationOutcome::ChampionRetained);
        }

        if !settings.evaluation.auto_promote {
            info!(
                event_name = "evaluator.promotion.held",
                correlation_id = %challenger_id,
                champion_id = %champion.model_id,
                improvement_pct = verdict.improvement_pct,
                "challenger won but auto promotion is disabled"
            );
            return Ok(EvaluationOutcome::PromotionHeld);
        }

        let swapped = self
            .models
            .promote(CHAMPION_NAME, challenger_id, champion.version, now)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if !swapped {
            warn!(
                event_name = "evaluator.promotion.lost_race",
                correlation_id = %challenger_id,
                expected_version = champion.version,
                "champion changed during evaluation, promotion abandoned"
            );
            return Ok(EvaluationOutcome::LostPromotionRace);
        }

        challenger.status = CandidateStatus::Promoted;
        self.models
            .save_candidate(challenger)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        self.archive_model(&champion.model_id).await?;

        info!(
            event_name = "evaluator.champion.promoted",
            correlation_id = %challenger_id,
            previous_champion = %champion.model_id,
            improvement_pct = verdict.improvement_pct,
            sample_size = verdict.sample_size,
            "challenger promoted to champion"
        );
        Ok(EvaluationOutcome::Promoted)
    }

    async fn install_first_champion(
        &self,
        mut challenger: ModelCandidate,
        now: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, ApplicationError> {
        let installed = self
            .models
            .promote(CHAMPION_NAME, &challenger.model_id, 0, now)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if !installed {
            return Ok(EvaluationOutcome::LostPromotionRace);
        }

        challenger.status = CandidateStatus::Promoted;
        let challenger_id = challenger.model_id.clone();
        self.models
            .save_candidate(challenger)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        info!(
            event_name = "evaluator.champion.installed",
            correlation_id = %challenger_id,
            "no champion existed, candidate installed directly"
        );
        Ok(EvaluationOutcome::InstalledFirstChampion)
    }

    async fn archive_model(&self, model_id: &ModelId) -> Result<(), ApplicationError> {
        let Some(mut previous) = self
            .models
            .find_candidate(model_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
        else {
            return Ok(());
        };
        previous.status = CandidateStatus::Archived;
        self.models
            .save_candidate(previous)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))
    }
}
