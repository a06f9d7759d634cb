use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::domain::model::{
    CandidateStatus, ChampionRecord, EvaluationResult, ModelCandidate, ModelId,
};

use super::{parse_timestamp, parse_u32, parse_u64, ModelRepository, RepositoryError};
use crate::DbPool;

pub struct SqlModelRepository {
    pool: DbPool,
}

impl SqlModelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ModelRepository for SqlModelRepository {
    async fn save_candidate(&self, candidate: ModelCandidate) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO model_candidate (
                model_id,
                model_type,
                trained_at,
                training_sample_count,
                status
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(model_id) DO UPDATE SET
                model_type = excluded.model_type,
                trained_at = excluded.trained_at,
                training_sample_count = excluded.training_sample_count,
                status = excluded.status",
        )
        .bind(&candidate.model_id.0)
        .bind(&candidate.model_type)
        .bind(candidate.trained_at.to_rfc3339())
        .bind(candidate.training_sample_count as i64)
        .bind(candidate.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_candidate(
        &self,
        id: &ModelId,
    ) -> Result<Option<ModelCandidate>, RepositoryError> {
        let row = sqlx::query(
            "SELECT model_id, model_type, trained_at, training_sample_count, status
             FROM model_candidate WHERE model_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(candidate_from_row).transpose()
    }

    async fn list_candidates(
        &self,
        status: CandidateStatus,
    ) -> Result<Vec<ModelCandidate>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT model_id, model_type, trained_at, training_sample_count, status
             FROM model_candidate WHERE status = ? ORDER BY trained_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(candidate_from_row).collect()
    }

    async fn current_champion(
        &self,
        name: &str,
    ) -> Result<Option<ChampionRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT name, model_id, version, promoted_at FROM champion WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(champion_from_row).transpose()
    }

    async fn promote(
        &self,
        name: &str,
        model_id: &ModelId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // CAS on the version column: the insert arm only applies when no
        // champion exists (expected 0); the update arm only when the stored
        // version still matches what the caller read.
        let swapped = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO champion (name, model_id, version, promoted_at)
                 VALUES (?, ?, 1, ?)
                 ON CONFLICT(name) DO NOTHING",
            )
            .bind(name)
            .bind(&model_id.0)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE champion
                 SET model_id = ?, version = version + 1, promoted_at = ?
                 WHERE name = ? AND version = ?",
            )
            .bind(&model_id.0)
            .bind(now.to_rfc3339())
            .bind(name)
            .bind(i64::from(expected_version))
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        Ok(swapped == 1)
    }

    async fn save_evaluation(&self, result: EvaluationResult) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO evaluation_result (
                id,
                champion_id,
                challenger_id,
                champion_accuracy,
                challenger_accuracy,
                accuracy_delta,
                improvement_pct,
                sample_size,
                confidence_level,
                challenger_wins,
                settings_version,
                evaluated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.id)
        .bind(&result.champion_id.0)
        .bind(&result.challenger_id.0)
        .bind(result.champion_accuracy)
        .bind(result.challenger_accuracy)
        .bind(result.accuracy_delta)
        .bind(result.improvement_pct)
        .bind(result.sample_size as i64)
        .bind(result.confidence_level)
        .bind(i64::from(result.challenger_wins))
        .bind(i64::from(result.settings_version))
        .bind(result.evaluated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_evaluations_for(
        &self,
        challenger_id: &ModelId,
    ) -> Result<Vec<EvaluationResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                champion_id,
                challenger_id,
                champion_accuracy,
                challenger_accuracy,
                accuracy_delta,
                improvement_pct,
                sample_size,
                confidence_level,
                challenger_wins,
                settings_version,
                evaluated_at
             FROM evaluation_result
             WHERE challenger_id = ?
             ORDER BY evaluated_at ASC",
        )
        .bind(&challenger_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(evaluation_from_row).collect()
    }
}

fn candidate_from_row(row: SqliteRow) -> Result<ModelCandidate, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = CandidateStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown candidate status `{status_raw}`"))
    })?;

    Ok(ModelCandidate {
        model_id: ModelId(row.try_get("model_id")?),
        model_type: row.try_get("model_type")?,
        trained_at: parse_timestamp("trained_at", row.try_get("trained_at")?)?,
        training_sample_count: parse_u64(
            "training_sample_count",
            row.try_get("training_sample_count")?,
        )?,
        status,
    })
}

fn champion_from_row(row: SqliteRow) -> Result<ChampionRecord, RepositoryError> {
    Ok(ChampionRecord {
        name: row.try_get("name")?,
        model_id: ModelId(row.try_get("model_id")?),
        version: parse_u32("version", row.try_get("version")?)?,
        promoted_at: parse_timestamp("promoted_at", row.try_get("promoted_at")?)?,
    })
}

fn evaluation_from_row(row: SqliteRow) -> Result<EvaluationResult, RepositoryError> {
    Ok(EvaluationResult {
        id: row.try_get("id")?,
        champion_id: ModelId(row.try_get("champion_id")?),
        challenger_id: ModelId(row.try_get("challenger_id")?),
        champion_accuracy: row.try_get("champion_accuracy")?,
        challenger_accuracy: row.try_get("challenger_accuracy")?,
        accuracy_delta: row.try_get("accuracy_delta")?,
        improvement_pct: row.try_get("improvement_pct")?,
        sample_size: parse_u64("sample_size", row.try_get("sample_size")?)?,
        confidence_level: row.try_get("confidence_level")?,
        challenger_wins: row.try_get::<i64, _>("challenger_wins")? != 0,
        settings_version: parse_u32("settings_version", row.try_get("settings_version")?)?,
        evaluated_at: parse_timestamp("evaluated_at", row.try_get("evaluated_at")?)?,
    })
}
