use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::learning::CycleResult;

use super::{parse_timestamp, parse_u64, CycleRepository, RepositoryError, StoredCycleRun};
use crate::DbPool;

pub struct SqlCycleRepository {
    pool: DbPool,
}

impl SqlCycleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CycleRepository for SqlCycleRepository {
    async fn record(&self, result: CycleResult, aborted: bool) -> Result<(), RepositoryError> {
        let outcomes_json = serde_json::to_string(&result.outcomes)
            .map_err(|error| RepositoryError::Decode(format!("encode outcomes: {error}")))?;

        sqlx::query(
            "INSERT INTO cycle_run (
                id,
                triggered_by,
                started_at,
                finished_at,
                aborted,
                outcomes_json,
                settings_version
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.cycle_id)
        .bind(result.trigger.as_str())
        .bind(result.started_at.to_rfc3339())
        .bind(result.finished_at.to_rfc3339())
        .bind(i64::from(aborted))
        .bind(outcomes_json)
        .bind(result.settings_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<StoredCycleRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                triggered_by,
                started_at,
                finished_at,
                aborted,
                outcomes_json,
                settings_version
             FROM cycle_run
             ORDER BY started_at DESC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }
}

fn run_from_row(row: SqliteRow) -> Result<StoredCycleRun, RepositoryError> {
    Ok(StoredCycleRun {
        id: row.try_get("id")?,
        triggered_by: row.try_get("triggered_by")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_timestamp("finished_at", row.try_get("finished_at")?)?,
        aborted: row.try_get::<i64, _>("aborted")? != 0,
        outcomes_json: row.try_get("outcomes_json")?,
        settings_version: parse_u64("settings_version", row.try_get("settings_version")?)?,
    })
}
