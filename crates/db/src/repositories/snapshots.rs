use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::domain::snapshot::{EntityId, PerformanceSnapshot};

use super::{parse_decimal, parse_timestamp, parse_u64, RepositoryError, SnapshotRepository};
use crate::DbPool;

pub struct SqlSnapshotRepository {
    pool: DbPool,
}

impl SqlSnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SnapshotRepository for SqlSnapshotRepository {
    async fn upsert(&self, snapshot: PerformanceSnapshot) -> Result<(), RepositoryError> {
        // A re-observation of the same (entity, window) supersedes the old
        // row; historical windows stay immutable.
        sqlx::query(
            "INSERT INTO performance_snapshot (
                entity_id,
                window_start,
                window_end,
                impressions,
                clicks,
                conversions,
                spend,
                revenue,
                ctr,
                roas,
                entity_created_at,
                observed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_id, window_start, window_end) DO UPDATE SET
                impressions = excluded.impressions,
                clicks = excluded.clicks,
                conversions = excluded.conversions,
                spend = excluded.spend,
                revenue = excluded.revenue,
                ctr = excluded.ctr,
                roas = excluded.roas,
                entity_created_at = excluded.entity_created_at,
                observed_at = excluded.observed_at",
        )
        .bind(&snapshot.entity_id.0)
        .bind(snapshot.window_start.to_rfc3339())
        .bind(snapshot.window_end.to_rfc3339())
        .bind(snapshot.impressions as i64)
        .bind(snapshot.clicks as i64)
        .bind(snapshot.conversions as i64)
        .bind(snapshot.spend.to_string())
        .bind(snapshot.revenue.to_string())
        .bind(snapshot.ctr)
        .bind(snapshot.roas)
        .bind(snapshot.entity_created_at.to_rfc3339())
        .bind(snapshot.observed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        entity_id: &EntityId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<PerformanceSnapshot>, RepositoryError> {
        let row = sqlx::query(&select_sql(
            "WHERE entity_id = ? AND window_start = ? AND window_end = ?",
        ))
        .bind(&entity_id.0)
        .bind(window_start.to_rfc3339())
        .bind(window_end.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(snapshot_from_row).transpose()
    }

    async fn latest_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<PerformanceSnapshot>, RepositoryError> {
        let row = sqlx::query(&select_sql(
            "WHERE entity_id = ? ORDER BY window_end DESC LIMIT 1",
        ))
        .bind(&entity_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(snapshot_from_row).transpose()
    }

    async fn list_observed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSnapshot>, RepositoryError> {
        let rows = sqlx::query(&select_sql("WHERE observed_at >= ? ORDER BY observed_at ASC"))
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(snapshot_from_row).collect()
    }
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT
            entity_id,
            window_start,
            window_end,
            impressions,
            clicks,
            conversions,
            spend,
            revenue,
            ctr,
            roas,
            entity_created_at,
            observed_at
         FROM performance_snapshot {where_clause}"
    )
}

fn snapshot_from_row(row: SqliteRow) -> Result<PerformanceSnapshot, RepositoryError> {
    Ok(PerformanceSnapshot {
        entity_id: EntityId(row.try_get("entity_id")?),
        window_start: parse_timestamp("window_start", row.try_get("window_start")?)?,
        window_end: parse_timestamp("window_end", row.try_get("window_end")?)?,
        impressions: parse_u64("impressions", row.try_get("impressions")?)?,
        clicks: parse_u64("clicks", row.try_get("clicks")?)?,
        conversions: parse_u64("conversions", row.try_get("conversions")?)?,
        spend: parse_decimal("spend", row.try_get("spend")?)?,
        revenue: parse_decimal("revenue", row.try_get("revenue")?)?,
        ctr: row.try_get("ctr")?,
        roas: row.try_get("roas")?,
        entity_created_at: parse_timestamp("entity_created_at", row.try_get("entity_created_at")?)?,
        observed_at: parse_timestamp("observed_at", row.try_get("observed_at")?)?,
    })
}
