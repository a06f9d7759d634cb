use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::domain::winner::{InsightId, WinnerInsight, WinnerType};

use super::{parse_decimal, parse_timestamp, parse_u32, parse_u64, InsightRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInsightRepository {
    pool: DbPool,
}

impl SqlInsightRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl InsightRepository for SqlInsightRepository {
    async fn insert_if_absent(&self, insight: WinnerInsight) -> Result<bool, RepositoryError> {
        let features = serde_json::to_string(&insight.creative_features)
            .map_err(|error| RepositoryError::Decode(format!("encode creative_features: {error}")))?;

        let inserted = sqlx::query(
            "INSERT INTO winner_insight (
                id,
                video_id,
                winner_type,
                impressions,
                ctr,
                roas,
                spend,
                revenue,
                creative_features,
                criteria_version,
                indexed_at,
                learned
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(video_id, winner_type) DO NOTHING",
        )
        .bind(&insight.id.0)
        .bind(&insight.video_id)
        .bind(insight.winner_type.as_str())
        .bind(insight.impressions as i64)
        .bind(insight.ctr)
        .bind(insight.roas)
        .bind(insight.spend.to_string())
        .bind(insight.revenue.to_string())
        .bind(features)
        .bind(i64::from(insight.criteria_version))
        .bind(insight.indexed_at.to_rfc3339())
        .bind(i64::from(insight.learned))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn find_by_id(&self, id: &InsightId) -> Result<Option<WinnerInsight>, RepositoryError> {
        let row = sqlx::query(&select_sql("WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(insight_from_row).transpose()
    }

    async fn list_unlearned(&self, limit: u32) -> Result<Vec<WinnerInsight>, RepositoryError> {
        let rows = sqlx::query(&select_sql(
            "WHERE learned = 0 ORDER BY indexed_at ASC LIMIT ?",
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(insight_from_row).collect()
    }

    async fn count_unlearned(&self) -> Result<u64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM winner_insight WHERE learned = 0")
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");
        parse_u64("count", count)
    }

    async fn mark_learned(&self, ids: &[InsightId]) -> Result<(), RepositoryError> {
        for id in ids {
            sqlx::query("UPDATE winner_insight SET learned = 1 WHERE id = ?")
                .bind(&id.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT
            id,
            video_id,
            winner_type,
            impressions,
            ctr,
            roas,
            spend,
            revenue,
            creative_features,
            criteria_version,
            indexed_at,
            learned
         FROM winner_insight {where_clause}"
    )
}

fn insight_from_row(row: SqliteRow) -> Result<WinnerInsight, RepositoryError> {
    let winner_type_raw = row.try_get::<String, _>("winner_type")?;
    let winner_type = WinnerType::parse(&winner_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown winner type `{winner_type_raw}`"))
    })?;

    let features_raw = row.try_get::<String, _>("creative_features")?;
    let creative_features: Vec<String> = serde_json::from_str(&features_raw)
        .map_err(|error| RepositoryError::Decode(format!("decode creative_features: {error}")))?;

    Ok(WinnerInsight {
        id: InsightId(row.try_get("id")?),
        video_id: row.try_get("video_id")?,
        winner_type,
        impressions: parse_u64("impressions", row.try_get("impressions")?)?,
        ctr: row.try_get("ctr")?,
        roas: row.try_get("roas")?,
        spend: parse_decimal("spend", row.try_get("spend")?)?,
        revenue: parse_decimal("revenue", row.try_get("revenue")?)?,
        creative_features,
        criteria_version: parse_u32("criteria_version", row.try_get("criteria_version")?)?,
        indexed_at: parse_timestamp("indexed_at", row.try_get("indexed_at")?)?,
        learned: row.try_get::<i64, _>("learned")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use adloop_core::domain::winner::{InsightId, WinnerInsight, WinnerType};

    use super::SqlInsightRepository;
    use crate::migrations;
    use crate::repositories::InsightRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample(video_id: &str, winner_type: WinnerType) -> WinnerInsight {
        WinnerInsight {
            id: InsightId(Uuid::new_v4().to_string()),
            video_id: video_id.to_string(),
            winner_type,
            impressions: 1_500,
            ctr: 0.04,
            roas: 2.0,
            spend: Decimal::new(120_00, 2),
            revenue: Decimal::new(240_00, 2),
            creative_features: vec!["hook:question".to_string(), "length:short".to_string()],
            criteria_version: 1,
            indexed_at: DateTime::parse_from_rfc3339("2026-08-01T10:00:00+00:00")
                .expect("valid rfc3339")
                .with_timezone(&Utc),
            learned: false,
        }
    }

    #[tokio::test]
    async fn indexing_the_same_winner_twice_writes_one_row() {
        let pool = setup_pool().await;
        let repo = SqlInsightRepository::new(pool.clone());

        assert!(repo.insert_if_absent(sample("vid-1", WinnerType::Ctr)).await.expect("insert"));
        assert!(!repo.insert_if_absent(sample("vid-1", WinnerType::Ctr)).await.expect("insert dup"));
        assert_eq!(repo.count_unlearned().await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn same_video_may_win_on_different_metrics() {
        let pool = setup_pool().await;
        let repo = SqlInsightRepository::new(pool.clone());

        assert!(repo.insert_if_absent(sample("vid-1", WinnerType::Ctr)).await.expect("insert"));
        assert!(repo.insert_if_absent(sample("vid-1", WinnerType::Roas)).await.expect("insert"));
        assert_eq!(repo.count_unlearned().await.expect("count"), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn round_trips_creative_features() {
        let pool = setup_pool().await;
        let repo = SqlInsightRepository::new(pool.clone());
        let insight = sample("vid-1", WinnerType::Both);

        repo.insert_if_absent(insight.clone()).await.expect("insert");
        let found = repo.find_by_id(&insight.id).await.expect("find");
        assert_eq!(found, Some(insight));

        pool.close().await;
    }

    #[tokio::test]
    async fn mark_learned_removes_from_unlearned_set() {
        let pool = setup_pool().await;
        let repo = SqlInsightRepository::new(pool.clone());

        let first = sample("vid-1", WinnerType::Ctr);
        let second = sample("vid-2", WinnerType::Roas);
        repo.insert_if_absent(first.clone()).await.expect("insert");
        repo.insert_if_absent(second.clone()).await.expect("insert");

        repo.mark_learned(&[first.id.clone()]).await.expect("mark learned");

        let unlearned = repo.list_unlearned(10).await.expect("list");
        assert_eq!(unlearned.len(), 1);
        assert_eq!(unlearned[0].id, second.id);

        pool.close().await;
    }
}
