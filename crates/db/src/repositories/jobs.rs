use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::domain::job::{Job, JobId, JobStatus, JobType};
use adloop_core::domain::snapshot::EntityId;
use adloop_core::errors::ErrorClass;

use super::{
    parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64, EnqueueOutcome, JobRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlJobRepository {
    pool: DbPool,
}

impl SqlJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobRepository for SqlJobRepository {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO job (
                id,
                job_type,
                entity_id,
                payload_json,
                criteria_version,
                status,
                retry_count,
                max_retries,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                error_class,
                created_at,
                started_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(job.job_type.as_str())
        .bind(&job.entity_id.0)
        .bind(&job.payload_json)
        .bind(i64::from(job.criteria_version))
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(job.available_at.to_rfc3339())
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(job.error_class.map(|class| class.as_str()))
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|value| value.to_rfc3339()))
        .bind(job.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(EnqueueOutcome::Enqueued),
            // The partial unique index over active jobs is the dedup
            // authority; a violation means equivalent work is in flight.
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                Ok(EnqueueOutcome::Duplicate)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&select_sql("WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let candidate = sqlx::query(
            "SELECT id FROM job
             WHERE (status = 'pending' AND available_at <= ?)
                OR (status = 'processing' AND claimed_at < ?)
             ORDER BY available_at ASC, created_at ASC
             LIMIT 1",
        )
        .bind(now.to_rfc3339())
        .bind(stale_before.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let id: String = row.try_get("id")?;

        // The predicate is re-checked inside the UPDATE, so a concurrent
        // claimer racing on the same candidate loses cleanly.
        let updated = sqlx::query(
            "UPDATE job
             SET status = 'processing',
                 claimed_by = ?,
                 claimed_at = ?,
                 started_at = COALESCE(started_at, ?)
             WHERE id = ?
               AND ((status = 'pending' AND available_at <= ?)
                 OR (status = 'processing' AND claimed_at < ?))",
        )
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&id)
        .bind(now.to_rfc3339())
        .bind(stale_before.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        self.find_by_id(&JobId(id)).await
    }

    async fn save(&self, job: Job) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE job
             SET status = ?,
                 retry_count = ?,
                 available_at = ?,
                 claimed_by = ?,
                 claimed_at = ?,
                 last_error = ?,
                 error_class = ?,
                 started_at = ?,
                 completed_at = ?
             WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(job.available_at.to_rfc3339())
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(job.error_class.map(|class| class.as_str()))
        .bind(job.started_at.map(|value| value.to_rfc3339()))
        .bind(job.completed_at.map(|value| value.to_rfc3339()))
        .bind(&job.id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM job WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");
        parse_u64("count", count)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let purged = sqlx::query(
            "DELETE FROM job
             WHERE status IN ('completed', 'failed') AND completed_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(purged)
    }
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT
            id,
            job_type,
            entity_id,
            payload_json,
            criteria_version,
            status,
            retry_count,
            max_retries,
            available_at,
            claimed_by,
            claimed_at,
            last_error,
            error_class,
            created_at,
            started_at,
            completed_at
         FROM job {where_clause}"
    )
}

fn job_from_row(row: SqliteRow) -> Result<Job, RepositoryError> {
    let job_type_raw = row.try_get::<String, _>("job_type")?;
    let job_type = JobType::parse(&job_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job type `{job_type_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;

    let error_class = row
        .try_get::<Option<String>, _>("error_class")?
        .map(|value| {
            ErrorClass::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown error class `{value}`")))
        })
        .transpose()?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        job_type,
        entity_id: EntityId(row.try_get("entity_id")?),
        payload_json: row.try_get("payload_json")?,
        criteria_version: parse_u32("criteria_version", row.try_get("criteria_version")?)?,
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        last_error: row.try_get("last_error")?,
        error_class,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use adloop_core::domain::job::{JobStatus, JobType};
    use adloop_core::domain::snapshot::EntityId;
    use adloop_core::queue::{QueueConfig, QueueEngine};

    use super::SqlJobRepository;
    use crate::migrations;
    use crate::repositories::{EnqueueOutcome, JobRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn engine() -> QueueEngine {
        QueueEngine::new(QueueConfig::default())
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    #[tokio::test]
    async fn double_enqueue_for_same_entity_yields_one_active_job() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        let first =
            engine().create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 1, now);
        let second =
            engine().create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 1, now);

        assert_eq!(repo.enqueue(first).await.expect("enqueue"), EnqueueOutcome::Enqueued);
        assert_eq!(repo.enqueue(second).await.expect("enqueue dup"), EnqueueOutcome::Duplicate);
        assert_eq!(repo.count_by_status(JobStatus::Pending).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn different_job_types_for_same_entity_are_not_duplicates() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        let index =
            engine().create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 1, now);
        let evaluate = engine().create(
            JobType::EvaluateChallenger,
            EntityId("vid-1".to_string()),
            "{}",
            1,
            now,
        );

        assert_eq!(repo.enqueue(index).await.expect("enqueue"), EnqueueOutcome::Enqueued);
        assert_eq!(repo.enqueue(evaluate).await.expect("enqueue"), EnqueueOutcome::Enqueued);

        pool.close().await;
    }

    #[tokio::test]
    async fn terminal_job_does_not_block_re_enqueue() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let engine = engine();
        let now = ts("2026-08-01T10:00:00+00:00");

        let job = engine.create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 1, now);
        repo.enqueue(job).await.expect("enqueue");

        let claimed = repo
            .claim_next("worker-1", now, now - Duration::seconds(300))
            .await
            .expect("claim")
            .expect("job available");
        let completed = engine.complete(claimed, now).expect("complete");
        repo.save(completed).await.expect("save");

        let again =
            engine.create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 2, now);
        assert_eq!(repo.enqueue(again).await.expect("re-enqueue"), EnqueueOutcome::Enqueued);

        pool.close().await;
    }

    #[tokio::test]
    async fn claim_respects_availability_and_ordering() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let engine = engine();
        let now = ts("2026-08-01T10:00:00+00:00");

        let mut later = engine.create(
            JobType::IndexWinner,
            EntityId("vid-later".to_string()),
            "{}",
            1,
            now,
        );
        later.available_at = now + Duration::minutes(10);
        let earlier = engine.create(
            JobType::IndexWinner,
            EntityId("vid-earlier".to_string()),
            "{}",
            1,
            now,
        );

        repo.enqueue(later).await.expect("enqueue later");
        repo.enqueue(earlier.clone()).await.expect("enqueue earlier");

        let stale_before = now - Duration::seconds(300);
        let claimed = repo
            .claim_next("worker-1", now, stale_before)
            .await
            .expect("claim")
            .expect("one job runnable");
        assert_eq!(claimed.id, earlier.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

        // The not-yet-available job is not claimable.
        assert!(repo.claim_next("worker-1", now, stale_before).await.expect("claim").is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_claim_is_stolen_by_another_worker() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        let job = engine().create(JobType::IndexWinner, EntityId("vid-1".to_string()), "{}", 1, now);
        repo.enqueue(job).await.expect("enqueue");

        let stale_before = now - Duration::seconds(300);
        repo.claim_next("worker-1", now, stale_before).await.expect("claim").expect("claimed");

        // Within the timeout the claim holds.
        let soon = now + Duration::seconds(60);
        assert!(repo
            .claim_next("worker-2", soon, soon - Duration::seconds(300))
            .await
            .expect("claim attempt")
            .is_none());

        // Past the timeout another worker takes over.
        let later = now + Duration::seconds(400);
        let stolen = repo
            .claim_next("worker-2", later, later - Duration::seconds(300))
            .await
            .expect("steal")
            .expect("stale job stolen");
        assert_eq!(stolen.claimed_by.as_deref(), Some("worker-2"));

        pool.close().await;
    }

    #[tokio::test]
    async fn retention_purge_removes_only_old_terminal_jobs() {
        let pool = setup_pool().await;
        let repo = SqlJobRepository::new(pool.clone());
        let engine = engine();
        let now = ts("2026-08-01T10:00:00+00:00");
        let long_ago = now - Duration::days(30);

        let old = engine.create(JobType::IndexWinner, EntityId("vid-old".to_string()), "{}", 1, long_ago);
        let old_id = old.id.clone();
        repo.enqueue(old).await.expect("enqueue old");
        let claimed = repo
            .claim_next("worker-1", long_ago, long_ago - Duration::seconds(300))
            .await
            .expect("claim")
            .expect("old job");
        repo.save(engine.complete(claimed, long_ago).expect("complete")).await.expect("save");

        let fresh = engine.create(JobType::IndexWinner, EntityId("vid-new".to_string()), "{}", 1, now);
        repo.enqueue(fresh).await.expect("enqueue fresh");

        let purged = repo.purge_terminal_before(now - Duration::days(14)).await.expect("purge");
        assert_eq!(purged, 1);
        assert!(repo.find_by_id(&old_id).await.expect("lookup").is_none());
        assert_eq!(repo.count_by_status(JobStatus::Pending).await.expect("count"), 1);

        pool.close().await;
    }
}
