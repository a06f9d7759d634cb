use chrono::{DateTime, Duration, Utc};

use super::{LeaseRepository, RepositoryError};
use crate::DbPool;

/// Named single-holder leases. The learning orchestrator takes the
/// `learning_cycle` lease so overlapping schedulers (or a second process)
/// never run concurrent cycles.
pub struct SqlLeaseRepository {
    pool: DbPool,
}

impl SqlLeaseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LeaseRepository for SqlLeaseRepository {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool, RepositoryError> {
        let expires_at = now + Duration::seconds(ttl_secs);

        let acquired = sqlx::query(
            "UPDATE worker_lease
             SET holder = ?, expires_at = ?
             WHERE name = ?
               AND (holder IS NULL OR holder = ? OR expires_at < ?)",
        )
        .bind(holder)
        .bind(expires_at.to_rfc3339())
        .bind(name)
        .bind(holder)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(acquired == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE worker_lease
             SET holder = NULL, expires_at = NULL
             WHERE name = ? AND holder = ?",
        )
        .bind(name)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::SqlLeaseRepository;
    use crate::migrations;
    use crate::repositories::LeaseRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    #[tokio::test]
    async fn second_holder_cannot_take_a_live_lease() {
        let pool = setup_pool().await;
        let repo = SqlLeaseRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        assert!(repo.try_acquire("learning_cycle", "proc-a", now, 600).await.expect("acquire"));
        assert!(!repo
            .try_acquire("learning_cycle", "proc-b", now + Duration::seconds(60), 600)
            .await
            .expect("contended acquire"));

        pool.close().await;
    }

    #[tokio::test]
    async fn holder_can_renew_its_own_lease() {
        let pool = setup_pool().await;
        let repo = SqlLeaseRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        assert!(repo.try_acquire("learning_cycle", "proc-a", now, 600).await.expect("acquire"));
        assert!(repo
            .try_acquire("learning_cycle", "proc-a", now + Duration::seconds(300), 600)
            .await
            .expect("renew"));

        pool.close().await;
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_by_a_new_holder() {
        let pool = setup_pool().await;
        let repo = SqlLeaseRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        assert!(repo.try_acquire("learning_cycle", "proc-a", now, 600).await.expect("acquire"));
        let later = now + Duration::seconds(700);
        assert!(repo.try_acquire("learning_cycle", "proc-b", later, 600).await.expect("takeover"));

        pool.close().await;
    }

    #[tokio::test]
    async fn release_frees_the_lease_only_for_its_holder() {
        let pool = setup_pool().await;
        let repo = SqlLeaseRepository::new(pool.clone());
        let now = ts("2026-08-01T10:00:00+00:00");

        assert!(repo.try_acquire("learning_cycle", "proc-a", now, 600).await.expect("acquire"));

        // A stranger's release is a no-op.
        repo.release("learning_cycle", "proc-b").await.expect("foreign release");
        assert!(!repo
            .try_acquire("learning_cycle", "proc-b", now, 600)
            .await
            .expect("still held"));

        repo.release("learning_cycle", "proc-a").await.expect("release");
        assert!(repo.try_acquire("learning_cycle", "proc-b", now, 600).await.expect("acquire"));

        pool.close().await;
    }
}
