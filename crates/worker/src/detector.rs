//! Snapshot intake and winner detection.
//!
//! Bridges the ingestion feed to the durable queue: validate the snapshot,
//! persist it, evaluate it against the active criteria snapshot, and enqueue
//! indexing work for qualifiers. Detection itself is pure; everything here
//! is plumbing around it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use adloop_core::detector;
use adloop_core::domain::job::JobType;
use adloop_core::domain::snapshot::PerformanceSnapshot;
use adloop_core::errors::ApplicationError;
use adloop_core::queue::QueueEngine;
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::{EnqueueOutcome, JobRepository, SnapshotRepository};

/// What happened to one ingested snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Stored, no winner.
    Stored,
    /// Stored and indexing work enqueued.
    WinnerEnqueued,
    /// Stored; a winner, but equivalent indexing work was already in flight.
    WinnerDuplicate,
}

pub struct SnapshotIntake {
    snapshots: Arc<dyn SnapshotRepository>,
    jobs: Arc<dyn JobRepository>,
    queue: QueueEngine,
    settings: SettingsHandle,
}

impl SnapshotIntake {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        jobs: Arc<dyn JobRepository>,
        queue: QueueEngine,
        settings: SettingsHandle,
    ) -> Self {
        Self { snapshots, jobs, queue, settings }
    }

    pub async fn ingest(
        &self,
        snapshot: PerformanceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome, ApplicationError> {
        snapshot.validate()?;

        self.snapshots
            .upsert(snapshot.clone())
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        self.detect_and_enqueue(&snapshot, now).await
    }

    /// Re-run detection over snapshots observed since the watermark, for
    /// criteria changes and recovery. Returns `(evaluated, enqueued)`.
    pub async fn backfill(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64), ApplicationError> {
        let snapshots = self
            .snapshots
            .list_observed_since(since)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let mut evaluated = 0u64;
        let mut enqueued = 0u64;
        for snapshot in snapshots {
            evaluated += 1;
            if self.detect_and_enqueue(&snapshot, now).await? == IntakeOutcome::WinnerEnqueued {
                enqueued += 1;
            }
        }

        info!(
            event_name = "detector.backfill.finished",
            correlation_id = %since.to_rfc3339(),
            evaluated,
            enqueued,
            "winner detection backfill finished"
        );
        Ok((evaluated, enqueued))
    }

    async fn detect_and_enqueue(
        &self,
        snapshot: &PerformanceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome, ApplicationError> {
        let settings = self.settings.current();
        let Some(verdict) = detector::evaluate(snapshot, &settings.winner, now) else {
            return Ok(IntakeOutcome::Stored);
        };

        let payload = serde_json::to_string(&verdict)
            .map_err(|error| ApplicationError::Persistence(format!("encode verdict: {error}")))?;

        let job = self.queue.create(
            JobType::IndexWinner,
            snapshot.entity_id.clone(),
            payload,
            verdict.criteria_version,
            now,
        );
        let job_id = job.id.clone();

        match self
            .jobs
            .enqueue(job)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
        {
            EnqueueOutcome::Enqueued => {
                info!(
                    event_name = "detector.winner.enqueued",
                    correlation_id = %job_id.0,
                    entity_id = %snapshot.entity_id,
                    winner_type = verdict.winner_type.as_str(),
                    criteria_version = verdict.criteria_version,
                    "winner detected, indexing enqueued"
                );
                Ok(IntakeOutcome::WinnerEnqueued)
            }
            EnqueueOutcome::Duplicate => {
                debug!(
                    event_name = "detector.winner.duplicate",
                    correlation_id = %job_id.0,
                    entity_id = %snapshot.entity_id,
                    "indexing already in flight, enqueue skipped"
                );
                Ok(IntakeOutcome::WinnerDuplicate)
            }
        }
    }
}

/// Polls the platform report feed and pushes fresh snapshots through intake.
pub struct IngestionLoop {
    intake: Arc<SnapshotIntake>,
    platform: Arc<dyn crate::platform::PlatformClient>,
    poll_interval: std::time::Duration,
}

impl IngestionLoop {
    pub fn new(
        intake: Arc<SnapshotIntake>,
        platform: Arc<dyn crate::platform::PlatformClient>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self { intake, platform, poll_interval }
    }

    pub async fn run(self) {
        // The watermark lives in memory only. A restart re-fetches the last
        // hour of snapshots; replayed windows are absorbed by the queue's
        // fingerprint dedup, so no snapshot is lost or double-processed.
        let mut watermark = Utc::now() - chrono::Duration::hours(1);
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match self.platform.fetch_performance(watermark).await {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        if snapshot.observed_at > watermark {
                            watermark = snapshot.observed_at;
                        }
                        if let Err(error) = self.intake.ingest(snapshot, now).await {
                            warn!(
                                event_name = "detector.ingest.failed",
                                correlation_id = "ingestion",
                                error = %error,
                                "snapshot rejected during intake"
                            );
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        event_name = "detector.fetch.failed",
                        correlation_id = "ingestion",
                        error = %error,
                        "performance fetch failed, will retry next poll"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use adloop_core::domain::job::JobStatus;
    use adloop_core::domain::snapshot::{EntityId, PerformanceSnapshot};
    use adloop_core::queue::{QueueConfig, QueueEngine};
    use adloop_core::settings::{RuntimeSettings, SettingsHandle};
    use adloop_db::repositories::{JobRepository, SqlJobRepository, SqlSnapshotRepository};
    use adloop_db::{connect_with_settings, migrations, DbPool};

    use super::{IntakeOutcome, SnapshotIntake};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn intake(pool: &DbPool) -> SnapshotIntake {
        SnapshotIntake::new(
            Arc::new(SqlSnapshotRepository::new(pool.clone())),
            Arc::new(SqlJobRepository::new(pool.clone())),
            QueueEngine::new(QueueConfig::default()),
            SettingsHandle::from_settings(RuntimeSettings::default()),
        )
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn winner_snapshot(entity: &str, now: DateTime<Utc>) -> PerformanceSnapshot {
        PerformanceSnapshot {
            entity_id: EntityId(entity.to_string()),
            window_start: now - Duration::hours(24),
            window_end: now,
            impressions: 1_500,
            clicks: 60,
            conversions: 9,
            spend: Decimal::new(120_00, 2),
            revenue: Decimal::new(240_00, 2),
            ctr: 0.04,
            roas: 2.0,
            entity_created_at: now - Duration::hours(30),
            observed_at: now,
        }
    }

    #[tokio::test]
    async fn qualifying_snapshot_enqueues_indexing_work() {
        let pool = setup_pool().await;
        let intake = intake(&pool);
        let now = ts("2026-08-01T10:00:00+00:00");

        let outcome =
            intake.ingest(winner_snapshot("vid-1", now), now).await.expect("ingest");
        assert_eq!(outcome, IntakeOutcome::WinnerEnqueued);

        let jobs = SqlJobRepository::new(pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn second_qualifying_window_is_deduplicated() {
        let pool = setup_pool().await;
        let intake = intake(&pool);
        let now = ts("2026-08-01T10:00:00+00:00");

        intake.ingest(winner_snapshot("vid-1", now), now).await.expect("first");

        let mut next_window = winner_snapshot("vid-1", now + Duration::hours(1));
        next_window.window_start = now - Duration::hours(23);
        let outcome = intake.ingest(next_window, now + Duration::hours(1)).await.expect("second");
        assert_eq!(outcome, IntakeOutcome::WinnerDuplicate);

        let jobs = SqlJobRepository::new(pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn non_qualifying_snapshot_is_stored_without_work() {
        let pool = setup_pool().await;
        let intake = intake(&pool);
        let now = ts("2026-08-01T10:00:00+00:00");

        let mut quiet = winner_snapshot("vid-1", now);
        quiet.ctr = 0.01;
        quiet.roas = 1.0;
        let outcome = intake.ingest(quiet, now).await.expect("ingest");
        assert_eq!(outcome, IntakeOutcome::Stored);

        let jobs = SqlJobRepository::new(pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.expect("count"), 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn invalid_snapshot_is_rejected_before_storage() {
        let pool = setup_pool().await;
        let intake = intake(&pool);
        let now = ts("2026-08-01T10:00:00+00:00");

        let mut bad = winner_snapshot("vid-1", now);
        bad.clicks = bad.impressions + 1;
        assert!(intake.ingest(bad, now).await.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn backfill_reevaluates_stored_snapshots() {
        let pool = setup_pool().await;
        let now = ts("2026-08-01T10:00:00+00:00");

        // Ingest under strict criteria: stored, no winner.
        let mut strict = RuntimeSettings::default();
        strict.winner.ctr_threshold = 0.50;
        let strict_intake = SnapshotIntake::new(
            Arc::new(SqlSnapshotRepository::new(pool.clone())),
            Arc::new(SqlJobRepository::new(pool.clone())),
            QueueEngine::new(QueueConfig::default()),
            SettingsHandle::from_settings(strict),
        );
        let outcome =
            strict_intake.ingest(winner_snapshot("vid-1", now), now).await.expect("ingest");
        assert_eq!(outcome, IntakeOutcome::Stored);

        // Backfill under the default criteria finds the winner.
        let relaxed_intake = intake(&pool);
        let (evaluated, enqueued) =
            relaxed_intake.backfill(now - Duration::days(1), now).await.expect("backfill");
        assert_eq!(evaluated, 1);
        assert_eq!(enqueued, 1);

        pool.close().await;
    }
}
