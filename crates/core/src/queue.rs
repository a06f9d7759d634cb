//! Deterministic job lifecycle engine.
//!
//! Pure transition logic for the durable job queue: the repository persists
//! whatever state this engine produces, so every transition is replayable
//! and auditable. Delivery is at-least-once; the store's partial unique
//! index keeps enqueues idempotent per dedup key.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::job::{Job, JobId, JobStatus, JobType};
use crate::domain::snapshot::EntityId;
use crate::errors::ErrorClass;

#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// How long a processing claim may go silent before it can be stolen.
    pub claim_timeout_secs: i64,
    pub default_max_retries: u32,
    pub retry_base_delay_secs: i64,
    pub retry_backoff_multiplier: u32,
    /// Terminal jobs older than this are purged by the retention sweep.
    pub retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: 300,
            default_max_retries: 3,
            retry_base_delay_secs: 5,
            retry_backoff_multiplier: 2,
            retention_days: 14,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job {0:?} already claimed by {1}")]
    AlreadyClaimed(JobId, String),
    #[error("job {0:?} not yet available")]
    NotYetAvailable(JobId),
}

#[derive(Clone, Debug)]
pub struct QueueEngine {
    config: QueueConfig,
}

impl QueueEngine {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn create(
        &self,
        job_type: JobType,
        entity_id: EntityId,
        payload_json: impl Into<String>,
        criteria_version: u32,
        now: DateTime<Utc>,
    ) -> Job {
        Job {
            id: JobId(Uuid::new_v4().to_string()),
            job_type,
            entity_id,
            payload_json: payload_json.into(),
            criteria_version,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            available_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            error_class: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// pending -> processing. A processing job whose claim has gone stale for
    /// longer than the claim timeout may be re-claimed by another worker.
    pub fn claim(
        &self,
        mut job: Job,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        match job.status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                let stale_before = now - Duration::seconds(self.config.claim_timeout_secs);
                let stale = job.claimed_at.is_some_and(|claimed_at| claimed_at < stale_before);
                if !stale {
                    return Err(QueueError::AlreadyClaimed(
                        job.id.clone(),
                        job.claimed_by.clone().unwrap_or_default(),
                    ));
                }
            }
            status => {
                return Err(QueueError::InvalidTransition {
                    from: status,
                    to: JobStatus::Processing,
                });
            }
        }

        if now < job.available_at {
            return Err(QueueError::NotYetAvailable(job.id.clone()));
        }

        job.status = JobStatus::Processing;
        job.claimed_by = Some(worker_id.into());
        job.claimed_at = Some(now);
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        Ok(job)
    }

    /// processing -> completed.
    pub fn complete(&self, mut job: Job, now: DateTime<Utc>) -> Result<Job, QueueError> {
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.claimed_by = None;
        job.claimed_at = None;
        Ok(job)
    }

    /// processing -> pending (with exponential backoff) while retry budget
    /// remains and the failure is retryable; otherwise terminal failed.
    pub fn fail(
        &self,
        mut job: Job,
        error: impl Into<String>,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition { from: job.status, to: JobStatus::Failed });
        }

        job.last_error = Some(error.into());
        job.error_class = Some(class);
        job.claimed_by = None;
        job.claimed_at = None;

        let retryable = class.is_retryable() && job.retry_count < job.max_retries;
        if retryable {
            let backoff = self.config.retry_base_delay_secs
                * i64::from(self.config.retry_backoff_multiplier.pow(job.retry_count));
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            job.available_at = now + Duration::seconds(backoff);
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
        }
        Ok(job)
    }

    /// Cutoff before which terminal jobs are eligible for the retention purge.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.retention_days)
    }

    /// Processing jobs whose claim predates the claim timeout.
    pub fn stale_claims(&self, jobs: Vec<Job>, now: DateTime<Utc>) -> Vec<Job> {
        let stale_before = now - Duration::seconds(self.config.claim_timeout_secs);
        jobs.into_iter()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.claimed_at.is_some_and(|claimed_at| claimed_at < stale_before)
            })
            .collect()
    }
}

impl Default for QueueEngine {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{QueueConfig, QueueEngine, QueueError};
    use crate::domain::job::{JobStatus, JobType};
    use crate::domain::snapshot::EntityId;
    use crate::errors::ErrorClass;

    fn engine() -> QueueEngine {
        QueueEngine::new(QueueConfig {
            claim_timeout_secs: 300,
            default_max_retries: 2,
            retry_base_delay_secs: 10,
            retry_backoff_multiplier: 2,
            retention_days: 14,
        })
    }

    fn entity() -> EntityId {
        EntityId("vid-7".to_string())
    }

    #[test]
    fn create_starts_pending_and_immediately_available() {
        let now = Utc::now();
        let job = engine().create(JobType::IndexWinner, entity(), "{}", 1, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.available_at, now);
        assert_eq!(job.max_retries, 2);
    }

    #[test]
    fn claim_transitions_to_processing_and_records_worker() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));
        assert_eq!(claimed.started_at, Some(now));
    }

    #[test]
    fn fresh_claim_cannot_be_stolen() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let result = engine.claim(claimed, "worker-2", now + Duration::seconds(60));
        assert!(matches!(result, Err(QueueError::AlreadyClaimed(_, _))));
    }

    #[test]
    fn stale_claim_is_stealable() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let later = now + Duration::seconds(400);
        let stolen = engine.claim(claimed, "worker-2", later).expect("steal stale claim");
        assert_eq!(stolen.claimed_by.as_deref(), Some("worker-2"));
    }

    #[test]
    fn transient_failure_backs_off_exponentially_then_goes_terminal() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);

        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let failed1 = engine.fail(claimed, "timeout", ErrorClass::Transient, now).expect("fail");
        assert_eq!(failed1.status, JobStatus::Pending);
        assert_eq!(failed1.retry_count, 1);
        assert_eq!(failed1.available_at, now + Duration::seconds(10));

        let t1 = failed1.available_at;
        let claimed = engine.claim(failed1, "worker-1", t1).expect("re-claim");
        let failed2 = engine.fail(claimed, "timeout", ErrorClass::Transient, t1).expect("fail");
        assert_eq!(failed2.retry_count, 2);
        assert_eq!(failed2.available_at, t1 + Duration::seconds(20));

        let t2 = failed2.available_at;
        let claimed = engine.claim(failed2, "worker-1", t2).expect("re-claim");
        let failed3 = engine.fail(claimed, "timeout", ErrorClass::Transient, t2).expect("fail");
        assert_eq!(failed3.status, JobStatus::Failed);
        assert_eq!(failed3.completed_at, Some(t2));
    }

    #[test]
    fn validation_failure_is_terminal_without_retry() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let failed =
            engine.fail(claimed, "bad payload", ErrorClass::Validation, now).expect("fail");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.error_class, Some(ErrorClass::Validation));
    }

    #[test]
    fn backed_off_job_is_not_claimable_early() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let failed = engine.fail(claimed, "timeout", ErrorClass::Transient, now).expect("fail");
        let result = engine.claim(failed, "worker-2", now + Duration::seconds(1));
        assert!(matches!(result, Err(QueueError::NotYetAvailable(_))));
    }

    #[test]
    fn terminal_job_cannot_be_claimed_or_completed() {
        let now = Utc::now();
        let engine = engine();
        let job = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let claimed = engine.claim(job, "worker-1", now).expect("claim");
        let completed = engine.complete(claimed, now).expect("complete");
        assert_eq!(completed.status, JobStatus::Completed);

        assert!(engine.claim(completed.clone(), "worker-2", now).is_err());
        assert!(engine.complete(completed, now).is_err());
    }

    #[test]
    fn stale_claims_ignores_fresh_and_pending_jobs() {
        let now = Utc::now();
        let engine = engine();

        let pending = engine.create(JobType::IndexWinner, entity(), "{}", 1, now);
        let fresh = engine
            .claim(
                engine.create(JobType::IndexWinner, EntityId("vid-8".to_string()), "{}", 1, now),
                "worker-1",
                now,
            )
            .expect("claim fresh");
        let mut stale = engine
            .claim(
                engine.create(JobType::IndexWinner, EntityId("vid-9".to_string()), "{}", 1, now),
                "worker-2",
                now,
            )
            .expect("claim stale");
        stale.claimed_at = Some(now - Duration::seconds(400));

        let found = engine.stale_claims(vec![pending, fresh, stale.clone()], now);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }
}
