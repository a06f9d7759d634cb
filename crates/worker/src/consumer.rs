//! Durable-queue consumer.
//!
//! Claims jobs one at a time, dispatches by type, and records the outcome
//! through the lifecycle engine so retries, backoff, and terminal failures
//! all follow the same rules regardless of job type. Also owns the
//! retention sweep that purges old terminal jobs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adloop_core::detector::WinnerVerdict;
use adloop_core::domain::job::{Job, JobType};
use adloop_core::domain::model::ModelId;
use adloop_core::domain::snapshot::PerformanceSnapshot;
use adloop_core::domain::winner::{InsightId, WinnerInsight};
use adloop_core::errors::{ApplicationError, DomainError};
use adloop_core::queue::QueueEngine;
use adloop_db::repositories::{InsightRepository, JobRepository, SnapshotRepository};

use crate::evaluator::{ChallengerEvaluator, EvaluationOutcome};

pub struct JobConsumer {
    jobs: Arc<dyn JobRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    insights: Arc<dyn InsightRepository>,
    evaluator: Arc<ChallengerEvaluator>,
    queue: QueueEngine,
    worker_id: String,
}

impl JobConsumer {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        snapshots: Arc<dyn SnapshotRepository>,
        insights: Arc<dyn InsightRepository>,
        evaluator: Arc<ChallengerEvaluator>,
        queue: QueueEngine,
        worker_id: impl Into<String>,
    ) -> Self {
        Self { jobs, snapshots, insights, evaluator, queue, worker_id: worker_id.into() }
    }

    /// Claim and process until the queue has nothing available. Returns how
    /// many jobs were handled, completions and failures both.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<u32, ApplicationError> {
        let stale_before =
            now - Duration::seconds(self.queue.config().claim_timeout_secs);
        let mut handled = 0u32;

        while let Some(job) = self
            .jobs
            .claim_next(&self.worker_id, now, stale_before)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
        {
            self.process(job, now).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Purge terminal jobs past the retention horizon.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<u64, ApplicationError> {
        let purged = self
            .jobs
            .purge_terminal_before(self.queue.retention_cutoff(now))
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if purged > 0 {
            info!(
                event_name = "consumer.retention.purged",
                correlation_id = %self.worker_id,
                purged,
                "terminal jobs removed by the retention sweep"
            );
        }
        Ok(purged)
    }

    pub async fn run_loop(self, poll_interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        // One retention sweep roughly per hour of polling.
        let sweep_every = (3_600 / poll_interval.as_secs().max(1)).max(1);
        let mut ticks = 0u64;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(error) = self.drain(now).await {
                warn!(
                    event_name = "consumer.drain.errored",
                    correlation_id = %self.worker_id,
                    error = %error,
                    "queue drain aborted"
                );
            }
            ticks += 1;
            if ticks % sweep_every == 0 {
                if let Err(error) = self.sweep_retention(now).await {
                    warn!(
                        event_name = "consumer.retention.errored",
                        correlation_id = %self.worker_id,
                        error = %error,
                        "retention sweep failed"
                    );
                }
            }
        }
    }

    async fn process(&self, job: Job, now: DateTime<Utc>) -> Result<(), ApplicationError> {
        let job_id = job.id.clone();
        let job_type = job.job_type;

        let result = match job_type {
            JobType::IndexWinner => self.index_winner(&job, now).await,
            JobType::EvaluateChallenger => self.evaluate_challenger(&job, now).await,
        };

        let updated = match result {
            Ok(()) => {
                debug!(
                    event_name = "consumer.job.completed",
                    correlation_id = %job_id.0,
                    job_type = job_type.as_str(),
                    "job completed"
                );
                self.queue.complete(job, now)
            }
            Err(error) => {
                warn!(
                    event_name = "consumer.job.failed",
                    correlation_id = %job_id.0,
                    job_type = job_type.as_str(),
                    error = %error,
                    class = error.class().as_str(),
                    "job failed"
                );
                self.queue.fail(job, error.to_string(), error.class(), now)
            }
        }
        .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        self.jobs
            .save(updated)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))
    }

    async fn index_winner(&self, job: &Job, now: DateTime<Utc>) -> Result<(), ApplicationError> {
        let verdict: WinnerVerdict = serde_json::from_str(&job.payload_json).map_err(|error| {
            ApplicationError::Domain(DomainError::InvariantViolation(format!(
                "undecodable winner verdict payload: {error}"
            )))
        })?;

        let snapshot = self
            .snapshots
            .latest_for_entity(&job.entity_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
            .ok_or_else(|| {
                ApplicationError::Domain(DomainError::InvariantViolation(format!(
                    "no snapshot stored for winner {}",
                    job.entity_id
                )))
            })?;

        let insight = WinnerInsight {
            id: InsightId(Uuid::new_v4().to_string()),
            video_id: job.entity_id.0.clone(),
            winner_type: verdict.winner_type,
            impressions: snapshot.impressions,
            ctr: snapshot.ctr,
            roas: snapshot.roas,
            spend: snapshot.spend,
            revenue: snapshot.revenue,
            creative_features: derive_features(&snapshot),
            criteria_version: verdict.criteria_version,
            indexed_at: now,
            learned: false,
        };

        let inserted = self
            .insights
            .insert_if_absent(insight)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if inserted {
            info!(
                event_name = "consumer.insight.indexed",
                correlation_id = %job.id.0,
                video_id = %job.entity_id,
                winner_type = verdict.winner_type.as_str(),
                "winner insight indexed"
            );
        } else {
            // Redelivery after a crash between insert and completion.
            debug!(
                event_name = "consumer.insight.already_indexed",
                correlation_id = %job.id.0,
                video_id = %job.entity_id,
                "insight already present, treating as done"
            );
        }
        Ok(())
    }

    async fn evaluate_challenger(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let payload: ChallengerPayload =
            serde_json::from_str(&job.payload_json).map_err(|error| {
                ApplicationError::Domain(DomainError::InvariantViolation(format!(
                    "undecodable challenger payload: {error}"
                )))
            })?;

        let outcome = self
            .evaluator
            .evaluate_challenger(&ModelId(payload.model_id), now)
            .await?;
        match outcome {
            EvaluationOutcome::LostPromotionRace => Err(ApplicationError::Persistence(
                "champion changed during evaluation".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(serde::Deserialize)]
struct ChallengerPayload {
    model_id: String,
}

/// Coarse creative-feature tags derived from the winning snapshot. These are
/// the raw evidence the learning stages compound; finer-grained creative
/// metadata rides in from the platform feed when available.
fn derive_features(snapshot: &PerformanceSnapshot) -> Vec<String> {
    let mut features = Vec::new();
    if snapshot.ctr > 0.05 {
        features.push("ctr_over_5pct".to_string());
    } else if snapshot.ctr > 0.03 {
        features.push("ctr_over_3pct".to_string());
    }
    if snapshot.roas > 5.0 {
        features.push("roas_over_5x".to_string());
    } else if snapshot.roas > 3.0 {
        features.push("roas_over_3x".to_string());
    }
    if snapshot.impressions >= 10_000 {
        features.push("impressions_10k_plus".to_string());
    }
    if snapshot.conversions > 0 && snapshot.clicks > 0 {
        let cvr = snapshot.conversions as f64 / snapshot.clicks as f64;
        if cvr > 0.10 {
            features.push("cvr_over_10pct".to_string());
        }
    }
    features
}
