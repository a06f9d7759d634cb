//! Learning-cycle stages.
//!
//! Each stage is an isolated unit run by the orchestrator under its own
//! deadline. Pattern extraction consumes unlearned insights into the
//! feature ledger, compounding ranks the accumulated tallies, and the
//! retrain trigger proposes a new challenger once enough insights have
//! accumulated since the last training run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use adloop_core::domain::job::JobType;
use adloop_core::domain::model::ModelCandidate;
use adloop_core::domain::snapshot::EntityId;
use adloop_core::errors::ApplicationError;
use adloop_core::learning::StageKind;
use adloop_core::queue::QueueEngine;
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::{InsightRepository, JobRepository, ModelRepository};

/// How one stage run ended, before the orchestrator wraps it in an outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageRun {
    Processed(u64),
    Skipped(String),
}

#[async_trait::async_trait]
pub trait LearningStage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, now: DateTime<Utc>) -> Result<StageRun, ApplicationError>;
}

/// In-memory accumulation of creative-feature evidence across cycles.
/// Rebuilt from unlearned insights on restart; the durable record of what
/// was learned is the `learned` flag on each insight.
#[derive(Debug, Default)]
pub struct FeatureLedger {
    feature_counts: HashMap<String, u64>,
    insights_since_training: u64,
    ranked: Vec<(String, u64)>,
}

impl FeatureLedger {
    pub fn absorb(&mut self, features: &[String]) {
        for feature in features {
            *self.feature_counts.entry(feature.clone()).or_insert(0) += 1;
        }
        self.insights_since_training += 1;
    }

    /// Re-rank the accumulated tallies, most frequent first.
    pub fn compound(&mut self) -> usize {
        let mut ranked: Vec<(String, u64)> =
            self.feature_counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        self.ranked = ranked;
        self.ranked.len()
    }

    pub fn insights_since_training(&self) -> u64 {
        self.insights_since_training
    }

    pub fn reset_training_counter(&mut self) {
        self.insights_since_training = 0;
    }

    pub fn top_features(&self, limit: usize) -> &[(String, u64)] {
        &self.ranked[..self.ranked.len().min(limit)]
    }
}

pub type SharedLedger = Arc<Mutex<FeatureLedger>>;

const EXTRACTION_BATCH: u32 = 500;

/// Folds unlearned winner insights into the feature ledger and flips their
/// `learned` flag. Batched so a backlog cannot hold the stage past its
/// deadline forever.
pub struct PatternExtractionStage {
    insights: Arc<dyn InsightRepository>,
    ledger: SharedLedger,
}

impl PatternExtractionStage {
    pub fn new(insights: Arc<dyn InsightRepository>, ledger: SharedLedger) -> Self {
        Self { insights, ledger }
    }
}

#[async_trait::async_trait]
impl LearningStage for PatternExtractionStage {
    fn kind(&self) -> StageKind {
        StageKind::PatternExtraction
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<StageRun, ApplicationError> {
        let batch = self
            .insights
            .list_unlearned(EXTRACTION_BATCH)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if batch.is_empty() {
            return Ok(StageRun::Skipped("no unlearned insights".to_string()));
        }

        let ids: Vec<_> = batch.iter().map(|insight| insight.id.clone()).collect();
        {
            let mut ledger = self.ledger.lock().map_err(|_| {
                ApplicationError::Persistence("feature ledger lock poisoned".to_string())
            })?;
            for insight in &batch {
                ledger.absorb(&insight.creative_features);
            }
        }

        // Flag flip happens after absorption so a crash re-extracts rather
        // than losing evidence.
        self.insights
            .mark_learned(&ids)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        debug!(
            event_name = "learning.extraction.batch",
            correlation_id = "learning_cycle",
            extracted = batch.len(),
            "insight batch folded into feature ledger"
        );
        Ok(StageRun::Processed(batch.len() as u64))
    }
}

/// Ranks the ledger's raw tallies so downstream consumers read a stable
/// most-frequent-first view.
pub struct InsightCompoundingStage {
    ledger: SharedLedger,
}

impl InsightCompoundingStage {
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl LearningStage for InsightCompoundingStage {
    fn kind(&self) -> StageKind {
        StageKind::InsightCompounding
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<StageRun, ApplicationError> {
        let mut ledger = self.ledger.lock().map_err(|_| {
            ApplicationError::Persistence("feature ledger lock poisoned".to_string())
        })?;
        let distinct = ledger.compound();
        if distinct == 0 {
            return Ok(StageRun::Skipped("feature ledger is empty".to_string()));
        }

        for (feature, count) in ledger.top_features(5) {
            debug!(
                event_name = "learning.compounding.feature",
                correlation_id = "learning_cycle",
                feature = %feature,
                occurrences = count,
                "top compounded feature"
            );
        }
        Ok(StageRun::Processed(distinct as u64))
    }
}

/// Training runs outside this service; the stage hands it a sample count
/// and persists whatever candidate it reports back.
#[async_trait::async_trait]
pub trait ModelTrainer: Send + Sync {
    async fn train(
        &self,
        sample_count: u64,
        now: DateTime<Utc>,
    ) -> Result<ModelCandidate, ApplicationError>;
}

/// Proposes retraining once enough new insights have accumulated, then
/// enqueues the evaluation of the freshly trained challenger.
pub struct RetrainTriggerStage {
    ledger: SharedLedger,
    trainer: Arc<dyn ModelTrainer>,
    models: Arc<dyn ModelRepository>,
    jobs: Arc<dyn JobRepository>,
    queue: QueueEngine,
    settings: SettingsHandle,
}

impl RetrainTriggerStage {
    pub fn new(
        ledger: SharedLedger,
        trainer: Arc<dyn ModelTrainer>,
        models: Arc<dyn ModelRepository>,
        jobs: Arc<dyn JobRepository>,
        queue: QueueEngine,
        settings: SettingsHandle,
    ) -> Self {
        Self { ledger, trainer, models, jobs, queue, settings }
    }
}

#[async_trait::async_trait]
impl LearningStage for RetrainTriggerStage {
    fn kind(&self) -> StageKind {
        StageKind::RetrainTrigger
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<StageRun, ApplicationError> {
        let settings = self.settings.current();
        let threshold = settings.cycle.min_new_insights_for_retrain;

        let accumulated = {
            let ledger = self.ledger.lock().map_err(|_| {
                ApplicationError::Persistence("feature ledger lock poisoned".to_string())
            })?;
            ledger.insights_since_training()
        };
        if accumulated < threshold {
            return Ok(StageRun::Skipped(format!(
                "{accumulated} new insights, retrain threshold is {threshold}"
            )));
        }

        let candidate = self.trainer.train(accumulated, now).await?;
        let model_id = candidate.model_id.clone();
        self.models
            .save_candidate(candidate)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let payload = serde_json::json!({ "model_id": model_id.0 }).to_string();
        let job = self.queue.create(
            JobType::EvaluateChallenger,
            EntityId(model_id.0.clone()),
            payload,
            settings.winner.version,
            now,
        );
        self.jobs
            .enqueue(job)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        {
            let mut ledger = self.ledger.lock().map_err(|_| {
                ApplicationError::Persistence("feature ledger lock poisoned".to_string())
            })?;
            ledger.reset_training_counter();
        }

        info!(
            event_name = "learning.retrain.proposed",
            correlation_id = %model_id,
            training_samples = accumulated,
            "challenger trained and queued for evaluation"
        );
        Ok(StageRun::Processed(accumulated))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use adloop_core::domain::job::JobStatus;
    use adloop_core::domain::winner::{InsightId, WinnerInsight, WinnerType};
    use adloop_core::queue::{QueueConfig, QueueEngine};
    use adloop_core::settings::{RuntimeSettings, SettingsHandle};
    use adloop_db::repositories::{
        InsightRepository, JobRepository, SqlInsightRepository, SqlJobRepository,
        SqlModelRepository,
    };
    use adloop_db::{connect_with_settings, migrations, DbPool};

    use super::testing::StubTrainer;
    use super::{
        FeatureLedger, InsightCompoundingStage, LearningStage, PatternExtractionStage,
        RetrainTriggerStage, SharedLedger, StageRun,
    };

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

    fn insight(video: &str, features: &[&str], now: DateTime<Utc>) -> WinnerInsight {
        WinnerInsight {
            id: InsightId(Uuid::new_v4().to_string()),
            video_id: video.to_string(),
            winner_type: WinnerType::Ctr,
            impressions: 2_000,
            ctr: 0.05,
            roas: 1.8,
            spend: Decimal::new(80_00, 2),
            revenue: Decimal::new(144_00, 2),
            creative_features: features.iter().map(|f| f.to_string()).collect(),
            criteria_version: 1,
            indexed_at: now,
            learned: false,
        }
    }

    fn ledger() -> SharedLedger {
        Arc::new(Mutex::new(FeatureLedger::default()))
    }

    #[tokio::test]
    async fn extraction_consumes_unlearned_insights_into_the_ledger() {
        let pool = setup_pool().await;
        let now = ts("2026-08-01T10:00:00+00:00");
        let insights = SqlInsightRepository::new(pool.clone());
        for video in ["vid-1", "vid-2"] {
            assert!(insights
                .insert_if_absent(insight(video, &["hook_fast", "caption_bold"], now))
                .await
                .expect("insert"));
        }

        let shared = ledger();
        let stage =
            PatternExtractionStage::new(Arc::new(SqlInsightRepository::new(pool.clone())), shared.clone());

        let run = stage.run(now).await.expect("run");
        assert_eq!(run, StageRun::Processed(2));
        assert_eq!(insights.count_unlearned().await.expect("count"), 0);
        assert_eq!(shared.lock().expect("lock").insights_since_training(), 2);

        // A second pass finds nothing left to extract.
        let rerun = stage.run(now).await.expect("rerun");
        assert!(matches!(rerun, StageRun::Skipped(_)));

        pool.close().await;
    }

    #[tokio::test]
    async fn compounding_ranks_features_by_frequency() {
        let now = ts("2026-08-01T10:00:00+00:00");
        let shared = ledger();
        {
            let mut guard = shared.lock().expect("lock");
            guard.absorb(&["hook_fast".to_string(), "caption_bold".to_string()]);
            guard.absorb(&["hook_fast".to_string()]);
        }

        let stage = InsightCompoundingStage::new(shared.clone());
        let run = stage.run(now).await.expect("run");
        assert_eq!(run, StageRun::Processed(2));

        let guard = shared.lock().expect("lock");
        assert_eq!(guard.top_features(1), &[("hook_fast".to_string(), 2)]);
    }

    #[tokio::test]
    async fn compounding_skips_an_empty_ledger() {
        let stage = InsightCompoundingStage::new(ledger());
        let run = stage.run(ts("2026-08-01T10:00:00+00:00")).await.expect("run");
        assert!(matches!(run, StageRun::Skipped(_)));
    }

    #[tokio::test]
    async fn retrain_waits_for_the_insight_threshold() {
        let pool = setup_pool().await;
        let now = ts("2026-08-01T10:00:00+00:00");
        let mut settings = RuntimeSettings::default();
        settings.cycle.min_new_insights_for_retrain = 5;

        let shared = ledger();
        {
            let mut guard = shared.lock().expect("lock");
            for _ in 0..4 {
                guard.absorb(&["hook_fast".to_string()]);
            }
        }

        let stage = RetrainTriggerStage::new(
            shared.clone(),
            Arc::new(StubTrainer),
            Arc::new(SqlModelRepository::new(pool.clone())),
            Arc::new(SqlJobRepository::new(pool.clone())),
            QueueEngine::new(QueueConfig::default()),
            SettingsHandle::from_settings(settings),
        );

        let run = stage.run(now).await.expect("run");
        assert!(matches!(run, StageRun::Skipped(_)));

        let jobs = SqlJobRepository::new(pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.expect("count"), 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn retrain_over_threshold_saves_a_candidate_and_enqueues_evaluation() {
        let pool = setup_pool().await;
        let now = ts("2026-08-01T10:00:00+00:00");
        let mut settings = RuntimeSettings::default();
        settings.cycle.min_new_insights_for_retrain = 3;

        let shared = ledger();
        {
            let mut guard = shared.lock().expect("lock");
            for _ in 0..3 {
                guard.absorb(&["hook_fast".to_string()]);
            }
        }

        let stage = RetrainTriggerStage::new(
            shared.clone(),
            Arc::new(StubTrainer),
            Arc::new(SqlModelRepository::new(pool.clone())),
            Arc::new(SqlJobRepository::new(pool.clone())),
            QueueEngine::new(QueueConfig::default()),
            SettingsHandle::from_settings(settings),
        );

        let run = stage.run(now).await.expect("run");
        assert_eq!(run, StageRun::Processed(3));

        let jobs = SqlJobRepository::new(pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.expect("count"), 1);
        assert_eq!(shared.lock().expect("lock").insights_since_training(), 0);

        pool.close().await;
    }
}
