use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use adloop_core::domain::action::{Action, ActionId, ActionStatus};
use adloop_core::domain::job::{Job, JobId, JobStatus};
use adloop_core::domain::model::{ChampionRecord, EvaluationResult, ModelCandidate, ModelId};
use adloop_core::domain::model::CandidateStatus;
use adloop_core::domain::snapshot::{EntityId, PerformanceSnapshot};
use adloop_core::domain::winner::{InsightId, WinnerInsight};
use adloop_core::learning::CycleResult;
use adloop_core::safety::BudgetChange;

pub mod actions;
pub mod cycles;
pub mod insights;
pub mod jobs;
pub mod lease;
pub mod models;
pub mod snapshots;

pub use actions::SqlActionRepository;
pub use cycles::SqlCycleRepository;
pub use insights::SqlInsightRepository;
pub use jobs::SqlJobRepository;
pub use lease::SqlLeaseRepository;
pub use models::SqlModelRepository;
pub use snapshots::SqlSnapshotRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result of an enqueue attempt. `Duplicate` means an equivalent non-terminal
/// job already exists; the store's partial unique index makes this decision,
/// not application-side lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Insert or supersede the row for the snapshot's `(entity, window)` key.
    async fn upsert(&self, snapshot: PerformanceSnapshot) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        entity_id: &EntityId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<PerformanceSnapshot>, RepositoryError>;

    async fn latest_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<PerformanceSnapshot>, RepositoryError>;

    async fn list_observed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSnapshot>, RepositoryError>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, RepositoryError>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError>;

    /// Atomically claim the next runnable job: pending and available, or
    /// processing with a claim staler than `stale_before`. Returns `None`
    /// when nothing is runnable or another worker won the race.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    async fn save(&self, job: Job) -> Result<(), RepositoryError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, RepositoryError>;

    /// Delete terminal jobs completed before the cutoff; returns rows purged.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait InsightRepository: Send + Sync {
    /// Insert unless an insight for the same `(video, winner_type)` already
    /// exists. Returns true when a row was written.
    async fn insert_if_absent(&self, insight: WinnerInsight) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &InsightId) -> Result<Option<WinnerInsight>, RepositoryError>;

    async fn list_unlearned(&self, limit: u32) -> Result<Vec<WinnerInsight>, RepositoryError>;

    async fn count_unlearned(&self) -> Result<u64, RepositoryError>;

    async fn mark_learned(&self, ids: &[InsightId]) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn save_candidate(&self, candidate: ModelCandidate) -> Result<(), RepositoryError>;

    async fn find_candidate(
        &self,
        id: &ModelId,
    ) -> Result<Option<ModelCandidate>, RepositoryError>;

    async fn list_candidates(
        &self,
        status: CandidateStatus,
    ) -> Result<Vec<ModelCandidate>, RepositoryError>;

    async fn current_champion(&self, name: &str)
        -> Result<Option<ChampionRecord>, RepositoryError>;

    /// Compare-and-swap promotion: succeeds only against `expected_version`
    /// (0 when no champion exists yet). Returns false on a lost race.
    async fn promote(
        &self,
        name: &str,
        model_id: &ModelId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn save_evaluation(&self, result: EvaluationResult) -> Result<(), RepositoryError>;

    async fn list_evaluations_for(
        &self,
        challenger_id: &ModelId,
    ) -> Result<Vec<EvaluationResult>, RepositoryError>;
}

#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn save(&self, action: Action) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ActionId) -> Result<Option<Action>, RepositoryError>;

    async fn list_due(&self, now: DateTime<Utc>, limit: u32)
        -> Result<Vec<Action>, RepositoryError>;

    /// Exactly-once apply marker: flips pending to applied and records the
    /// platform reference, but only if the row is still pending. Returns
    /// false when the action was already finalized.
    async fn mark_applied(
        &self,
        id: &ActionId,
        applied_value: Option<Decimal>,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn applied_times_for_account(
        &self,
        account_ref: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, RepositoryError>;

    /// Applied budget changes on a campaign, oldest first, each carrying the
    /// value it moved from. The newest applied change before `since` is
    /// included so the velocity clamp can anchor its window-open reference.
    async fn budget_history_for_campaign(
        &self,
        campaign_ref: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BudgetChange>, RepositoryError>;

    async fn count_by_status(&self, status: ActionStatus) -> Result<u64, RepositoryError>;

    async fn list_recent(&self, limit: u32) -> Result<Vec<Action>, RepositoryError>;
}

#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Take or renew the named lease. Succeeds when the lease is free,
    /// expired, or already held by `holder`.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool, RepositoryError>;

    async fn release(&self, name: &str, holder: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CycleRepository: Send + Sync {
    async fn record(&self, result: CycleResult, aborted: bool) -> Result<(), RepositoryError>;

    async fn list_recent(&self, limit: u32) -> Result<Vec<StoredCycleRun>, RepositoryError>;
}

/// A persisted cycle summary as read back for the admin surface.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredCycleRun {
    pub id: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub aborted: bool,
    pub outcomes_json: String,
    pub settings_version: u64,
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u64): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    value.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value.map(|decimal| parse_decimal(column, decimal)).transpose()
}
