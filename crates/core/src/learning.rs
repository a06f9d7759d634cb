//! Learning-cycle planning types.
//!
//! A cycle is an ordered sequence of stages run under a shared deadline. The
//! plan and its outcomes are plain data so the orchestrator loop stays thin
//! and every cycle is reconstructable from its persisted summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub interval_secs: u64,
    /// Hard ceiling for one stage; a stage past its deadline is recorded as
    /// timed out and the cycle moves on.
    pub stage_timeout_secs: u64,
    pub cycle_timeout_secs: u64,
    /// Retraining is only proposed once at least this many unlearned
    /// insights have accumulated.
    pub min_new_insights_for_retrain: u64,
    /// Per-stage kill switches; a disabled stage is recorded as skipped.
    pub pattern_extraction_enabled: bool,
    pub insight_compounding_enabled: bool,
    pub retrain_trigger_enabled: bool,
    /// When false, a failed or timed-out stage aborts the cycle and the
    /// remaining stages are skipped.
    pub continue_on_error: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            stage_timeout_secs: 300,
            cycle_timeout_secs: 1_200,
            min_new_insights_for_retrain: 50,
            pattern_extraction_enabled: true,
            insight_compounding_enabled: true,
            retrain_trigger_enabled: true,
            continue_on_error: true,
        }
    }
}

impl CycleConfig {
    pub fn stage_enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::PatternExtraction => self.pattern_extraction_enabled,
            StageKind::InsightCompounding => self.insight_compounding_enabled,
            StageKind::RetrainTrigger => self.retrain_trigger_enabled,
        }
    }
}

/// Stages in fixed priority order. Earlier stages feed later ones, so the
/// order is part of the contract, not a scheduling hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    PatternExtraction,
    InsightCompounding,
    RetrainTrigger,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternExtraction => "pattern_extraction",
            Self::InsightCompounding => "insight_compounding",
            Self::RetrainTrigger => "retrain_trigger",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::PatternExtraction => 0,
            Self::InsightCompounding => 1,
            Self::RetrainTrigger => 2,
        }
    }
}

/// All stages in execution order.
pub fn stage_plan() -> Vec<StageKind> {
    let mut stages =
        vec![StageKind::PatternExtraction, StageKind::InsightCompounding, StageKind::RetrainTrigger];
    stages.sort_by_key(StageKind::priority);
    stages
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

impl CycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub status: StageStatus,
    pub items_processed: u64,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl StageOutcome {
    pub fn succeeded(stage: StageKind, items_processed: u64, duration_ms: u64) -> Self {
        Self { stage, status: StageStatus::Succeeded, items_processed, detail: None, duration_ms }
    }

    pub fn failed(stage: StageKind, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            items_processed: 0,
            detail: Some(detail.into()),
            duration_ms,
        }
    }

    pub fn timed_out(stage: StageKind, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::TimedOut,
            items_processed: 0,
            detail: Some("stage deadline exceeded".to_string()),
            duration_ms,
        }
    }

    pub fn skipped(stage: StageKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            items_processed: 0,
            detail: Some(detail.into()),
            duration_ms: 0,
        }
    }
}

/// Summary of one complete cycle. With `continue_on_error` set, a cycle with
/// failed or timed-out stages is degraded but still a completed cycle; only
/// the whole-cycle deadline stops execution early.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: String,
    pub trigger: CycleTrigger,
    pub settings_version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<StageOutcome>,
}

impl CycleResult {
    pub fn new(
        trigger: CycleTrigger,
        settings_version: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: Vec<StageOutcome>,
    ) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            trigger,
            settings_version,
            started_at,
            finished_at,
            outcomes,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| matches!(outcome.status, StageStatus::Failed | StageStatus::TimedOut))
    }

    pub fn succeeded_stages(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.status == StageStatus::Succeeded).count()
    }
}
