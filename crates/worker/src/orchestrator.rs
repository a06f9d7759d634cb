//! Learning-cycle orchestrator.
//!
//! Runs the stage plan under a single-holder lease so only one process
//! executes a cycle at a time, bounds every stage and the whole cycle with
//! deadlines, and persists a summary whether the cycle was clean, degraded,
//! or aborted.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use adloop_core::errors::ApplicationError;
use adloop_core::learning::{CycleResult, CycleTrigger, StageOutcome, StageStatus};
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::{CycleRepository, LeaseRepository};

use crate::stages::{LearningStage, StageRun};

pub const CYCLE_LEASE: &str = "learning_cycle";

#[derive(Clone, Debug, PartialEq)]
pub enum CycleAttempt {
    Ran(CycleResult),
    /// Another holder owns the cycle lease; nothing ran.
    LeaseHeld,
}

pub struct Orchestrator {
    stages: Vec<Arc<dyn LearningStage>>,
    lease: Arc<dyn LeaseRepository>,
    cycles: Arc<dyn CycleRepository>,
    settings: SettingsHandle,
    holder: String,
}

impl Orchestrator {
    pub fn new(
        stages: Vec<Arc<dyn LearningStage>>,
        lease: Arc<dyn LeaseRepository>,
        cycles: Arc<dyn CycleRepository>,
        settings: SettingsHandle,
        holder: impl Into<String>,
    ) -> Self {
        Self { stages, lease, cycles, settings, holder: holder.into() }
    }

    pub async fn run_cycle(
        &self,
        trigger: CycleTrigger,
    ) -> Result<CycleAttempt, ApplicationError> {
        let settings = self.settings.current();
        let cycle_timeout = std::time::Duration::from_secs(settings.cycle.cycle_timeout_secs);
        let stage_timeout = std::time::Duration::from_secs(settings.cycle.stage_timeout_secs);

        let started_at = Utc::now();
        let acquired = self
            .lease
            .try_acquire(
                CYCLE_LEASE,
                &self.holder,
                started_at,
                settings.cycle.cycle_timeout_secs as i64,
            )
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        if !acquired {
            info!(
                event_name = "learning.cycle.lease_held",
                correlation_id = %self.holder,
                trigger = trigger.as_str(),
                "cycle lease held elsewhere, skipping"
            );
            return Ok(CycleAttempt::LeaseHeld);
        }

        let deadline = Instant::now() + cycle_timeout;
        let mut outcomes = Vec::with_capacity(self.stages.len());
        let mut abort_reason: Option<&'static str> = None;

        for stage in &self.stages {
            let kind = stage.kind();
            if !settings.cycle.stage_enabled(kind) {
                outcomes.push(StageOutcome::skipped(kind, "stage disabled"));
                continue;
            }
            if abort_reason.is_none() && Instant::now() >= deadline {
                abort_reason = Some("cycle deadline exceeded");
            }
            if let Some(reason) = abort_reason {
                outcomes.push(StageOutcome::skipped(kind, reason));
                continue;
            }

            let stage_started = Instant::now();
            let budget = stage_timeout.min(deadline.saturating_duration_since(stage_started));
            let run = tokio::time::timeout(budget, stage.run(Utc::now())).await;
            let duration_ms = stage_started.elapsed().as_millis() as u64;

            let outcome = match run {
                Ok(Ok(StageRun::Processed(items))) => {
                    StageOutcome::succeeded(kind, items, duration_ms)
                }
                Ok(Ok(StageRun::Skipped(reason))) => StageOutcome::skipped(kind, reason),
                Ok(Err(error)) => {
                    warn!(
                        event_name = "learning.stage.failed",
                        correlation_id = %self.holder,
                        stage = kind.as_str(),
                        error = %error,
                        "stage failed"
                    );
                    StageOutcome::failed(kind, error.to_string(), duration_ms)
                }
                Err(_) => {
                    warn!(
                        event_name = "learning.stage.timed_out",
                        correlation_id = %self.holder,
                        stage = kind.as_str(),
                        duration_ms,
                        "stage exceeded its deadline"
                    );
                    StageOutcome::timed_out(kind, duration_ms)
                }
            };
            let failed = matches!(outcome.status, StageStatus::Failed | StageStatus::TimedOut);
            outcomes.push(outcome);
            if failed && !settings.cycle.continue_on_error {
                abort_reason = Some("cycle aborted after stage failure");
            }
        }
        let aborted = abort_reason.is_some();

        let finished_at = Utc::now();
        let result = CycleResult::new(
            trigger,
            settings.version,
            started_at,
            finished_at,
            outcomes,
        );
        self.cycles
            .record(result.clone(), aborted)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        self.lease
            .release(CYCLE_LEASE, &self.holder)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        info!(
            event_name = "learning.cycle.finished",
            correlation_id = %result.cycle_id,
            trigger = trigger.as_str(),
            degraded = result.is_degraded(),
            aborted,
            succeeded_stages = result.succeeded_stages(),
            "learning cycle finished"
        );
        Ok(CycleAttempt::Ran(result))
    }

    /// Current scheduling interval. Read fresh every iteration so a settings
    /// reload changes the cadence without a restart.
    fn cycle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settings.current().cycle.interval_secs)
    }

    /// Scheduled loop with a manual trigger channel feeding the same runner.
    /// A manual trigger while a cycle is in flight waits its turn; the lease
    /// still prevents overlap across processes.
    pub async fn run_loop(self, mut manual: mpsc::Receiver<()>) {
        loop {
            let trigger = tokio::select! {
                _ = tokio::time::sleep(self.cycle_interval()) => CycleTrigger::Scheduled,
                received = manual.recv() => match received {
                    Some(()) => CycleTrigger::Manual,
                    None => return,
                },
            };

            if let Err(error) = self.run_cycle(trigger).await {
                warn!(
                    event_name = "learning.cycle.errored",
                    correlation_id = %self.holder,
                    error = %error,
                    "cycle failed before completion"
                );
            }
        }
    }
}
