//! Safe executor for live-campaign actions.
//!
//! Drains due actions through the safety gates in a fixed order: account
//! rate limits first (defer, never drop), then the budget velocity clamp,
//! then value fuzzing and timing jitter, and only then the platform call.
//! The action id doubles as the platform idempotency key and the database
//! apply marker is exactly-once, so redelivery cannot double-spend.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use adloop_core::domain::action::{Action, ActionKind, ActionStatus};
use adloop_core::errors::ApplicationError;
use adloop_core::safety::{self, RateDecision, VelocityOutcome};
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::ActionRepository;

use crate::platform::PlatformClient;

const EXECUTOR_BATCH: u32 = 20;

/// Tally of one pass over the due actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorPass {
    pub applied: u32,
    pub deferred: u32,
    pub clamped: u32,
    pub rejected: u32,
    pub retried: u32,
    pub failed: u32,
}

pub struct SafeExecutor {
    actions: Arc<dyn ActionRepository>,
    platform: Arc<dyn PlatformClient>,
    settings: SettingsHandle,
    rng: Mutex<StdRng>,
}

impl SafeExecutor {
    pub fn new(
        actions: Arc<dyn ActionRepository>,
        platform: Arc<dyn PlatformClient>,
        settings: SettingsHandle,
    ) -> Self {
        Self::with_rng(actions, platform, settings, StdRng::from_entropy())
    }

    pub fn with_rng(
        actions: Arc<dyn ActionRepository>,
        platform: Arc<dyn PlatformClient>,
        settings: SettingsHandle,
        rng: StdRng,
    ) -> Self {
        Self { actions, platform, settings, rng: Mutex::new(rng) }
    }

    /// One pass over everything due now.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<ExecutorPass, ApplicationError> {
        let due = self
            .actions
            .list_due(now, EXECUTOR_BATCH)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let mut pass = ExecutorPass::default();
        for action in due {
            self.execute(action, now, &mut pass).await?;
        }
        Ok(pass)
    }

    /// Current poll cadence. Read fresh every iteration so a settings reload
    /// changes the cadence without a restart.
    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settings.current().safety.poll_interval_secs)
    }

    pub async fn run_loop(self) {
        loop {
            tokio::time::sleep(self.poll_interval()).await;
            let now = Utc::now();
            match self.run_due(now).await {
                Ok(pass) if pass != ExecutorPass::default() => {
                    info!(
                        event_name = "executor.pass.finished",
                        correlation_id = "executor",
                        applied = pass.applied,
                        deferred = pass.deferred,
                        clamped = pass.clamped,
                        rejected = pass.rejected,
                        failed = pass.failed,
                        "executor pass finished"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        event_name = "executor.pass.errored",
                        correlation_id = "executor",
                        error = %error,
                        "executor pass aborted"
                    );
                }
            }
        }
    }

    async fn execute(
        &self,
        mut action: Action,
        now: DateTime<Utc>,
        pass: &mut ExecutorPass,
    ) -> Result<(), ApplicationError> {
        let settings = self.settings.current();
        let safety = &settings.safety;

        let applied_times = self
            .actions
            .applied_times_for_account(&action.account_ref, now - Duration::days(1))
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        if let RateDecision::Defer { until } = safety::rate_limit(&applied_times, now, safety) {
            // Deferral does not consume an attempt; the work is merely not
            // eligible yet.
            action.next_attempt_at = until.max(now + Duration::seconds(1));
            info!(
                event_name = "executor.action.deferred",
                correlation_id = %action.id,
                account_ref = %action.account_ref,
                until = %action.next_attempt_at.to_rfc3339(),
                "account rate limit reached, action deferred"
            );
            self.actions
                .save(action)
                .await
                .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
            pass.deferred += 1;
            return Ok(());
        }

        if action.kind == ActionKind::BudgetChange {
            match self.gate_budget(&mut action, now, pass).await? {
                BudgetGate::Proceed => {}
                BudgetGate::Rejected => return Ok(()),
            }
        }

        let delay = {
            let mut rng = self.rng.lock().map_err(|_| {
                ApplicationError::Persistence("executor rng lock poisoned".to_string())
            })?;
            safety::jitter_delay(&mut *rng, safety)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.platform.apply(&action).await {
            Ok(receipt) => {
                let marked = self
                    .actions
                    .mark_applied(&action.id, receipt.applied_value, &receipt.external_ref, now)
                    .await
                    .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
                if marked {
                    info!(
                        event_name = "executor.action.applied",
                        correlation_id = %action.id,
                        campaign_ref = %action.campaign_ref,
                        kind = action.kind.as_str(),
                        external_ref = %receipt.external_ref,
                        "action applied on the platform"
                    );
                    pass.applied += 1;
                } else {
                    warn!(
                        event_name = "executor.action.already_finalized",
                        correlation_id = %action.id,
                        "action was finalized by another executor during apply"
                    );
                }
            }
            Err(error) => self.record_failure(action, error, now, pass).await?,
        }
        Ok(())
    }

    async fn gate_budget(
        &self,
        action: &mut Action,
        now: DateTime<Utc>,
        pass: &mut ExecutorPass,
    ) -> Result<BudgetGate, ApplicationError> {
        let settings = self.settings.current();
        let safety = &settings.safety;

        let Some(requested) = action.requested_value else {
            return self.reject(action, "budget change without a requested value", pass).await;
        };

        let history = self
            .actions
            .budget_history_for_campaign(
                &action.campaign_ref,
                now - Duration::hours(safety.velocity_window_hours * 2),
            )
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        let current = history.last().map(|change| change.to).unwrap_or(requested);

        let outcome = safety::clamp_budget(requested, current, &history, now, safety);
        let approved = match outcome {
            VelocityOutcome::Approved { value } => value,
            VelocityOutcome::Clamped { value, reference } => {
                info!(
                    event_name = "executor.budget.clamped",
                    correlation_id = %action.id,
                    campaign_ref = %action.campaign_ref,
                    requested = %requested,
                    clamped_to = %value,
                    reference = %reference,
                    "budget change clamped by the velocity cap"
                );
                pass.clamped += 1;
                value
            }
            VelocityOutcome::Rejected { reason } => {
                return self.reject(action, &reason, pass).await;
            }
        };

        let fuzzed = {
            let mut rng = self.rng.lock().map_err(|_| {
                ApplicationError::Persistence("executor rng lock poisoned".to_string())
            })?;
            safety::fuzz_budget(&mut *rng, approved, safety)
        };
        action.applied_value = Some(fuzzed);
        Ok(BudgetGate::Proceed)
    }

    async fn reject(
        &self,
        action: &mut Action,
        reason: &str,
        pass: &mut ExecutorPass,
    ) -> Result<BudgetGate, ApplicationError> {
        warn!(
            event_name = "executor.action.rejected",
            correlation_id = %action.id,
            campaign_ref = %action.campaign_ref,
            reason = %reason,
            "action rejected by safety policy"
        );
        action.status = ActionStatus::Rejected;
        action.last_error = Some(reason.to_string());
        self.actions
            .save(action.clone())
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        pass.rejected += 1;
        Ok(BudgetGate::Rejected)
    }

    async fn record_failure(
        &self,
        mut action: Action,
        error: ApplicationError,
        now: DateTime<Utc>,
        pass: &mut ExecutorPass,
    ) -> Result<(), ApplicationError> {
        let settings = self.settings.current();
        action.attempt_count += 1;
        action.last_error = Some(error.to_string());

        let retryable = error.class().is_retryable()
            && action.attempt_count < action.max_attempts.min(settings.safety.max_apply_attempts);
        if retryable {
            let backoff = settings.safety.poll_interval_secs as i64
                * i64::from(2u32.saturating_pow(action.attempt_count.saturating_sub(1)));
            action.next_attempt_at = now + Duration::seconds(backoff);
            warn!(
                event_name = "executor.action.retry_scheduled",
                correlation_id = %action.id,
                attempt = action.attempt_count,
                next_attempt_at = %action.next_attempt_at.to_rfc3339(),
                error = %error,
                "platform apply failed, retry scheduled"
            );
            pass.retried += 1;
        } else {
            action.status = ActionStatus::Failed;
            warn!(
                event_name = "executor.action.failed",
                correlation_id = %action.id,
                attempt = action.attempt_count,
                error = %error,
                "platform apply failed terminally"
            );
            pass.failed += 1;
        }

        self.actions
            .save(action)
            .await
            .map_err(|persist| ApplicationError::Persistence(persist.to_string()))
    }
}

enum BudgetGate {
    Proceed,
    Rejected,
}
