//! Safety constraints for live-campaign actions.
//!
//! Three independent gates, all pure over their inputs so the executor loop
//! stays testable: per-account rate limits (excess work is deferred, never
//! dropped), budget velocity caps over a rolling window, and randomized
//! timing/value perturbation to avoid mechanical, detectable patterns.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub max_actions_per_hour: u32,
    pub max_actions_per_day: u32,
    /// Maximum budget drift within the velocity window, as a fraction
    /// (0.25 = 25%).
    pub max_change_pct: f64,
    pub velocity_window_hours: i64,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    /// Fuzzy-budget variance as a fraction of the approved value.
    pub fuzzy_budget_variance_pct: f64,
    pub max_apply_attempts: u32,
    pub poll_interval_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_actions_per_hour: 15,
            max_actions_per_day: 100,
            max_change_pct: 0.25,
            velocity_window_hours: 24,
            jitter_min_secs: 30,
            jitter_max_secs: 300,
            fuzzy_budget_variance_pct: 0.03,
            max_apply_attempts: 5,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Over the hourly or daily cap: the action stays pending and becomes
    /// eligible again at `until`.
    Defer { until: DateTime<Utc> },
}

/// Rate-limit check against the timestamps of actions already applied for
/// the same account.
pub fn rate_limit(
    applied_at: &[DateTime<Utc>],
    now: DateTime<Utc>,
    config: &SafetyConfig,
) -> RateDecision {
    let hour_ago = now - Duration::hours(1);
    let day_ago = now - Duration::days(1);

    let mut in_hour: Vec<DateTime<Utc>> =
        applied_at.iter().copied().filter(|at| *at > hour_ago).collect();
    let mut in_day: Vec<DateTime<Utc>> =
        applied_at.iter().copied().filter(|at| *at > day_ago).collect();

    if in_day.len() >= config.max_actions_per_day as usize {
        in_day.sort();
        let oldest = in_day[in_day.len() - config.max_actions_per_day as usize];
        return RateDecision::Defer { until: oldest + Duration::days(1) };
    }

    if in_hour.len() >= config.max_actions_per_hour as usize {
        in_hour.sort();
        let oldest = in_hour[in_hour.len() - config.max_actions_per_hour as usize];
        return RateDecision::Defer { until: oldest + Duration::hours(1) };
    }

    RateDecision::Allow
}

/// One applied budget change: when it landed, the value it moved from, and
/// the value it landed on. `from` of the oldest recorded change equals its
/// own `to` when nothing earlier is known.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetChange {
    pub at: DateTime<Utc>,
    pub from: Decimal,
    pub to: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VelocityOutcome {
    Approved { value: Decimal },
    Clamped { value: Decimal, reference: Decimal },
    Rejected { reason: String },
}

impl VelocityOutcome {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Self::Approved { value } | Self::Clamped { value, .. } => Some(*value),
            Self::Rejected { .. } => None,
        }
    }
}

/// Clamp a requested budget so the cumulative change within the rolling
/// velocity window never exceeds `max_change_pct` of the window-reference
/// value. `history` holds the prior budget changes on the same campaign;
/// `current` is the value in effect now.
pub fn clamp_budget(
    requested: Decimal,
    current: Decimal,
    history: &[BudgetChange],
    now: DateTime<Utc>,
    config: &SafetyConfig,
) -> VelocityOutcome {
    if requested <= Decimal::ZERO {
        return VelocityOutcome::Rejected {
            reason: format!("budget must be positive, got {requested}"),
        };
    }

    let window_start = now - Duration::hours(config.velocity_window_hours);

    // Reference value: the budget in effect when the window opened. That is
    // the landing value of the newest change at or before the window start,
    // otherwise the starting value of the earliest change inside the window
    // (not its result, or back-to-back changes would compound past the cap),
    // otherwise the current value.
    let mut sorted: Vec<&BudgetChange> = history.iter().collect();
    sorted.sort_by_key(|change| change.at);

    let before_window =
        sorted.iter().rev().find(|change| change.at <= window_start).map(|change| change.to);
    let at_window_open =
        sorted.iter().find(|change| change.at > window_start).map(|change| change.from);
    let reference = before_window.or(at_window_open).unwrap_or(current);

    if reference <= Decimal::ZERO {
        return VelocityOutcome::Rejected {
            reason: format!("velocity reference is non-positive ({reference})"),
        };
    }

    let max_pct = Decimal::from_f64(config.max_change_pct).unwrap_or(Decimal::ZERO);
    let lower = (reference * (Decimal::ONE - max_pct)).round_dp(2);
    let upper = (reference * (Decimal::ONE + max_pct)).round_dp(2);

    if requested < lower {
        VelocityOutcome::Clamped { value: lower, reference }
    } else if requested > upper {
        VelocityOutcome::Clamped { value: upper, reference }
    } else {
        VelocityOutcome::Approved { value: requested }
    }
}

/// Random execution delay in `[jitter_min, jitter_max]`.
pub fn jitter_delay<R: Rng>(rng: &mut R, config: &SafetyConfig) -> StdDuration {
    let min = config.jitter_min_secs.min(config.jitter_max_secs);
    let max = config.jitter_max_secs.max(config.jitter_min_secs);
    StdDuration::from_secs(rng.gen_range(min..=max))
}

/// Perturb an approved budget by up to `fuzzy_budget_variance_pct` in either
/// direction, rounded to cents.
pub fn fuzz_budget<R: Rng>(rng: &mut R, value: Decimal, config: &SafetyConfig) -> Decimal {
    let variance = config.fuzzy_budget_variance_pct.abs();
    if variance == 0.0 {
        return value;
    }
    let factor = 1.0 + rng.gen_range(-variance..=variance);
    let factor = Decimal::from_f64(factor).unwrap_or(Decimal::ONE);
    (value * factor).round_dp(2)
}
