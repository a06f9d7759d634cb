//! Runtime-tunable settings with versioned snapshots.
//!
//! Thresholds and policy knobs live in a TOML file that can be reloaded
//! without restart. Every successful load produces an immutable snapshot
//! with a monotonically increasing version; decision paths capture the
//! snapshot they used so the version recorded with a decision always names
//! the exact values that produced it. A failed reload keeps the previous
//! snapshot active.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::detector::WinnerCriteria;
use crate::evaluator::EvaluationConfig;
use crate::learning::CycleConfig;
use crate::safety::SafetyConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeSettings {
    /// Snapshot version, bumped on every successful (re)load.
    pub version: u64,
    pub winner: WinnerCriteria,
    pub evaluation: EvaluationConfig,
    pub safety: SafetyConfig,
    pub cycle: CycleConfig,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            version: 1,
            winner: WinnerCriteria::default(),
            evaluation: EvaluationConfig::default(),
            safety: SafetyConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not read settings file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse settings file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("settings validation failed: {0}")]
    Validation(String),
}

impl RuntimeSettings {
    /// Defaults overlaid with the file at `path`, as snapshot version 1.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        settings.apply_patch(read_patch(path)?);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_patch(&mut self, patch: SettingsPatch) {
        if let Some(winner) = patch.winner {
            if let Some(ctr_threshold) = winner.ctr_threshold {
                self.winner.ctr_threshold = ctr_threshold;
            }
            if let Some(roas_threshold) = winner.roas_threshold {
                self.winner.roas_threshold = roas_threshold;
            }
            if let Some(require_both) = winner.require_both {
                self.winner.require_both = require_both;
            }
            if let Some(min_impressions) = winner.min_impressions {
                self.winner.min_impressions = min_impressions;
            }
            if let Some(min_hours_live) = winner.min_hours_live {
                self.winner.min_hours_live = min_hours_live;
            }
        }

        if let Some(evaluation) = patch.evaluation {
            if let Some(min_improvement_pct) = evaluation.min_improvement_pct {
                self.evaluation.min_improvement_pct = min_improvement_pct;
            }
            if let Some(min_samples) = evaluation.min_samples {
                self.evaluation.min_samples = min_samples;
            }
            if let Some(confidence_level) = evaluation.confidence_level {
                self.evaluation.confidence_level = confidence_level;
            }
            if let Some(min_accuracy_delta) = evaluation.min_accuracy_delta {
                self.evaluation.min_accuracy_delta = min_accuracy_delta;
            }
            if let Some(auto_promote) = evaluation.auto_promote {
                self.evaluation.auto_promote = auto_promote;
            }
        }

        if let Some(safety) = patch.safety {
            if let Some(max_actions_per_hour) = safety.max_actions_per_hour {
                self.safety.max_actions_per_hour = max_actions_per_hour;
            }
            if let Some(max_actions_per_day) = safety.max_actions_per_day {
                self.safety.max_actions_per_day = max_actions_per_day;
            }
            if let Some(max_change_pct) = safety.max_change_pct {
                self.safety.max_change_pct = max_change_pct;
            }
            if let Some(velocity_window_hours) = safety.velocity_window_hours {
                self.safety.velocity_window_hours = velocity_window_hours;
            }
            if let Some(jitter_min_secs) = safety.jitter_min_secs {
                self.safety.jitter_min_secs = jitter_min_secs;
            }
            if let Some(jitter_max_secs) = safety.jitter_max_secs {
                self.safety.jitter_max_secs = jitter_max_secs;
            }
            if let Some(fuzzy_budget_variance_pct) = safety.fuzzy_budget_variance_pct {
                self.safety.fuzzy_budget_variance_pct = fuzzy_budget_variance_pct;
            }
            if let Some(max_apply_attempts) = safety.max_apply_attempts {
                self.safety.max_apply_attempts = max_apply_attempts;
            }
            if let Some(poll_interval_secs) = safety.poll_interval_secs {
                self.safety.poll_interval_secs = poll_interval_secs;
            }
        }

        if let Some(cycle) = patch.cycle {
            if let Some(interval_secs) = cycle.interval_secs {
                self.cycle.interval_secs = interval_secs;
            }
            if let Some(stage_timeout_secs) = cycle.stage_timeout_secs {
                self.cycle.stage_timeout_secs = stage_timeout_secs;
            }
            if let Some(cycle_timeout_secs) = cycle.cycle_timeout_secs {
                self.cycle.cycle_timeout_secs = cycle_timeout_secs;
            }
            if let Some(min_new_insights_for_retrain) = cycle.min_new_insights_for_retrain {
                self.cycle.min_new_insights_for_retrain = min_new_insights_for_retrain;
            }
            if let Some(pattern_extraction_enabled) = cycle.pattern_extraction_enabled {
                self.cycle.pattern_extraction_enabled = pattern_extraction_enabled;
            }
            if let Some(insight_compounding_enabled) = cycle.insight_compounding_enabled {
                self.cycle.insight_compounding_enabled = insight_compounding_enabled;
            }
            if let Some(retrain_trigger_enabled) = cycle.retrain_trigger_enabled {
                self.cycle.retrain_trigger_enabled = retrain_trigger_enabled;
            }
            if let Some(continue_on_error) = cycle.continue_on_error {
                self.cycle.continue_on_error = continue_on_error;
            }
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(0.0..=1.0).contains(&self.winner.ctr_threshold) {
            return Err(SettingsError::Validation(
                "winner.ctr_threshold must be in range 0.0..=1.0".to_string(),
            ));
        }
        if self.winner.roas_threshold <= 0.0 {
            return Err(SettingsError::Validation(
                "winner.roas_threshold must be positive".to_string(),
            ));
        }
        if self.winner.min_hours_live < 0 {
            return Err(SettingsError::Validation(
                "winner.min_hours_live must not be negative".to_string(),
            ));
        }

        if !(0.5..1.0).contains(&self.evaluation.confidence_level) {
            return Err(SettingsError::Validation(
                "evaluation.confidence_level must be in range 0.5..1.0".to_string(),
            ));
        }
        if self.evaluation.min_samples == 0 {
            return Err(SettingsError::Validation(
                "evaluation.min_samples must be greater than zero".to_string(),
            ));
        }

        if self.safety.max_actions_per_hour == 0
            || self.safety.max_actions_per_day < self.safety.max_actions_per_hour
        {
            return Err(SettingsError::Validation(
                "safety action limits must satisfy 0 < per_hour <= per_day".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.safety.max_change_pct) {
            return Err(SettingsError::Validation(
                "safety.max_change_pct must be in range 0.0..=1.0".to_string(),
            ));
        }
        if self.safety.velocity_window_hours <= 0 {
            return Err(SettingsError::Validation(
                "safety.velocity_window_hours must be positive".to_string(),
            ));
        }
        if self.safety.jitter_min_secs > self.safety.jitter_max_secs {
            return Err(SettingsError::Validation(
                "safety.jitter_min_secs must not exceed safety.jitter_max_secs".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.safety.fuzzy_budget_variance_pct) {
            return Err(SettingsError::Validation(
                "safety.fuzzy_budget_variance_pct must be in range 0.0..0.5".to_string(),
            ));
        }
        if self.safety.max_apply_attempts == 0 {
            return Err(SettingsError::Validation(
                "safety.max_apply_attempts must be greater than zero".to_string(),
            ));
        }

        if self.cycle.stage_timeout_secs == 0
            || self.cycle.cycle_timeout_secs < self.cycle.stage_timeout_secs
        {
            return Err(SettingsError::Validation(
                "cycle timeouts must satisfy 0 < stage_timeout <= cycle_timeout".to_string(),
            ));
        }

        Ok(())
    }
}

/// Shared handle over the active snapshot. `current()` is cheap and never
/// blocks reloads for long; in-flight work keeps the `Arc` it already holds.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    path: PathBuf,
    current: Arc<RwLock<Arc<RuntimeSettings>>>,
}

impl SettingsHandle {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = RuntimeSettings::load(&path)?;
        Ok(Self { path, current: Arc::new(RwLock::new(Arc::new(settings))) })
    }

    pub fn from_settings(settings: RuntimeSettings) -> Self {
        Self {
            path: PathBuf::new(),
            current: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn current(&self) -> Arc<RuntimeSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the settings file. On success the new snapshot becomes active
    /// with a bumped version; on any error the active snapshot is untouched.
    pub fn reload(&self) -> Result<u64, SettingsError> {
        let mut reloaded = RuntimeSettings::load(&self.path)?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reloaded.version = guard.version + 1;
        // The winner criteria version tracks the snapshot so detection
        // decisions and settings audits agree on one number.
        reloaded.winner.version = reloaded.version as u32;
        *guard = Arc::new(reloaded);
        Ok(guard.version)
    }
}

fn read_patch(path: &Path) -> Result<SettingsPatch, SettingsError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| SettingsError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str::<SettingsPatch>(&raw)
        .map_err(|source| SettingsError::ParseFile { path: path.to_path_buf(), source })
}

#[derive(Debug, Default, Deserialize)]
struct SettingsPatch {
    winner: Option<WinnerPatch>,
    evaluation: Option<EvaluationPatch>,
    safety: Option<SafetyPatch>,
    cycle: Option<CyclePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WinnerPatch {
    ctr_threshold: Option<f64>,
    roas_threshold: Option<f64>,
    require_both: Option<bool>,
    min_impressions: Option<u64>,
    min_hours_live: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct EvaluationPatch {
    min_improvement_pct: Option<f64>,
    min_samples: Option<u64>,
    confidence_level: Option<f64>,
    min_accuracy_delta: Option<f64>,
    auto_promote: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SafetyPatch {
    max_actions_per_hour: Option<u32>,
    max_actions_per_day: Option<u32>,
    max_change_pct: Option<f64>,
    velocity_window_hours: Option<i64>,
    jitter_min_secs: Option<u64>,
    jitter_max_secs: Option<u64>,
    fuzzy_budget_variance_pct: Option<f64>,
    max_apply_attempts: Option<u32>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CyclePatch {
    interval_secs: Option<u64>,
    stage_timeout_secs: Option<u64>,
    cycle_timeout_secs: Option<u64>,
    min_new_insights_for_retrain: Option<u64>,
    pattern_extraction_enabled: Option<bool>,
    insight_compounding_enabled: Option<bool>,
    retrain_trigger_enabled: Option<bool>,
    continue_on_error: Option<bool>,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{RuntimeSettings, SettingsError, SettingsHandle};

    fn write_settings(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("settings.toml");
        fs::write(&path, body).expect("write settings file");
        path
    }

    #[test]
    fn file_values_overlay_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_settings(
            &dir,
            r#"
[winner]
ctr_threshold = 0.05
require_both = true

[safety]
max_actions_per_hour = 10

[cycle]
retrain_trigger_enabled = false
continue_on_error = false
"#,
        );

        let settings = RuntimeSettings::load(&path).expect("load");
        assert_eq!(settings.version, 1);
        assert_eq!(settings.winner.ctr_threshold, 0.05);
        assert!(settings.winner.require_both);
        assert_eq!(settings.safety.max_actions_per_hour, 10);
        assert!(!settings.cycle.retrain_trigger_enabled);
        assert!(!settings.cycle.continue_on_error);
        // Untouched sections keep their defaults.
        assert_eq!(settings.evaluation.min_samples, 200);
        assert!(settings.cycle.pattern_extraction_enabled);
    }

    #[test]
    fn reload_bumps_version_and_swaps_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_settings(&dir, "[winner]\nctr_threshold = 0.04\n");

        let handle = SettingsHandle::load(&path).expect("load");
        let before = handle.current();
        assert_eq!(before.version, 1);

        fs::write(&path, "[winner]\nctr_threshold = 0.06\n").expect("rewrite");
        let version = handle.reload().expect("reload");
        assert_eq!(version, 2);

        let after = handle.current();
        assert_eq!(after.winner.ctr_threshold, 0.06);
        assert_eq!(after.winner.version, 2);
        // The snapshot held before the reload is unchanged.
        assert_eq!(before.winner.ctr_threshold, 0.04);
    }

    #[test]
    fn failed_reload_keeps_the_active_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_settings(&dir, "[winner]\nctr_threshold = 0.04\n");

        let handle = SettingsHandle::load(&path).expect("load");
        fs::write(&path, "[winner]\nctr_threshold = 9.0\n").expect("rewrite");

        let result = handle.reload();
        assert!(matches!(result, Err(SettingsError::Validation(_))));
        let active = handle.current();
        assert_eq!(active.version, 1);
        assert_eq!(active.winner.ctr_threshold, 0.04);
    }

    #[test]
    fn jitter_bounds_are_validated() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_settings(&dir, "[safety]\njitter_min_secs = 500\njitter_max_secs = 100\n");
        let result = RuntimeSettings::load(&path);
        assert!(matches!(result, Err(SettingsError::Validation(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_settings(&dir, "[winner\nctr_threshold = 0.05\n");
        let result = RuntimeSettings::load(&path);
        assert!(matches!(result, Err(SettingsError::ParseFile { .. })));
    }
}
