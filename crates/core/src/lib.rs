pub mod config;
pub mod detector;
pub mod domain;
pub mod errors;
pub mod evaluator;
pub mod learning;
pub mod queue;
pub mod safety;
pub mod settings;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use detector::{WinnerCriteria, WinnerVerdict};
pub use domain::action::{Action, ActionId, ActionKind, ActionStatus};
pub use domain::job::{DedupKey, Job, JobId, JobStatus, JobType};
pub use domain::model::{CandidateStatus, ChampionRecord, EvaluationResult, ModelCandidate, ModelId};
pub use domain::snapshot::{EntityId, PerformanceSnapshot};
pub use domain::winner::{InsightId, WinnerInsight, WinnerType};
pub use errors::{ApplicationError, DomainError, ErrorClass, InterfaceError};
pub use evaluator::{EvaluationConfig, EvaluationError, EvaluationVerdict};
pub use learning::{CycleConfig, CycleResult, CycleTrigger, StageKind, StageOutcome, StageStatus};
pub use queue::{QueueConfig, QueueEngine, QueueError};
pub use safety::{RateDecision, SafetyConfig, VelocityOutcome};
pub use settings::{RuntimeSettings, SettingsError, SettingsHandle};
