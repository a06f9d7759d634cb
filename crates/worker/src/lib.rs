//! Background workers: snapshot intake and winner detection, the durable
//! queue consumer, the learning-cycle orchestrator, champion/challenger
//! evaluation, and the safe executor for live-campaign actions.

pub mod consumer;
pub mod detector;
pub mod evaluator;
pub mod executor;
pub mod ml;
pub mod orchestrator;
pub mod platform;
pub mod stages;

pub use consumer::JobConsumer;
pub use detector::{IngestionLoop, IntakeOutcome, SnapshotIntake};
pub use evaluator::{ChallengerEvaluator, EvaluationOutcome, HoldoutScorer, CHAMPION_NAME};
pub use executor::{ExecutorPass, SafeExecutor};
pub use ml::HttpModelService;
pub use orchestrator::{CycleAttempt, Orchestrator, CYCLE_LEASE};
pub use platform::{ApplyReceipt, HttpPlatformClient, PlatformClient};
pub use stages::{
    FeatureLedger, InsightCompoundingStage, LearningStage, ModelTrainer, PatternExtractionStage,
    RetrainTriggerStage, SharedLedger,
};
