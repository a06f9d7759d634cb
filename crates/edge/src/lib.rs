//! Edge serving layer: the stale-while-revalidate decision cache,
//! deterministic experiment assignment, and the axum read API in front of
//! both.

pub mod api;
pub mod assign;
pub mod cache;
pub mod origin;

pub use api::{router, EdgeState};
pub use assign::{Assignment, ExperimentAssigner, ServedAssignment};
pub use cache::{CacheState, CachedPrediction, DecisionCache};
pub use origin::{ExperimentConfig, HttpOrigin, Origin, Prediction, Variant};
