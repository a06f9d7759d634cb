//! Deterministic experiment assignment.
//!
//! The first successful assignment for `(experiment_id, user_id)` is cached
//! for the assignment TTL and authoritative. Selection hashes the pair with
//! sha2 into a weighted bucket, so recomputing after cache eviction lands on
//! the same variant as long as the experiment config is unchanged.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use adloop_core::config::EdgeConfig;
use adloop_core::errors::InterfaceError;

use crate::cache::CacheState;
use crate::origin::{ExperimentConfig, Origin};

#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub experiment_id: String,
    pub user_id: String,
    pub variant: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A served assignment plus its cache provenance. Assignments never go
/// stale-while-revalidate; the state is either a hit or a miss.
#[derive(Clone, Debug, PartialEq)]
pub struct ServedAssignment {
    pub assignment: Assignment,
    pub cache_state: CacheState,
}

pub struct ExperimentAssigner {
    assignments: DashMap<(String, String), Assignment>,
    origin: Arc<dyn Origin>,
    assignment_ttl: Duration,
    retry_after_secs: u64,
}

impl ExperimentAssigner {
    pub fn new(origin: Arc<dyn Origin>, config: &EdgeConfig) -> Self {
        Self {
            assignments: DashMap::new(),
            origin,
            assignment_ttl: Duration::seconds(config.assignment_ttl_secs as i64),
            retry_after_secs: config.retry_after_secs,
        }
    }

    pub async fn assign(
        &self,
        experiment_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ServedAssignment, InterfaceError> {
        if experiment_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(InterfaceError::BadRequest {
                message: "experiment_id and user_id must not be empty".to_string(),
            });
        }

        let key = (experiment_id.to_string(), user_id.to_string());
        if let Some(cached) = self.assignments.get(&key) {
            if now < cached.expires_at {
                return Ok(ServedAssignment {
                    assignment: cached.clone(),
                    cache_state: CacheState::Hit,
                });
            }
        }

        let config = self.origin.fetch_experiment(experiment_id).await.map_err(|error| {
            InterfaceError::Unavailable {
                message: format!("experiment config fetch failed: {error}"),
                retry_after_secs: self.retry_after_secs,
            }
        })?;

        let variant = pick_variant(&config, user_id).ok_or_else(|| InterfaceError::Internal {
            message: format!("experiment {experiment_id} has no weighted variants"),
        })?;

        let assignment = Assignment {
            experiment_id: experiment_id.to_string(),
            user_id: user_id.to_string(),
            variant,
            assigned_at: now,
            expires_at: now + self.assignment_ttl,
        };
        self.assignments.insert(key, assignment.clone());
        Ok(ServedAssignment { assignment, cache_state: CacheState::Miss })
    }

    #[cfg(test)]
    pub(crate) fn evict(&self, experiment_id: &str, user_id: &str) {
        self.assignments.remove(&(experiment_id.to_string(), user_id.to_string()));
    }
}

/// Weighted pick over the experiment's variants, keyed by a sha2 hash of
/// `(experiment_id, user_id)`. Zero-weight variants are never selected.
fn pick_variant(config: &ExperimentConfig, user_id: &str) -> Option<String> {
    let total: u64 = config.variants.iter().map(|variant| u64::from(variant.weight)).sum();
    if total == 0 {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(config.experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let mut bucket = u64::from_be_bytes(prefix) % total;

    for variant in &config.variants {
        let weight = u64::from(variant.weight);
        if bucket < weight {
            return Some(variant.name.clone());
        }
        bucket -= weight;
    }
    None
}
