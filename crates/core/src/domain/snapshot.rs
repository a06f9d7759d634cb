use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable performance record for one entity over one reporting window.
/// Produced by the ingestion feed; never mutated after creation. A newer
/// `observed_at` for the same `(entity_id, window)` supersedes the old row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub entity_id: EntityId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: Decimal,
    pub revenue: Decimal,
    pub ctr: f64,
    pub roas: f64,
    pub entity_created_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl PerformanceSnapshot {
    /// Validation failures are rejected immediately and never retried.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.entity_id.0.trim().is_empty() {
            return Err(DomainError::InvalidSnapshot("entity_id must not be empty".to_string()));
        }
        if self.window_end <= self.window_start {
            return Err(DomainError::InvalidSnapshot(format!(
                "window_end {} must be after window_start {}",
                self.window_end, self.window_start
            )));
        }
        if self.clicks > self.impressions {
            return Err(DomainError::InvalidSnapshot(format!(
                "clicks {} exceed impressions {}",
                self.clicks, self.impressions
            )));
        }
        if !(0.0..=1.0).contains(&self.ctr) || !self.ctr.is_finite() {
            return Err(DomainError::InvalidSnapshot(format!(
                "ctr must be a finite ratio in 0..=1, got {}",
                self.ctr
            )));
        }
        if self.roas < 0.0 || !self.roas.is_finite() {
            return Err(DomainError::InvalidSnapshot(format!(
                "roas must be finite and non-negative, got {}",
                self.roas
            )));
        }
        if self.spend < Decimal::ZERO || self.revenue < Decimal::ZERO {
            return Err(DomainError::InvalidSnapshot(
                "spend and revenue must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hours_live(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entity_created_at).num_hours()
    }
}
