use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BudgetChange,
    Pause,
    TargetingChange,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetChange => "budget_change",
            Self::Pause => "pause",
            Self::TargetingChange => "targeting_change",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "budget_change" => Ok(Self::BudgetChange),
            "pause" => Ok(Self::Pause),
            "targeting_change" => Ok(Self::TargetingChange),
            other => Err(DomainError::UnknownActionKind(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Applied,
    Rejected,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "applied" => Some(Self::Applied),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A budget/targeting change owned exclusively by the safe executor until
/// applied or rejected. `action_id` doubles as the idempotency key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub campaign_ref: String,
    pub account_ref: String,
    pub kind: ActionKind,
    pub requested_value: Option<Decimal>,
    pub applied_value: Option<Decimal>,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub settings_version: u32,
}

impl Action {
    pub fn applied(&self) -> bool {
        self.status == ActionStatus::Applied
    }
}
