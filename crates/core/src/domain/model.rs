use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Candidate,
    Promoted,
    Archived,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Promoted => "promoted",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "candidate" => Some(Self::Candidate),
            "promoted" => Some(Self::Promoted),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A newly trained model owned by the training stage until evaluated.
/// Losing challengers are archived for audit, never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub model_id: ModelId,
    pub model_type: String,
    pub trained_at: DateTime<Utc>,
    pub training_sample_count: u64,
    pub status: CandidateStatus,
}

/// The atomically swappable "currently deployed model" pointer. The `version`
/// column is the compare-and-swap token: a promotion only succeeds against
/// the version it read, so concurrent evaluators cannot race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub name: String,
    pub model_id: ModelId,
    pub version: u32,
    pub promoted_at: DateTime<Utc>,
}

/// Outcome of one champion-vs-challenger comparison. Consumed once to decide
/// promotion; never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: String,
    pub champion_id: ModelId,
    pub challenger_id: ModelId,
    pub champion_accuracy: f64,
    pub challenger_accuracy: f64,
    pub accuracy_delta: f64,
    pub improvement_pct: f64,
    pub sample_size: u64,
    pub confidence_level: f64,
    pub challenger_wins: bool,
    pub settings_version: u32,
    pub evaluated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::CandidateStatus;

    #[test]
    fn candidate_status_round_trips_from_storage_encoding() {
        for status in
            [CandidateStatus::Candidate, CandidateStatus::Promoted, CandidateStatus::Archived]
        {
            assert_eq!(CandidateStatus::parse(status.as_str()), Some(status));
        }
    }
}
