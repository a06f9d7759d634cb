use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InsightId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerType {
    Ctr,
    Roas,
    Both,
}

impl WinnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ctr => "ctr",
            Self::Roas => "roas",
            Self::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ctr" => Some(Self::Ctr),
            "roas" => Some(Self::Roas),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// Append-only record of a qualifying winner. Created exactly once per
/// `(video_id, winner_type)` and immutable afterwards except for the
/// `learned` flag flipped by the pattern-extraction stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinnerInsight {
    pub id: InsightId,
    pub video_id: String,
    pub winner_type: WinnerType,
    pub impressions: u64,
    pub ctr: f64,
    pub roas: f64,
    pub spend: Decimal,
    pub revenue: Decimal,
    pub creative_features: Vec<String>,
    pub criteria_version: u32,
    pub indexed_at: DateTime<Utc>,
    pub learned: bool,
}

#[cfg(test)]
mod tests {
    use super::WinnerType;

    #[test]
    fn winner_type_round_trips_from_storage_encoding() {
        for winner_type in [WinnerType::Ctr, WinnerType::Roas, WinnerType::Both] {
            assert_eq!(WinnerType::parse(winner_type.as_str()), Some(winner_type));
        }
    }
}
