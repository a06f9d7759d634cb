//! Winner detection.
//!
//! A pure function of the snapshot plus the active criteria so that every
//! decision is testable and replayable, including historical backfill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::snapshot::PerformanceSnapshot;
use crate::domain::winner::WinnerType;

/// Versioned winner thresholds. Hot-reloadable; the version travels with
/// every detection decision so replays use the criteria that were active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinnerCriteria {
    pub version: u32,
    pub ctr_threshold: f64,
    pub roas_threshold: f64,
    pub require_both: bool,
    pub min_impressions: u64,
    pub min_hours_live: i64,
}

impl Default for WinnerCriteria {
    fn default() -> Self {
        Self {
            version: 1,
            ctr_threshold: 0.03,
            roas_threshold: 3.0,
            require_both: false,
            min_impressions: 1_000,
            min_hours_live: 24,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinnerVerdict {
    pub winner_type: WinnerType,
    pub criteria_version: u32,
    pub hours_live: i64,
    pub evaluated_at: DateTime<Utc>,
}

/// Returns a verdict iff the snapshot qualifies under the given criteria:
/// minimum exposure (impressions and hours live) plus the CTR/ROAS threshold
/// combination selected by `require_both`.
pub fn evaluate(
    snapshot: &PerformanceSnapshot,
    criteria: &WinnerCriteria,
    now: DateTime<Utc>,
) -> Option<WinnerVerdict> {
    if snapshot.impressions < criteria.min_impressions {
        return None;
    }

    let hours_live = snapshot.hours_live(now);
    if hours_live < criteria.min_hours_live {
        return None;
    }

    let ctr_met = snapshot.ctr > criteria.ctr_threshold;
    let roas_met = snapshot.roas > criteria.roas_threshold;

    let qualified = if criteria.require_both { ctr_met && roas_met } else { ctr_met || roas_met };
    if !qualified {
        return None;
    }

    let winner_type = match (ctr_met, roas_met) {
        (true, true) => WinnerType::Both,
        (true, false) => WinnerType::Ctr,
        (false, true) => WinnerType::Roas,
        (false, false) => unreachable!("qualified implies at least one threshold met"),
    };

    Some(WinnerVerdict {
        winner_type,
        criteria_version: criteria.version,
        hours_live,
        evaluated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{evaluate, WinnerCriteria};
    use crate::domain::snapshot::{EntityId, PerformanceSnapshot};
    use crate::domain::winner::WinnerType;

    fn snapshot(impressions: u64, ctr: f64, roas: f64, hours_live: i64) -> PerformanceSnapshot {
        let now = Utc::now();
        PerformanceSnapshot {
            entity_id: EntityId("vid-100".to_string()),
            window_start: now - Duration::hours(24),
            window_end: now,
            impressions,
            clicks: (impressions as f64 * ctr) as u64,
            conversions: 5,
            spend: Decimal::new(10_000, 2),
            revenue: Decimal::new(20_000, 2),
            ctr,
            roas,
            entity_created_at: now - Duration::hours(hours_live),
            observed_at: now,
        }
    }

    fn criteria() -> WinnerCriteria {
        WinnerCriteria {
            version: 7,
            ctr_threshold: 0.03,
            roas_threshold: 3.0,
            require_both: false,
            min_impressions: 1_000,
            min_hours_live: 24,
        }
    }

    #[test]
    fn ctr_winner_qualifies_when_either_threshold_suffices() {
        let s = snapshot(1_500, 0.04, 2.0, 30);
        let verdict = evaluate(&s, &criteria(), s.observed_at).expect("winner");
        assert_eq!(verdict.winner_type, WinnerType::Ctr);
        assert_eq!(verdict.criteria_version, 7);
        assert_eq!(verdict.hours_live, 30);
    }

    #[test]
    fn below_min_impressions_never_wins() {
        let s = snapshot(999, 0.9, 9.0, 100);
        assert_eq!(evaluate(&s, &criteria(), s.observed_at), None);
    }

    #[test]
    fn below_min_hours_live_never_wins() {
        let s = snapshot(10_000, 0.9, 9.0, 23);
        assert_eq!(evaluate(&s, &criteria(), s.observed_at), None);
    }

    #[test]
    fn require_both_rejects_single_threshold() {
        let mut both = criteria();
        both.require_both = true;
        let s = snapshot(1_500, 0.04, 2.0, 30);
        assert_eq!(evaluate(&s, &both, s.observed_at), None);
    }

    #[test]
    fn both_thresholds_met_classifies_as_both() {
        let s = snapshot(1_500, 0.04, 4.0, 30);
        let verdict = evaluate(&s, &criteria(), s.observed_at).expect("winner");
        assert_eq!(verdict.winner_type, WinnerType::Both);
    }

    #[test]
    fn roas_only_classifies_as_roas() {
        let s = snapshot(1_500, 0.01, 4.0, 30);
        let verdict = evaluate(&s, &criteria(), s.observed_at).expect("winner");
        assert_eq!(verdict.winner_type, WinnerType::Roas);
    }

    #[test]
    fn threshold_equality_does_not_qualify() {
        let s = snapshot(1_500, 0.03, 3.0, 30);
        assert_eq!(evaluate(&s, &criteria(), s.observed_at), None);
    }

    #[test]
    fn detection_is_deterministic_for_replay() {
        let s = snapshot(1_500, 0.04, 2.0, 30);
        let at = s.observed_at;
        assert_eq!(evaluate(&s, &criteria(), at), evaluate(&s, &criteria(), at));
    }
}
