//! Population-level reference statistics. Computed once per run from the full
//! population's network sessions and used only as denominators for relative
//! intensity factors, so both scalars are floor-clamped away from zero.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, Timelike};

use crate::models::NetworkSession;
use crate::stats;

const MIN_DAILY_VISITS: f64 = 5.0;
const MIN_NIGHT_RATIO: f64 = 0.05;
const DEFAULT_DAILY_VISITS: f64 = 15.0;
const DEFAULT_NIGHT_RATIO: f64 = 0.1;

/// Cohort reference scalars for one analysis run.
#[derive(Debug, Clone, Copy)]
pub struct CohortBaseline {
    /// Median over students of their mean daily visit count; at least 5.
    pub daily_visits: f64,
    /// Median over students of their night-access ratio; at least 0.05.
    pub night_ratio: f64,
}

impl Default for CohortBaseline {
    fn default() -> Self {
        Self {
            daily_visits: DEFAULT_DAILY_VISITS,
            night_ratio: DEFAULT_NIGHT_RATIO,
        }
    }
}

impl CohortBaseline {
    pub fn from_sessions(sessions: &[NetworkSession], night_start_hour: u32) -> Self {
        if sessions.is_empty() {
            return Self::default();
        }

        let mut per_student_days: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();
        let mut per_student_total: BTreeMap<&str, usize> = BTreeMap::new();
        let mut per_student_night: BTreeMap<&str, usize> = BTreeMap::new();

        for s in sessions {
            per_student_days
                .entry(s.student_id.as_str())
                .or_default()
                .insert(s.started_at.date());
            *per_student_total.entry(s.student_id.as_str()).or_default() += 1;
            let hour = s.started_at.hour();
            if hour >= night_start_hour || hour < 6 {
                *per_student_night.entry(s.student_id.as_str()).or_default() += 1;
            }
        }

        let daily_means: Vec<f64> = per_student_total
            .iter()
            .map(|(id, &total)| {
                let days = per_student_days.get(id).map_or(1, BTreeSet::len).max(1);
                total as f64 / days as f64
            })
            .collect();
        let night_ratios: Vec<f64> = per_student_total
            .iter()
            .map(|(id, &total)| {
                let night = per_student_night.get(id).copied().unwrap_or(0);
                night as f64 / total.max(1) as f64
            })
            .collect();

        let daily_visits = stats::median(&daily_means)
            .map_or(DEFAULT_DAILY_VISITS, |m| m.max(MIN_DAILY_VISITS));
        let night_ratio = stats::median(&night_ratios)
            .map_or(DEFAULT_NIGHT_RATIO, |m| m.max(MIN_NIGHT_RATIO));

        Self {
            daily_visits,
            night_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn session(student: &str, day: u32, hour: u32) -> NetworkSession {
        let at = NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        NetworkSession {
            student_id: student.into(),
            started_at: at,
            ended_at: at + chrono::Duration::minutes(30),
            domain: "example.com".into(),
            used_vpn: false,
        }
    }

    #[test]
    fn empty_population_uses_defaults() {
        let baseline = CohortBaseline::from_sessions(&[], 23);
        assert_eq!(baseline.daily_visits, DEFAULT_DAILY_VISITS);
        assert_eq!(baseline.night_ratio, DEFAULT_NIGHT_RATIO);
    }

    #[test]
    fn quiet_population_is_floor_clamped() {
        // One daytime visit per student per day: medians would be 1.0 and 0.0.
        let sessions = vec![session("a", 1, 10), session("b", 1, 11)];
        let baseline = CohortBaseline::from_sessions(&sessions, 23);
        assert_eq!(baseline.daily_visits, MIN_DAILY_VISITS);
        assert_eq!(baseline.night_ratio, MIN_NIGHT_RATIO);
    }

    #[test]
    fn heavy_population_keeps_its_median() {
        let mut sessions = Vec::new();
        for student in ["a", "b", "c"] {
            for _ in 0..8 {
                sessions.push(session(student, 1, 10));
            }
            sessions.push(session(student, 1, 23));
            sessions.push(session(student, 1, 2));
        }
        let baseline = CohortBaseline::from_sessions(&sessions, 23);
        assert!((baseline.daily_visits - 10.0).abs() < 1e-9);
        assert!((baseline.night_ratio - 0.2).abs() < 1e-9);
    }
}
