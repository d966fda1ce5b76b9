//! Per-student feature extraction. Each student's raw events across the five
//! streams collapse into a flat named scalar map; a missing stream simply
//! leaves its keys absent (the matrix build step fills population medians so
//! the detector input stays rectangular).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Timelike};
use tracing::warn;

use crate::config::AnalysisConfig;
use crate::error::CoreError;
use crate::models::{
    ConsumptionRecord, Direction, DormEvent, EventBatch, GateEvent, GradeRecord, NetworkSession,
    StudentId,
};
use crate::stats;

/// Feature column names. The order defines the column order of the anomaly
/// matrix and must stay stable within a run.
pub mod cols {
    pub const CANTEEN_MEAN: &str = "canteen_monthly_mean";
    pub const CANTEEN_STD: &str = "canteen_monthly_std";
    pub const CANTEEN_TREND: &str = "canteen_trend";
    pub const CANTEEN_MIN: &str = "canteen_min_month";
    pub const CANTEEN_LOW_STREAK: &str = "canteen_low_streak";
    pub const GATE_DAILY_AVG: &str = "gate_daily_avg";
    pub const GATE_NIGHT_OUT: &str = "gate_night_out_count";
    pub const GATE_WEEKEND_RATIO: &str = "gate_weekend_out_ratio";
    pub const GATE_LONG_ABSENCE: &str = "gate_long_absence_ratio";
    pub const DORM_DAILY_AVG: &str = "dorm_daily_avg";
    pub const DORM_LATE_NIGHT: &str = "dorm_late_night_count";
    pub const DORM_RETURN_STD: &str = "dorm_return_hour_std";
    pub const NET_DAILY_AVG: &str = "net_daily_avg";
    pub const NET_NIGHT_RATIO: &str = "net_night_ratio";
    pub const NET_VPN_RATIO: &str = "net_vpn_ratio";
    pub const NET_DIVERSITY: &str = "net_domain_diversity";
    pub const NET_HOUR_SPREAD: &str = "net_hour_spread";
    pub const GRADE_MEAN: &str = "grade_mean";
    pub const GRADE_MIN: &str = "grade_min";
    pub const GRADE_STD: &str = "grade_std";
    pub const GRADE_FAILS: &str = "grade_fail_count";
    pub const GRADE_TREND: &str = "grade_trend";
    pub const GRADE_LOW_RATIO: &str = "grade_low_ratio";
}

pub const FEATURE_COLUMNS: [&str; 23] = [
    cols::CANTEEN_MEAN,
    cols::CANTEEN_STD,
    cols::CANTEEN_TREND,
    cols::CANTEEN_MIN,
    cols::CANTEEN_LOW_STREAK,
    cols::GATE_DAILY_AVG,
    cols::GATE_NIGHT_OUT,
    cols::GATE_WEEKEND_RATIO,
    cols::GATE_LONG_ABSENCE,
    cols::DORM_DAILY_AVG,
    cols::DORM_LATE_NIGHT,
    cols::DORM_RETURN_STD,
    cols::NET_DAILY_AVG,
    cols::NET_NIGHT_RATIO,
    cols::NET_VPN_RATIO,
    cols::NET_DIVERSITY,
    cols::NET_HOUR_SPREAD,
    cols::GRADE_MEAN,
    cols::GRADE_MIN,
    cols::GRADE_STD,
    cols::GRADE_FAILS,
    cols::GRADE_TREND,
    cols::GRADE_LOW_RATIO,
];

/// Immutable named scalar map for exactly one student and one run.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    pub student_id: StudentId,
    values: BTreeMap<&'static str, f64>,
}

impl FeatureVector {
    /// Degenerate vector carrying only the identifier; produced when a
    /// student's extraction fails so the batch can continue.
    pub fn identifier_only(student_id: StudentId) -> Self {
        Self {
            student_id,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Owned snapshot for result records.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn insert(&mut self, key: &'static str, value: f64) {
        if value.is_finite() {
            self.values.insert(key, value);
        }
    }
}

/// One student's slice of the run's raw events.
#[derive(Debug, Clone, Default)]
pub struct StudentEvents {
    pub student_id: StudentId,
    pub consumption: Vec<ConsumptionRecord>,
    pub gate: Vec<GateEvent>,
    pub dorm: Vec<DormEvent>,
    pub network: Vec<NetworkSession>,
    pub grades: Vec<GradeRecord>,
}

/// Split a population batch into per-student slices, in the batch's stable
/// student order.
pub fn partition(batch: &EventBatch) -> Vec<StudentEvents> {
    let mut by_student: BTreeMap<StudentId, StudentEvents> = batch
        .student_ids()
        .into_iter()
        .map(|id| {
            (
                id.clone(),
                StudentEvents {
                    student_id: id,
                    ..Default::default()
                },
            )
        })
        .collect();

    for r in &batch.consumption {
        if let Some(s) = by_student.get_mut(&r.student_id) {
            s.consumption.push(r.clone());
        }
    }
    for r in &batch.gate {
        if let Some(s) = by_student.get_mut(&r.student_id) {
            s.gate.push(r.clone());
        }
    }
    for r in &batch.dorm {
        if let Some(s) = by_student.get_mut(&r.student_id) {
            s.dorm.push(r.clone());
        }
    }
    for r in &batch.network {
        if let Some(s) = by_student.get_mut(&r.student_id) {
            s.network.push(r.clone());
        }
    }
    for r in &batch.grades {
        if let Some(s) = by_student.get_mut(&r.student_id) {
            s.grades.push(r.clone());
        }
    }

    by_student.into_values().collect()
}

/// Extract one student's feature vector. A failure inside any stream degrades
/// to an identifier-only vector and the batch continues; this is the single
/// recovery boundary per student.
pub fn extract(events: &StudentEvents, config: &AnalysisConfig) -> FeatureVector {
    match try_extract(events, config) {
        Ok(vector) => vector,
        Err(e) => {
            warn!(student = %events.student_id, error = %e, "feature extraction degraded");
            FeatureVector::identifier_only(events.student_id.clone())
        }
    }
}

fn try_extract(events: &StudentEvents, config: &AnalysisConfig) -> Result<FeatureVector, CoreError> {
    let mut v = FeatureVector::identifier_only(events.student_id.clone());
    consumption_features(&mut v, &events.consumption, config)?;
    gate_features(&mut v, &events.gate, config);
    dorm_features(&mut v, &events.dorm, config);
    network_features(&mut v, &events.network, config);
    grade_features(&mut v, &events.grades)?;
    Ok(v)
}

/// Parse a `YYYY-MM` month key into the first day of that month.
pub fn parse_month(month: &str) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d")
        .map_err(|_| CoreError::InvalidMonth(month.to_string()))
}

fn consumption_features(
    v: &mut FeatureVector,
    records: &[ConsumptionRecord],
    config: &AnalysisConfig,
) -> Result<(), CoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let mut dated: Vec<(NaiveDate, f64)> = records
        .iter()
        .map(|r| parse_month(&r.month).map(|d| (d, r.amount)))
        .collect::<Result<_, _>>()?;
    dated.sort_by_key(|(d, _)| *d);
    let amounts: Vec<f64> = dated.iter().map(|(_, a)| *a).collect();

    v.insert(cols::CANTEEN_MEAN, stats::mean(&amounts));
    v.insert(cols::CANTEEN_STD, stats::std_dev(&amounts));
    v.insert(cols::CANTEEN_TREND, stats::ols_slope(&amounts));
    v.insert(cols::CANTEEN_MIN, amounts.iter().copied().fold(f64::INFINITY, f64::min));
    v.insert(
        cols::CANTEEN_LOW_STREAK,
        stats::longest_run_below(&amounts, config.low_consumption_floor) as f64,
    );
    Ok(())
}

fn gate_features(v: &mut FeatureVector, events: &[GateEvent], config: &AnalysisConfig) {
    if events.is_empty() {
        return;
    }
    let days: BTreeSet<NaiveDate> = events.iter().map(|e| e.occurred_at.date()).collect();
    v.insert(
        cols::GATE_DAILY_AVG,
        events.len() as f64 / days.len().max(1) as f64,
    );

    let outs: Vec<&GateEvent> = events
        .iter()
        .filter(|e| e.direction == Direction::Out)
        .collect();
    let night_start = config.gate_night_start_hour;
    let night_out = outs
        .iter()
        .filter(|e| {
            let hour = e.occurred_at.hour();
            hour >= night_start || hour < 6
        })
        .count();
    v.insert(cols::GATE_NIGHT_OUT, night_out as f64);

    let weekend_out = outs
        .iter()
        .filter(|e| e.occurred_at.weekday().num_days_from_monday() >= 5)
        .count();
    v.insert(
        cols::GATE_WEEKEND_RATIO,
        weekend_out as f64 / outs.len().max(1) as f64,
    );

    v.insert(cols::GATE_LONG_ABSENCE, long_absence_ratio(events));
}

/// Fraction of completed out→in pairs whose gap exceeds 6 hours, over all
/// completed pairs; 0 with fewer than 2 events.
fn long_absence_ratio(events: &[GateEvent]) -> f64 {
    if events.len() < 2 {
        return 0.0;
    }
    let mut sorted: Vec<&GateEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.occurred_at);

    let mut long_absences = 0usize;
    let mut total_pairs = 0usize;
    for pair in sorted.windows(2) {
        if pair[0].direction == Direction::Out && pair[1].direction == Direction::In {
            total_pairs += 1;
            let gap = pair[1].occurred_at - pair[0].occurred_at;
            if gap.num_seconds() > 6 * 3600 {
                long_absences += 1;
            }
        }
    }
    long_absences as f64 / total_pairs.max(1) as f64
}

fn dorm_features(v: &mut FeatureVector, events: &[DormEvent], config: &AnalysisConfig) {
    if events.is_empty() {
        return;
    }
    let days: BTreeSet<NaiveDate> = events.iter().map(|e| e.occurred_at.date()).collect();
    v.insert(
        cols::DORM_DAILY_AVG,
        events.len() as f64 / days.len().max(1) as f64,
    );

    let late_night = events
        .iter()
        .filter(|e| {
            let hour = e.occurred_at.hour();
            hour >= config.night_start_hour || hour < 6
        })
        .count();
    v.insert(cols::DORM_LATE_NIGHT, late_night as f64);

    if events.len() > 1 {
        let return_hours: Vec<f64> = events
            .iter()
            .filter(|e| e.direction == Direction::In)
            .map(|e| e.occurred_at.hour() as f64)
            .collect();
        if !return_hours.is_empty() {
            v.insert(cols::DORM_RETURN_STD, stats::std_dev(&return_hours));
        }
    }
}

fn network_features(v: &mut FeatureVector, sessions: &[NetworkSession], config: &AnalysisConfig) {
    if sessions.is_empty() {
        return;
    }
    let days: BTreeSet<NaiveDate> = sessions.iter().map(|s| s.started_at.date()).collect();
    v.insert(
        cols::NET_DAILY_AVG,
        sessions.len() as f64 / days.len().max(1) as f64,
    );

    let night = sessions
        .iter()
        .filter(|s| {
            let hour = s.started_at.hour();
            hour >= config.night_start_hour || hour < 6
        })
        .count();
    v.insert(cols::NET_NIGHT_RATIO, night as f64 / sessions.len() as f64);

    let vpn = sessions.iter().filter(|s| s.used_vpn).count();
    v.insert(cols::NET_VPN_RATIO, vpn as f64 / sessions.len() as f64);

    let domains: BTreeSet<&str> = sessions
        .iter()
        .filter(|s| !s.domain.is_empty())
        .map(|s| s.domain.as_str())
        .collect();
    if !domains.is_empty() {
        v.insert(cols::NET_DIVERSITY, domains.len() as f64);
    }

    let hours: Vec<f64> = sessions.iter().map(|s| s.started_at.hour() as f64).collect();
    v.insert(cols::NET_HOUR_SPREAD, stats::std_dev(&hours));
}

fn grade_features(v: &mut FeatureVector, records: &[GradeRecord]) -> Result<(), CoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let all_scores: Vec<f64> = records
        .iter()
        .flat_map(|r| r.subjects.values().copied())
        .filter(|s| s.is_finite())
        .collect();
    if all_scores.is_empty() {
        return Ok(());
    }

    v.insert(cols::GRADE_MEAN, stats::mean(&all_scores));
    v.insert(
        cols::GRADE_MIN,
        all_scores.iter().copied().fold(f64::INFINITY, f64::min),
    );
    v.insert(cols::GRADE_STD, stats::std_dev(&all_scores));
    v.insert(
        cols::GRADE_FAILS,
        all_scores.iter().filter(|&&s| s < 60.0).count() as f64,
    );
    v.insert(
        cols::GRADE_LOW_RATIO,
        all_scores.iter().filter(|&&s| s < 70.0).count() as f64 / all_scores.len() as f64,
    );

    let mut monthly: Vec<(NaiveDate, f64)> = Vec::new();
    for r in records {
        if let Some(avg) = r.monthly_mean() {
            monthly.push((parse_month(&r.month)?, avg));
        }
    }
    monthly.sort_by_key(|(d, _)| *d);
    let monthly_means: Vec<f64> = monthly.into_iter().map(|(_, m)| m).collect();
    v.insert(cols::GRADE_TREND, stats::ols_slope(&monthly_means));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn gate(dir: Direction, at: chrono::NaiveDateTime) -> GateEvent {
        GateEvent {
            student_id: "s1".into(),
            occurred_at: at,
            direction: dir,
            location: "north".into(),
        }
    }

    #[test]
    fn consumption_trend_zero_with_single_month() {
        let events = StudentEvents {
            student_id: "s1".into(),
            consumption: vec![ConsumptionRecord {
                student_id: "s1".into(),
                month: "2025-03".into(),
                amount: 250.0,
            }],
            ..Default::default()
        };
        let v = extract(&events, &AnalysisConfig::default());
        assert_eq!(v.get(cols::CANTEEN_TREND), Some(0.0));
        assert_eq!(v.get(cols::CANTEEN_LOW_STREAK), Some(1.0));
        assert_eq!(v.get(cols::GATE_DAILY_AVG), None);
    }

    #[test]
    fn consumption_months_sort_chronologically_before_trend() {
        let events = StudentEvents {
            student_id: "s1".into(),
            consumption: vec![
                ConsumptionRecord {
                    student_id: "s1".into(),
                    month: "2025-03".into(),
                    amount: 100.0,
                },
                ConsumptionRecord {
                    student_id: "s1".into(),
                    month: "2025-01".into(),
                    amount: 300.0,
                },
                ConsumptionRecord {
                    student_id: "s1".into(),
                    month: "2025-02".into(),
                    amount: 200.0,
                },
            ],
            ..Default::default()
        };
        let v = extract(&events, &AnalysisConfig::default());
        assert!((v.get(cols::CANTEEN_TREND).unwrap() + 100.0).abs() < 1e-9);
    }

    #[test]
    fn long_absence_ratio_counts_out_in_pairs_over_six_hours() {
        let events = vec![
            gate(Direction::Out, dt(2025, 3, 1, 8, 0)),
            gate(Direction::In, dt(2025, 3, 1, 18, 0)), // 10h away
            gate(Direction::Out, dt(2025, 3, 2, 9, 0)),
            gate(Direction::In, dt(2025, 3, 2, 11, 0)), // 2h away
        ];
        assert!((long_absence_ratio(&events) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn long_absence_ratio_zero_with_fewer_than_two_events() {
        let events = vec![gate(Direction::Out, dt(2025, 3, 1, 8, 0))];
        assert_eq!(long_absence_ratio(&events), 0.0);
    }

    #[test]
    fn malformed_month_degrades_to_identifier_only() {
        let events = StudentEvents {
            student_id: "s9".into(),
            consumption: vec![ConsumptionRecord {
                student_id: "s9".into(),
                month: "not-a-month".into(),
                amount: 100.0,
            }],
            ..Default::default()
        };
        let v = extract(&events, &AnalysisConfig::default());
        assert_eq!(v.student_id, "s9");
        assert!(v.is_empty());
    }

    #[test]
    fn grade_features_cover_fail_and_low_counts() {
        let mut subjects = BTreeMap::new();
        subjects.insert("math".to_string(), 55.0);
        subjects.insert("physics".to_string(), 65.0);
        subjects.insert("literature".to_string(), 90.0);
        let events = StudentEvents {
            student_id: "s1".into(),
            grades: vec![GradeRecord {
                student_id: "s1".into(),
                month: "2025-01".into(),
                subjects,
            }],
            ..Default::default()
        };
        let v = extract(&events, &AnalysisConfig::default());
        assert_eq!(v.get(cols::GRADE_FAILS), Some(1.0));
        assert!((v.get(cols::GRADE_LOW_RATIO).unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(v.get(cols::GRADE_TREND), Some(0.0));
    }

    #[test]
    fn partition_keeps_stable_student_order() {
        let batch = EventBatch {
            gate: vec![
                gate(Direction::Out, dt(2025, 3, 1, 8, 0)),
                GateEvent {
                    student_id: "a0".into(),
                    occurred_at: dt(2025, 3, 1, 9, 0),
                    direction: Direction::In,
                    location: "north".into(),
                },
            ],
            ..Default::default()
        };
        let parts = partition(&batch);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].student_id, "a0");
        assert_eq!(parts[1].student_id, "s1");
    }
}
