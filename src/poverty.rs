//! Economic-distress tiering from monthly canteen consumption, with weekend
//! outing frequency as a corroborating signal. Tier boundaries are
//! multiplicative factors of one configurable base threshold; no absolute
//! currency value is hardcoded.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::error::CoreError;
use crate::features::parse_month;
use crate::models::{
    ConsumptionRecord, Direction, DistressTier, GateEvent, PovertyRecord, StudentId,
};
use crate::stats;

const SEVERE_MEAN_FACTOR: f64 = 0.83;
const SEVERE_MIN_FACTOR: f64 = 0.66;
const DIFFICULTY_FACTOR: f64 = 1.16;
const GENERAL_FACTOR: f64 = 1.5;

/// Result of one distress classification run.
#[derive(Debug, Clone)]
pub struct PovertyAnalysis {
    /// Students above tier `none`, ordered most severe first, then by mean.
    pub records: Vec<PovertyRecord>,
    pub summary: PovertySummary,
}

#[derive(Debug, Clone)]
pub struct PovertySummary {
    pub run_id: Uuid,
    pub generated_at: chrono::NaiveDateTime,
    pub total_students: usize,
    pub assisted_students: usize,
    pub severe: usize,
    pub difficulty: usize,
    pub general: usize,
}

impl PovertySummary {
    /// Share of the population in any assistance tier, in percent.
    pub fn coverage_pct(&self) -> f64 {
        if self.total_students == 0 {
            return 0.0;
        }
        self.assisted_students as f64 / self.total_students as f64 * 100.0
    }
}

/// Consumption-derived indicators for one student.
#[derive(Debug, Clone)]
pub struct PovertyIndicators {
    pub student_id: StudentId,
    pub monthly_mean: f64,
    pub lowest_month: f64,
    pub monthly_std: f64,
    pub trend: f64,
    pub low_months: usize,
    /// Weekend exits per weekend day seen in the gate data, if any.
    pub weekend_out_rate: Option<f64>,
}

/// Classify the whole population. Students with no consumption data are
/// skipped; a per-student indicator failure degrades that student only.
pub fn analyze_population(
    consumption: &[ConsumptionRecord],
    gate: &[GateEvent],
    config: &AnalysisConfig,
) -> PovertyAnalysis {
    let mut consumption_by_student: BTreeMap<&str, Vec<&ConsumptionRecord>> = BTreeMap::new();
    for record in consumption {
        consumption_by_student
            .entry(record.student_id.as_str())
            .or_default()
            .push(record);
    }
    let mut gate_by_student: BTreeMap<&str, Vec<&GateEvent>> = BTreeMap::new();
    for event in gate {
        gate_by_student
            .entry(event.student_id.as_str())
            .or_default()
            .push(event);
    }

    let total_students = consumption_by_student.len();
    let mut records = Vec::new();
    for (student_id, monthly) in &consumption_by_student {
        let gate_events = gate_by_student
            .get(student_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let indicators = match compute_indicators(student_id, monthly, gate_events, config) {
            Ok(indicators) => indicators,
            Err(e) => {
                warn!(student = %student_id, error = %e, "poverty indicators degraded, skipping");
                continue;
            }
        };
        let record = classify_indicators(&indicators, config);
        if record.tier != DistressTier::None {
            records.push(record);
        }
    }

    records.sort_by(|a, b| {
        b.tier
            .cmp(&a.tier)
            .then(a.monthly_mean.partial_cmp(&b.monthly_mean).unwrap_or(std::cmp::Ordering::Equal))
    });

    let summary = PovertySummary {
        run_id: Uuid::new_v4(),
        generated_at: Utc::now().naive_utc(),
        total_students,
        assisted_students: records.len(),
        severe: records
            .iter()
            .filter(|r| r.tier == DistressTier::SevereDifficulty)
            .count(),
        difficulty: records
            .iter()
            .filter(|r| r.tier == DistressTier::Difficulty)
            .count(),
        general: records
            .iter()
            .filter(|r| r.tier == DistressTier::GeneralDifficulty)
            .count(),
    };
    info!(
        total = summary.total_students,
        assisted = summary.assisted_students,
        "poverty classification complete"
    );

    PovertyAnalysis { records, summary }
}

fn compute_indicators(
    student_id: &str,
    monthly: &[&ConsumptionRecord],
    gate: &[&GateEvent],
    config: &AnalysisConfig,
) -> Result<PovertyIndicators, CoreError> {
    let mut dated: Vec<(NaiveDate, f64)> = monthly
        .iter()
        .map(|r| parse_month(&r.month).map(|d| (d, r.amount)))
        .collect::<Result<_, _>>()?;
    if dated.is_empty() {
        return Err(CoreError::EmptyInput(format!(
            "no consumption months for {student_id}"
        )));
    }
    dated.sort_by_key(|(d, _)| *d);
    let amounts: Vec<f64> = dated.iter().map(|(_, a)| *a).collect();

    let base = config.poverty_base_threshold;
    let weekend_out_rate = weekend_out_rate(gate);

    Ok(PovertyIndicators {
        student_id: StudentId::from(student_id),
        monthly_mean: stats::mean(&amounts),
        lowest_month: amounts.iter().copied().fold(f64::INFINITY, f64::min),
        monthly_std: stats::std_dev(&amounts),
        trend: stats::ols_slope(&amounts),
        low_months: amounts.iter().filter(|&&a| a < base).count(),
        weekend_out_rate,
    })
}

/// Weekend exits per weekend day present in the data; None without gate data.
fn weekend_out_rate(gate: &[&GateEvent]) -> Option<f64> {
    if gate.is_empty() {
        return None;
    }
    let weekend_days: std::collections::BTreeSet<NaiveDate> = gate
        .iter()
        .map(|e| e.occurred_at.date())
        .filter(|d| d.weekday().num_days_from_monday() >= 5)
        .collect();
    if weekend_days.is_empty() {
        return Some(0.0);
    }
    let weekend_outs = gate
        .iter()
        .filter(|e| {
            e.direction == Direction::Out
                && e.occurred_at.weekday().num_days_from_monday() >= 5
        })
        .count();
    Some(weekend_outs as f64 / weekend_days.len() as f64)
}

/// Map indicators to a tier. Boundaries are multiplicative factors of the
/// base threshold, evaluated first-match-wins from most to least severe;
/// supplementary reasons and interventions apply only above tier `none`.
pub fn classify_indicators(
    indicators: &PovertyIndicators,
    config: &AnalysisConfig,
) -> PovertyRecord {
    let base = config.poverty_base_threshold;
    let mean = indicators.monthly_mean;
    let min = indicators.lowest_month;
    let low_months = indicators.low_months;

    let mut reasons = Vec::new();
    let tier = if mean < base * SEVERE_MEAN_FACTOR {
        reasons.push(format!(
            "monthly mean of {mean:.1} is far below the expected level"
        ));
        DistressTier::SevereDifficulty
    } else if min < base * SEVERE_MIN_FACTOR && low_months >= 2 {
        reasons.push(format!(
            "{low_months} months below {base:.0}, lowest only {min:.1}"
        ));
        DistressTier::SevereDifficulty
    } else if mean < base * DIFFICULTY_FACTOR {
        reasons.push(format!(
            "monthly mean of {mean:.1} is below basic living costs"
        ));
        DistressTier::Difficulty
    } else if mean < base * GENERAL_FACTOR {
        reasons.push(format!("monthly mean of {mean:.1} is on the low side"));
        DistressTier::GeneralDifficulty
    } else {
        DistressTier::None
    };

    let mut interventions = Vec::new();
    if tier != DistressTier::None {
        if indicators.trend < config.poverty_trend_threshold {
            reasons.push("consumption in marked decline".to_string());
        }
        if low_months >= 3 {
            reasons.push(format!("{low_months} months below {base:.0}"));
        }
        if matches!(indicators.weekend_out_rate, Some(rate) if rate < 1.0) {
            reasons.push("noticeably fewer weekend outings".to_string());
        }
        interventions = suggest_interventions(tier);
    }

    PovertyRecord {
        student_id: indicators.student_id.clone(),
        tier,
        monthly_mean: mean,
        lowest_month: min,
        low_months,
        trend: indicators.trend,
        reasons,
        interventions,
    }
}

/// Fixed intervention set per tier.
fn suggest_interventions(tier: DistressTier) -> Vec<String> {
    let suggestions: &[&str] = match tier {
        DistressTier::SevereDifficulty => &[
            "start tier-1 grant immediately",
            "offer a work-study placement",
            "monitor wellbeing and academic progress",
        ],
        DistressTier::Difficulty => &[
            "recommend a tier-2 grant application",
            "point to work-study openings",
            "check in on living situation regularly",
        ],
        DistressTier::GeneralDifficulty => &[
            "eligible for a tier-3 grant application",
            "share work-study information",
        ],
        DistressTier::None => &[],
    };
    suggestions.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators(mean: f64, min: f64, low_months: usize) -> PovertyIndicators {
        PovertyIndicators {
            student_id: "s1".into(),
            monthly_mean: mean,
            lowest_month: min,
            monthly_std: 0.0,
            trend: 0.0,
            low_months,
            weekend_out_rate: None,
        }
    }

    fn consumption(id: &str, amounts: &[f64]) -> Vec<ConsumptionRecord> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| ConsumptionRecord {
                student_id: id.into(),
                month: format!("2025-{:02}", i + 1),
                amount,
            })
            .collect()
    }

    #[test]
    fn tier_is_monotonic_in_mean_for_base_300() {
        let config = AnalysisConfig::default();
        let tier = |mean: f64| classify_indicators(&indicators(mean, mean, 0), &config).tier;
        assert_eq!(tier(240.0), DistressTier::SevereDifficulty);
        assert_eq!(tier(320.0), DistressTier::Difficulty);
        assert_eq!(tier(400.0), DistressTier::GeneralDifficulty);
        assert_eq!(tier(500.0), DistressTier::None);
    }

    #[test]
    fn low_minimum_with_repeated_low_months_is_severe() {
        let config = AnalysisConfig::default();
        // Mean passes the first gate but the minimum rule catches it.
        let record = classify_indicators(&indicators(330.0, 150.0, 2), &config);
        assert_eq!(record.tier, DistressTier::SevereDifficulty);
        assert_eq!(record.interventions.len(), 3);
    }

    #[test]
    fn untroubled_student_gets_no_reasons_or_interventions() {
        let config = AnalysisConfig::default();
        let record = classify_indicators(&indicators(500.0, 480.0, 0), &config);
        assert_eq!(record.tier, DistressTier::None);
        assert!(record.reasons.is_empty());
        assert!(record.interventions.is_empty());
    }

    #[test]
    fn boundaries_scale_with_the_base_threshold() {
        let mut config = AnalysisConfig::default();
        config.poverty_base_threshold = 600.0;
        let record = classify_indicators(&indicators(480.0, 480.0, 0), &config);
        // 480 < 0.83 * 600, severe under the doubled base.
        assert_eq!(record.tier, DistressTier::SevereDifficulty);
    }

    #[test]
    fn end_to_end_three_student_scenario() {
        let mut all = Vec::new();
        all.extend(consumption("a", &[100.0, 120.0, 90.0]));
        all.extend(consumption("b", &[500.0, 520.0, 510.0]));
        all.extend(consumption("c", &[310.0, 305.0, 300.0]));
        let analysis = analyze_population(&all, &[], &AnalysisConfig::default());

        assert_eq!(analysis.summary.total_students, 3);
        assert_eq!(analysis.records.len(), 2);
        let a = analysis.records.iter().find(|r| r.student_id == "a").unwrap();
        assert_eq!(a.tier, DistressTier::SevereDifficulty);
        // Mean 305 sits under 1.16x the base threshold.
        let c = analysis.records.iter().find(|r| r.student_id == "c").unwrap();
        assert_eq!(c.tier, DistressTier::Difficulty);
        assert!(analysis.records.iter().all(|r| r.student_id != "b"));
        // Most severe first.
        assert_eq!(analysis.records[0].student_id, "a");
        assert!((analysis.summary.coverage_pct() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn declining_trend_adds_a_supplementary_reason() {
        let config = AnalysisConfig::default();
        let mut ind = indicators(330.0, 250.0, 1);
        ind.trend = -80.0;
        let record = classify_indicators(&ind, &config);
        assert_eq!(record.tier, DistressTier::Difficulty);
        assert!(record
            .reasons
            .iter()
            .any(|r| r.contains("marked decline")));
    }
}
