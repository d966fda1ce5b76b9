//! Comprehensive risk pass: feature extraction over the whole population,
//! outlier detection, then per-flagged-student reasoning with threshold-gated
//! reason strings and an additive weighted score.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::anomaly::{self, FeatureMatrix};
use crate::config::AnalysisConfig;
use crate::features::{self, cols, FeatureVector};
use crate::models::{EventBatch, RiskLevel, RiskRecord, RunSummary};

/// Result of one comprehensive analysis run. Immutable; a later run
/// supersedes it wholesale.
#[derive(Debug, Clone)]
pub struct RiskAnalysis {
    pub records: Vec<RiskRecord>,
    pub summary: RunSummary,
}

/// Run the full risk pipeline over one population batch. Never fails: an
/// empty batch yields empty records under a well-formed summary shell.
pub fn analyze_population(batch: &EventBatch, config: &AnalysisConfig) -> RiskAnalysis {
    let students = features::partition(batch);
    let vectors: Vec<FeatureVector> = students
        .iter()
        .map(|events| features::extract(events, config))
        .collect();

    let records = if vectors.is_empty() {
        Vec::new()
    } else {
        let matrix = FeatureMatrix::build(&vectors);
        let flagged = anomaly::detect(&matrix, config.contamination);
        flagged
            .into_iter()
            .map(|idx| reason_student(&vectors[idx], config))
            .collect()
    };

    let summary = RunSummary {
        run_id: Uuid::new_v4(),
        generated_at: Utc::now().naive_utc(),
        total_students: vectors.len(),
        flagged_students: records.len(),
        high: records.iter().filter(|r| r.level == RiskLevel::High).count(),
        medium: records
            .iter()
            .filter(|r| r.level == RiskLevel::Medium)
            .count(),
        low: records.iter().filter(|r| r.level == RiskLevel::Low).count(),
    };
    info!(
        total = summary.total_students,
        flagged = summary.flagged_students,
        "risk analysis complete"
    );

    RiskAnalysis { records, summary }
}

/// Build the risk record for one flagged student.
pub fn reason_student(vector: &FeatureVector, config: &AnalysisConfig) -> RiskRecord {
    let reasons = risk_reasons(vector, config);
    let level = risk_level(vector, config);
    let talking_points = talking_points(&reasons);
    RiskRecord {
        student_id: vector.student_id.clone(),
        level,
        reasons,
        features: vector.snapshot(),
        talking_points,
    }
}

/// Ordered reason strings, each gated by threshold checks. Never empty for a
/// flagged student: a catch-all reason covers the no-specific-trigger case.
fn risk_reasons(v: &FeatureVector, config: &AnalysisConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    let floor = config.low_consumption_floor;

    if let Some(mean) = v.get(cols::CANTEEN_MEAN) {
        if mean < floor {
            reasons.push(format!("monthly canteen spend below {floor:.0}"));
        }
    }
    if let Some(streak) = v.get(cols::CANTEEN_LOW_STREAK) {
        if streak >= 2.0 {
            reasons.push(format!("{} consecutive low-consumption months", streak as i64));
        }
    }
    if let Some(trend) = v.get(cols::CANTEEN_TREND) {
        if trend < -50.0 {
            reasons.push("consumption in marked decline".to_string());
        }
    }

    if let Some(night_out) = v.get(cols::GATE_NIGHT_OUT) {
        if night_out > 5.0 {
            reasons.push("frequent night-time campus exits".to_string());
        }
    }
    if let Some(ratio) = v.get(cols::GATE_WEEKEND_RATIO) {
        if ratio > 0.8 {
            reasons.push("nearly all exits fall on weekends".to_string());
        }
    }
    if let Some(ratio) = v.get(cols::GATE_LONG_ABSENCE) {
        if ratio > 0.5 {
            reasons.push("high share of absences longer than 6 hours".to_string());
        }
    }

    if let Some(count) = v.get(cols::DORM_LATE_NIGHT) {
        if count > 10.0 {
            reasons.push("frequent late-night dormitory movement".to_string());
        }
    }
    if let Some(spread) = v.get(cols::DORM_RETURN_STD) {
        if spread > 3.0 {
            reasons.push("irregular dormitory return times".to_string());
        }
    }

    if let Some(daily) = v.get(cols::NET_DAILY_AVG) {
        if daily > 50.0 {
            reasons.push("excessive daily network activity".to_string());
        }
    }
    if let Some(ratio) = v.get(cols::NET_NIGHT_RATIO) {
        if ratio > 0.3 {
            reasons.push("high night-time network usage".to_string());
        }
    }
    if let Some(ratio) = v.get(cols::NET_VPN_RATIO) {
        if ratio > 0.5 {
            reasons.push("frequent VPN usage".to_string());
        }
    }

    if let Some(mean) = v.get(cols::GRADE_MEAN) {
        if mean < 65.0 {
            reasons.push(format!("low academic average ({mean:.1})"));
        }
    }
    if let Some(fails) = v.get(cols::GRADE_FAILS) {
        if fails >= 2.0 {
            reasons.push(format!("{} failed subject results", fails as i64));
        }
    }
    if let Some(trend) = v.get(cols::GRADE_TREND) {
        if trend < -5.0 {
            reasons.push("grades in marked decline".to_string());
        }
    }
    if let Some(ratio) = v.get(cols::GRADE_LOW_RATIO) {
        if ratio > 0.5 {
            reasons.push(format!(
                "low scores across most subjects ({:.0}%)",
                ratio * 100.0
            ));
        }
    }

    if reasons.is_empty() {
        reasons.push("composite behavioral anomaly".to_string());
    }
    reasons
}

/// Additive weighted score mapped onto a discrete level: >=5 high, >=3
/// medium, else low.
fn risk_level(v: &FeatureVector, config: &AnalysisConfig) -> RiskLevel {
    let mut score = 0.0;
    let floor = config.low_consumption_floor;

    if let Some(mean) = v.get(cols::CANTEEN_MEAN) {
        if mean < floor {
            score += 2.0;
        } else if mean < floor + 200.0 {
            score += 1.0;
        }
    }
    if let Some(streak) = v.get(cols::CANTEEN_LOW_STREAK) {
        if streak >= 2.0 {
            score += streak;
        }
    }

    if let Some(night_out) = v.get(cols::GATE_NIGHT_OUT) {
        if night_out > 5.0 {
            score += 2.0;
        }
    }
    if let Some(count) = v.get(cols::DORM_LATE_NIGHT) {
        if count > 10.0 {
            score += 2.0;
        }
    }
    if let Some(ratio) = v.get(cols::NET_NIGHT_RATIO) {
        if ratio > 0.3 {
            score += 1.0;
        }
    }
    if let Some(spread) = v.get(cols::DORM_RETURN_STD) {
        if spread > 3.0 {
            score += 1.0;
        }
    }

    if let Some(mean) = v.get(cols::GRADE_MEAN) {
        if mean < 60.0 {
            score += 3.0;
        } else if mean < 70.0 {
            score += 2.0;
        }
    }
    if let Some(fails) = v.get(cols::GRADE_FAILS) {
        if fails >= 2.0 {
            score += fails;
        }
    }
    if let Some(trend) = v.get(cols::GRADE_TREND) {
        if trend < -5.0 {
            score += 2.0;
        }
    }

    if score >= 5.0 {
        RiskLevel::High
    } else if score >= 3.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Map reason strings onto at most three follow-up conversation focuses.
fn talking_points(reasons: &[String]) -> Vec<String> {
    let mut points: Vec<String> = Vec::new();
    for reason in reasons {
        let point = if reason.contains("canteen") || reason.contains("consumption") {
            "ask about finances and eating habits"
        } else if reason.contains("night") {
            "ask about night-time activity and safety"
        } else if reason.contains("network") || reason.contains("VPN") {
            "ask about online habits and study focus"
        } else if reason.contains("return") || reason.contains("weekend") {
            "ask about daily routine and social life"
        } else if reason.contains("academic")
            || reason.contains("grade")
            || reason.contains("subject")
        {
            "ask about study difficulties and workload"
        } else {
            "ask about recent study and living situation"
        };
        if !points.iter().any(|existing| existing == point) && points.len() < 3 {
            points.push(point.to_string());
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::StudentEvents;
    use crate::models::{ConsumptionRecord, GradeRecord};
    use std::collections::BTreeMap;

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

    fn grades(id: &str, month: &str, scores: &[(&str, f64)]) -> GradeRecord {
        GradeRecord {
            student_id: id.into(),
            month: month.into(),
            subjects: scores
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn vector_for(events: StudentEvents) -> FeatureVector {
        features::extract(&events, &AnalysisConfig::default())
    }

    #[test]
    fn struggling_student_scores_high() {
        let v = vector_for(StudentEvents {
            student_id: "s1".into(),
            consumption: consumption("s1", &[250.0, 240.0, 230.0]),
            grades: vec![
                grades("s1", "2025-01", &[("math", 55.0), ("physics", 52.0)]),
                grades("s1", "2025-02", &[("math", 50.0), ("physics", 48.0)]),
            ],
            ..Default::default()
        });
        let record = reason_student(&v, &AnalysisConfig::default());
        assert_eq!(record.level, RiskLevel::High);
        assert!(record
            .reasons
            .iter()
            .any(|r| r.contains("consecutive low-consumption")));
        assert!(!record.talking_points.is_empty());
    }

    #[test]
    fn unremarkable_flagged_student_gets_catch_all_reason() {
        let v = vector_for(StudentEvents {
            student_id: "s2".into(),
            consumption: consumption("s2", &[600.0, 620.0, 610.0]),
            grades: vec![grades("s2", "2025-01", &[("math", 85.0)])],
            ..Default::default()
        });
        let record = reason_student(&v, &AnalysisConfig::default());
        assert_eq!(
            record.reasons,
            vec!["composite behavioral anomaly".to_string()]
        );
        assert_eq!(record.level, RiskLevel::Low);
    }

    #[test]
    fn degraded_vector_still_yields_a_record() {
        let v = FeatureVector::identifier_only("s3".into());
        let record = reason_student(&v, &AnalysisConfig::default());
        assert_eq!(record.level, RiskLevel::Low);
        assert_eq!(record.reasons.len(), 1);
        assert!(record.features.is_empty());
    }

    #[test]
    fn empty_population_returns_summary_shell() {
        let analysis = analyze_population(&EventBatch::default(), &AnalysisConfig::default());
        assert!(analysis.records.is_empty());
        assert_eq!(analysis.summary.total_students, 0);
        assert_eq!(analysis.summary.flagged_students, 0);
    }

    #[test]
    fn every_flagged_student_has_reasons_and_count_matches_contamination() {
        let mut batch = EventBatch::default();
        for i in 0..10 {
            batch
                .consumption
                .extend(consumption(&format!("s{i:02}"), &[500.0, 500.0]));
        }
        // Identical students force the deterministic fallback path.
        let analysis = analyze_population(&batch, &AnalysisConfig::default());
        assert_eq!(analysis.records.len(), 2); // ceil(10 * 0.15)
        for record in &analysis.records {
            assert!(!record.reasons.is_empty());
        }
        assert_eq!(
            analysis.records[0].student_id, "s00",
            "fallback flags stable prefix"
        );
    }
}
