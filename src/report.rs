//! Markdown rendering of analysis results. The core hands over ordered record
//! lists; this module only formats them.

use std::fmt::Write;

use crate::ideology::IdeologyAnalysis;
use crate::poverty::PovertyAnalysis;
use crate::risk::RiskAnalysis;

pub fn build_report(
    risk: &RiskAnalysis,
    ideology: &IdeologyAnalysis,
    poverty: &PovertyAnalysis,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Campus Behavior Insight Report");
    let _ = writeln!(
        output,
        "Run {} generated at {}",
        risk.summary.run_id, risk.summary.generated_at
    );
    let _ = writeln!(output);

    write_risk_section(&mut output, risk);
    write_ideology_section(&mut output, ideology);
    write_poverty_section(&mut output, poverty);

    output
}

fn write_risk_section(output: &mut String, risk: &RiskAnalysis) {
    let _ = writeln!(output, "## Comprehensive Risk");
    let _ = writeln!(
        output,
        "{} of {} students flagged ({} high, {} medium, {} low).",
        risk.summary.flagged_students,
        risk.summary.total_students,
        risk.summary.high,
        risk.summary.medium,
        risk.summary.low
    );
    let _ = writeln!(output);

    if risk.records.is_empty() {
        let _ = writeln!(output, "No students flagged in this run.");
    } else {
        for record in risk.records.iter() {
            let _ = writeln!(
                output,
                "- {} [{}]: {}",
                record.student_id,
                record.level,
                record.reasons.join("; ")
            );
            for point in record.talking_points.iter() {
                let _ = writeln!(output, "  - follow-up: {point}");
            }
        }
    }
    let _ = writeln!(output);
}

fn write_ideology_section(output: &mut String, ideology: &IdeologyAnalysis) {
    let _ = writeln!(output, "## Engagement Profiles");
    let _ = writeln!(
        output,
        "{} students profiled, {} on close watch.",
        ideology.summary.total_students, ideology.summary.close_watch
    );
    let _ = writeln!(output);

    if ideology.profiles.is_empty() {
        let _ = writeln!(output, "No network activity to profile.");
    } else {
        for profile in ideology.profiles.iter() {
            let _ = writeln!(
                output,
                "- {} ({}): positivity {}, intensity {}, radicalism {} -> {}",
                profile.student_id,
                profile.archetype,
                profile.positivity,
                profile.intensity,
                profile.radicalism,
                profile.strategy
            );
            let _ = writeln!(
                output,
                "  typical scene: {} (vpn ratio {:.0}%, {:.1} visits/day)",
                profile.typical_scene,
                profile.vpn_ratio * 100.0,
                profile.daily_visits
            );
        }
    }
    let _ = writeln!(output);
}

fn write_poverty_section(output: &mut String, poverty: &PovertyAnalysis) {
    let _ = writeln!(output, "## Economic Distress");
    let _ = writeln!(
        output,
        "{} of {} students in an assistance tier, {:.0}% coverage ({} severe, {} difficulty, {} general).",
        poverty.summary.assisted_students,
        poverty.summary.total_students,
        poverty.summary.coverage_pct(),
        poverty.summary.severe,
        poverty.summary.difficulty,
        poverty.summary.general
    );
    let _ = writeln!(output);

    if poverty.records.is_empty() {
        let _ = writeln!(output, "No students below the assistance thresholds.");
    } else {
        for record in poverty.records.iter() {
            let _ = writeln!(
                output,
                "- {} [{}] monthly mean {:.1}, lowest {:.1}: {}",
                record.student_id,
                record.tier,
                record.monthly_mean,
                record.lowest_month,
                record.reasons.join("; ")
            );
            for intervention in record.interventions.iter() {
                let _ = writeln!(output, "  - {intervention}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::ideology;
    use crate::models::EventBatch;
    use crate::poverty;
    use crate::risk;

    #[test]
    fn empty_run_still_renders_every_section() {
        let batch = EventBatch::default();
        let config = AnalysisConfig::default();
        let report = build_report(
            &risk::analyze_population(&batch, &config),
            &ideology::classify_population(&batch.network, &batch.grades, &config),
            &poverty::analyze_population(&[], &[], &config),
        );

        assert!(report.contains("## Comprehensive Risk"));
        assert!(report.contains("## Engagement Profiles"));
        assert!(report.contains("## Economic Distress"));
        assert!(report.contains("No students flagged in this run."));
    }

    #[test]
    fn flagged_students_appear_with_reasons() {
        let mut batch = EventBatch::default();
        for i in 0..10 {
            for (m, amount) in [("2025-01", 500.0), ("2025-02", 510.0)] {
                batch.consumption.push(crate::models::ConsumptionRecord {
                    student_id: format!("s{i:02}"),
                    month: m.into(),
                    amount,
                });
            }
        }
        let config = AnalysisConfig::default();
        let risk = risk::analyze_population(&batch, &config);
        let report = build_report(
            &risk,
            &ideology::classify_population(&batch.network, &batch.grades, &config),
            &poverty::analyze_population(&batch.consumption, &batch.gate, &config),
        );

        for record in &risk.records {
            assert!(report.contains(record.student_id.as_str()));
        }
    }
}
