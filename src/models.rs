use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque stable student identifier; every stream keys on it.
pub type StudentId = String;

/// Gate / dormitory turnstile direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in" | "enter" | "entry" => Ok(Direction::In),
            "out" | "exit" | "leave" => Ok(Direction::Out),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// One month of canteen consumption: one record per (student, month).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub student_id: StudentId,
    /// Month key in `YYYY-MM` form.
    pub month: String,
    pub amount: f64,
}

/// One campus-gate access event. Timestamps arrive timezone-normalized as
/// local civil time; the core never converts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvent {
    pub student_id: StudentId,
    pub occurred_at: NaiveDateTime,
    pub direction: Direction,
    pub location: String,
}

/// One dormitory-gate access event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DormEvent {
    pub student_id: StudentId,
    pub occurred_at: NaiveDateTime,
    pub direction: Direction,
    pub building: String,
}

/// One network session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSession {
    pub student_id: StudentId,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub domain: String,
    pub used_vpn: bool,
}

/// One month of grade results: subject name to score, one record per
/// (student, month).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeRecord {
    pub student_id: StudentId,
    pub month: String,
    pub subjects: BTreeMap<String, f64>,
}

impl GradeRecord {
    /// Mean over all subject scores for this month; None when empty.
    pub fn monthly_mean(&self) -> Option<f64> {
        if self.subjects.is_empty() {
            return None;
        }
        Some(self.subjects.values().sum::<f64>() / self.subjects.len() as f64)
    }
}

/// The full population's raw events for one run.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub consumption: Vec<ConsumptionRecord>,
    pub gate: Vec<GateEvent>,
    pub dorm: Vec<DormEvent>,
    pub network: Vec<NetworkSession>,
    pub grades: Vec<GradeRecord>,
}

impl EventBatch {
    /// Every student appearing in any stream, in stable sorted order. The
    /// anomaly fallback depends on this order being deterministic.
    pub fn student_ids(&self) -> Vec<StudentId> {
        let mut ids: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        ids.extend(self.consumption.iter().map(|r| r.student_id.as_str()));
        ids.extend(self.gate.iter().map(|r| r.student_id.as_str()));
        ids.extend(self.dorm.iter().map(|r| r.student_id.as_str()));
        ids.extend(self.network.iter().map(|r| r.student_id.as_str()));
        ids.extend(self.grades.iter().map(|r| r.student_id.as_str()));
        ids.into_iter().map(str::to_string).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.consumption.is_empty()
            && self.gate.is_empty()
            && self.dorm.is_empty()
            && self.network.is_empty()
            && self.grades.is_empty()
    }
}

/// Risk level assigned by the weighted reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Result record for one flagged student; created fresh each run, never
/// mutated, superseded by the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRecord {
    pub student_id: StudentId,
    pub level: RiskLevel,
    /// Ordered, never empty for a flagged student.
    pub reasons: Vec<String>,
    /// Snapshot of the feature values behind the reasons.
    pub features: BTreeMap<String, f64>,
    /// Suggested follow-up focus for the pastoral-care conversation.
    pub talking_points: Vec<String>,
}

/// Ordinal polarity axis for the ideology profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    Positive,
    Negative,
    NotSignificant,
}

/// Three-step ordinal grade used by the intensity and radicalism axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Grade3 {
    Strong,
    Weak,
    NotSignificant,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Positive => write!(f, "positive"),
            Polarity::Negative => write!(f, "negative"),
            Polarity::NotSignificant => write!(f, "not-significant"),
        }
    }
}

impl fmt::Display for Grade3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade3::Strong => write!(f, "strong"),
            Grade3::Weak => write!(f, "weak"),
            Grade3::NotSignificant => write!(f, "not-significant"),
        }
    }
}

/// Ideology / engagement profile for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub student_id: StudentId,
    pub positivity: Polarity,
    pub intensity: Grade3,
    pub radicalism: Grade3,
    pub archetype: String,
    pub strategy: String,
    /// Derived from the student's top visited categories, not the table.
    pub typical_scene: String,
    pub dominant_categories: Vec<String>,
    pub vpn_ratio: f64,
    pub daily_visits: f64,
}

/// Economic-distress tier, ordered from none to severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistressTier {
    None,
    GeneralDifficulty,
    Difficulty,
    SevereDifficulty,
}

impl fmt::Display for DistressTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistressTier::None => write!(f, "none"),
            DistressTier::GeneralDifficulty => write!(f, "general-difficulty"),
            DistressTier::Difficulty => write!(f, "difficulty"),
            DistressTier::SevereDifficulty => write!(f, "severe-difficulty"),
        }
    }
}

/// Economic-distress result for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PovertyRecord {
    pub student_id: StudentId,
    pub tier: DistressTier,
    pub monthly_mean: f64,
    pub lowest_month: f64,
    pub low_months: usize,
    pub trend: f64,
    pub reasons: Vec<String>,
    pub interventions: Vec<String>,
}

/// Raw behavioral stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Consumption,
    Gate,
    Dorm,
    Network,
    Grades,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Consumption,
        StreamKind::Gate,
        StreamKind::Dorm,
        StreamKind::Network,
        StreamKind::Grades,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Consumption => "consumption",
            StreamKind::Gate => "gate",
            StreamKind::Dorm => "dorm",
            StreamKind::Network => "network",
            StreamKind::Grades => "grades",
        }
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "consumption" | "canteen" => Ok(StreamKind::Consumption),
            "gate" | "school-gate" => Ok(StreamKind::Gate),
            "dorm" | "dormitory" => Ok(StreamKind::Dorm),
            "network" => Ok(StreamKind::Network),
            "grades" | "academic" => Ok(StreamKind::Grades),
            other => Err(format!("unknown stream `{other}`")),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unique key of one daily aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub student_id: StudentId,
    pub stream: StreamKind,
    pub date: NaiveDate,
}

/// Stream-specific aggregate payload for one (student, stream, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregatePayload {
    Consumption {
        /// Amount attributed from the month containing this date.
        amount: f64,
        /// Month-over-month change, percent.
        trend_pct: f64,
        /// Minimum monthly amount across the student's history.
        min_month: f64,
    },
    Access {
        total: u32,
        night: u32,
        late_night: u32,
    },
    Network {
        vpn_rate_pct: f64,
        night_flag: bool,
        late_night_flag: bool,
        duration_hours: f64,
    },
    Grades {
        avg_score: f64,
        /// Score delta against the previous recorded month.
        trend: f64,
    },
}

/// One precomputed per-student-per-day summary row.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyAggregate {
    pub student_id: StudentId,
    pub stream: StreamKind,
    pub date: NaiveDate,
    pub payload: AggregatePayload,
}

impl DailyAggregate {
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            student_id: self.student_id.clone(),
            stream: self.stream,
            date: self.date,
        }
    }
}

/// Run-level summary attached to every risk analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub generated_at: NaiveDateTime,
    pub total_students: usize,
    pub flagged_students: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_common_spellings() {
        assert_eq!("In".parse::<Direction>().unwrap(), Direction::In);
        assert_eq!("exit".parse::<Direction>().unwrap(), Direction::Out);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn student_ids_are_sorted_and_deduplicated() {
        let batch = EventBatch {
            consumption: vec![
                ConsumptionRecord {
                    student_id: "s2".into(),
                    month: "2025-01".into(),
                    amount: 100.0,
                },
                ConsumptionRecord {
                    student_id: "s1".into(),
                    month: "2025-01".into(),
                    amount: 100.0,
                },
            ],
            grades: vec![GradeRecord {
                student_id: "s1".into(),
                month: "2025-01".into(),
                subjects: BTreeMap::new(),
            }],
            ..Default::default()
        };
        assert_eq!(batch.student_ids(), vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn monthly_mean_handles_empty_subject_map() {
        let record = GradeRecord {
            student_id: "s1".into(),
            month: "2025-01".into(),
            subjects: BTreeMap::new(),
        };
        assert_eq!(record.monthly_mean(), None);
    }
}
