//! Batched daily-aggregate materialization.
//!
//! The defining property of this engine is its read pattern: exactly one bulk
//! read per stream for the whole student list and date range, never
//! per-student or per-day. Everything after that is in-memory grouping by
//! (student, date) or (student, month), so the row count of the output never
//! changes the number of storage round trips on the read side.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Timelike};
use tracing::info;

use crate::config::AnalysisConfig;
use crate::error::CoreError;
use crate::models::{
    AggregateKey, AggregatePayload, ConsumptionRecord, DailyAggregate, DormEvent, GateEvent,
    GradeRecord, NetworkSession, StreamKind, StudentId,
};

/// Upper bound on rows per storage flush, sized to stay well under typical
/// per-statement bind-parameter limits.
pub const WRITE_CHUNK_SIZE: usize = 500;

/// Bulk read access to the five raw event streams. Month-keyed streams
/// (consumption, grades) are read in full per student; time-stamped streams
/// take the date range.
pub trait RawEventSource {
    fn load_consumption(&self, students: &[StudentId]) -> Result<Vec<ConsumptionRecord>, CoreError>;
    fn load_gate_events(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<GateEvent>, CoreError>;
    fn load_dorm_events(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DormEvent>, CoreError>;
    fn load_network_sessions(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NetworkSession>, CoreError>;
    fn load_grades(&self, students: &[StudentId]) -> Result<Vec<GradeRecord>, CoreError>;
}

/// Aggregate rows split by whether their key already exists in storage.
/// Callers flush each list in [`WRITE_CHUNK_SIZE`] chunks.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub creates: Vec<DailyAggregate>,
    pub updates: Vec<DailyAggregate>,
}

impl WritePlan {
    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

/// Compute every (student, stream, date) aggregate for the inclusive range
/// and split the rows against the already-existing key set. Deterministic:
/// rows come out ordered by stream, then student input order, then date.
pub fn aggregate_range<S: RawEventSource>(
    source: &S,
    students: &[StudentId],
    start: NaiveDate,
    end: NaiveDate,
    existing: &BTreeSet<AggregateKey>,
    config: &AnalysisConfig,
) -> Result<WritePlan, CoreError> {
    let dates = date_range(start, end);
    if students.is_empty() || dates.is_empty() {
        return Ok(WritePlan::default());
    }

    let consumption = source.load_consumption(students)?;
    let gate = source.load_gate_events(students, start, end)?;
    let dorm = source.load_dorm_events(students, start, end)?;
    let network = source.load_network_sessions(students, start, end)?;
    let grades = source.load_grades(students)?;

    let consumption_rows = consumption_aggregates(students, &dates, &consumption);
    let gate_rows = access_aggregates(students, &dates, StreamKind::Gate, gate_hours(&gate), config);
    let dorm_rows = access_aggregates(students, &dates, StreamKind::Dorm, dorm_hours(&dorm), config);
    let network_rows = network_aggregates(students, &dates, &network, config);
    let grade_rows = grade_aggregates(students, &dates, &grades);

    let mut plan = WritePlan::default();
    for row in consumption_rows
        .into_iter()
        .chain(gate_rows)
        .chain(dorm_rows)
        .chain(network_rows)
        .chain(grade_rows)
    {
        if existing.contains(&row.key()) {
            plan.updates.push(row);
        } else {
            plan.creates.push(row);
        }
    }

    info!(
        students = students.len(),
        days = dates.len(),
        creates = plan.creates.len(),
        updates = plan.updates.len(),
        "aggregation plan built"
    );
    Ok(plan)
}

fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        current = match current.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    dates
}

fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Month-keyed amounts broadcast to every date in that month, with a
/// month-over-month percentage trend and the historical minimum.
fn consumption_aggregates(
    students: &[StudentId],
    dates: &[NaiveDate],
    records: &[ConsumptionRecord],
) -> Vec<DailyAggregate> {
    let mut by_student: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for r in records {
        by_student
            .entry(r.student_id.as_str())
            .or_default()
            .insert(r.month.as_str(), r.amount);
    }

    let mut rows = Vec::new();
    for student in students {
        let months = by_student.get(student.as_str()).cloned().unwrap_or_default();
        let trends = month_over_month(&months, |current, prev| {
            if prev > 0.0 {
                round2((current - prev) / prev * 100.0)
            } else {
                0.0
            }
        });
        let min_month = months
            .values()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let min_month = if min_month.is_finite() { min_month } else { 0.0 };

        for &date in dates {
            let key = month_key(date);
            rows.push(DailyAggregate {
                student_id: student.clone(),
                stream: StreamKind::Consumption,
                date,
                payload: AggregatePayload::Consumption {
                    amount: months.get(key.as_str()).copied().unwrap_or(0.0),
                    trend_pct: trends.get(key.as_str()).copied().unwrap_or(0.0),
                    min_month,
                },
            });
        }
    }
    rows
}

/// Per-month deltas over the sorted month sequence; the first month gets 0.
fn month_over_month<'a>(
    months: &BTreeMap<&'a str, f64>,
    delta: impl Fn(f64, f64) -> f64,
) -> BTreeMap<&'a str, f64> {
    let mut trends = BTreeMap::new();
    let mut prev: Option<f64> = None;
    for (&month, &value) in months {
        trends.insert(month, prev.map_or(0.0, |p| delta(value, p)));
        prev = Some(value);
    }
    trends
}

fn gate_hours(events: &[GateEvent]) -> Vec<(&str, NaiveDate, u32)> {
    events
        .iter()
        .map(|e| {
            (
                e.student_id.as_str(),
                e.occurred_at.date(),
                e.occurred_at.hour(),
            )
        })
        .collect()
}

fn dorm_hours(events: &[DormEvent]) -> Vec<(&str, NaiveDate, u32)> {
    events
        .iter()
        .map(|e| {
            (
                e.student_id.as_str(),
                e.occurred_at.date(),
                e.occurred_at.hour(),
            )
        })
        .collect()
}

/// Per-date total / night / late-night counts; gate and dorm share the shape.
fn access_aggregates(
    students: &[StudentId],
    dates: &[NaiveDate],
    stream: StreamKind,
    events: Vec<(&str, NaiveDate, u32)>,
    config: &AnalysisConfig,
) -> Vec<DailyAggregate> {
    let mut counts: BTreeMap<(&str, NaiveDate), (u32, u32, u32)> = BTreeMap::new();
    for (student, date, hour) in events {
        let entry = counts.entry((student, date)).or_default();
        entry.0 += 1;
        if config.windows.is_night(hour) {
            entry.1 += 1;
        } else if config.windows.is_late_night(hour) {
            entry.2 += 1;
        }
    }

    let mut rows = Vec::new();
    for student in students {
        for &date in dates {
            let (total, night, late_night) = counts
                .get(&(student.as_str(), date))
                .copied()
                .unwrap_or_default();
            rows.push(DailyAggregate {
                student_id: student.clone(),
                stream,
                date,
                payload: AggregatePayload::Access {
                    total,
                    night,
                    late_night,
                },
            });
        }
    }
    rows
}

/// Per-date VPN rate, total duration, and whether any session touches the
/// night or late-night window at either endpoint. Sessions key on their start
/// date.
fn network_aggregates(
    students: &[StudentId],
    dates: &[NaiveDate],
    sessions: &[NetworkSession],
    config: &AnalysisConfig,
) -> Vec<DailyAggregate> {
    #[derive(Default, Clone, Copy)]
    struct DayStats {
        total: u32,
        vpn: u32,
        duration_hours: f64,
        night: bool,
        late_night: bool,
    }

    let mut stats: BTreeMap<(&str, NaiveDate), DayStats> = BTreeMap::new();
    for s in sessions {
        let entry = stats
            .entry((s.student_id.as_str(), s.started_at.date()))
            .or_default();
        entry.total += 1;
        if s.used_vpn {
            entry.vpn += 1;
        }
        let seconds = (s.ended_at - s.started_at).num_seconds().max(0);
        entry.duration_hours += seconds as f64 / 3600.0;
        let (start_hour, end_hour) = (s.started_at.hour(), s.ended_at.hour());
        if config.windows.is_night(start_hour) || config.windows.is_night(end_hour) {
            entry.night = true;
        }
        if config.windows.is_late_night(start_hour) || config.windows.is_late_night(end_hour) {
            entry.late_night = true;
        }
    }

    let mut rows = Vec::new();
    for student in students {
        for &date in dates {
            let day = stats
                .get(&(student.as_str(), date))
                .copied()
                .unwrap_or_default();
            let vpn_rate_pct = if day.total > 0 {
                round2(day.vpn as f64 / day.total as f64 * 100.0)
            } else {
                0.0
            };
            rows.push(DailyAggregate {
                student_id: student.clone(),
                stream: StreamKind::Network,
                date,
                payload: AggregatePayload::Network {
                    vpn_rate_pct,
                    night_flag: day.night,
                    late_night_flag: day.late_night,
                    duration_hours: round2(day.duration_hours),
                },
            });
        }
    }
    rows
}

/// Monthly mean score broadcast to every date in that month; the trend is the
/// raw score delta against the previous recorded month, not a percentage.
fn grade_aggregates(
    students: &[StudentId],
    dates: &[NaiveDate],
    records: &[GradeRecord],
) -> Vec<DailyAggregate> {
    let mut by_student: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for r in records {
        if let Some(mean) = r.monthly_mean() {
            by_student
                .entry(r.student_id.as_str())
                .or_default()
                .insert(r.month.as_str(), mean);
        }
    }

    let mut rows = Vec::new();
    for student in students {
        let months = by_student.get(student.as_str()).cloned().unwrap_or_default();
        let trends = month_over_month(&months, |current, prev| round2(current - prev));

        for &date in dates {
            let key = month_key(date);
            rows.push(DailyAggregate {
                student_id: student.clone(),
                stream: StreamKind::Grades,
                date,
                payload: AggregatePayload::Grades {
                    avg_score: months.get(key.as_str()).copied().unwrap_or(0.0),
                    trend: trends.get(key.as_str()).copied().unwrap_or(0.0),
                },
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap as Map;

    #[derive(Default)]
    struct MemorySource {
        consumption: Vec<ConsumptionRecord>,
        gate: Vec<GateEvent>,
        dorm: Vec<DormEvent>,
        network: Vec<NetworkSession>,
        grades: Vec<GradeRecord>,
        calls: RefCell<Map<&'static str, usize>>,
    }

    impl MemorySource {
        fn record(&self, name: &'static str) {
            *self.calls.borrow_mut().entry(name).or_default() += 1;
        }
    }

    impl RawEventSource for MemorySource {
        fn load_consumption(
            &self,
            _students: &[StudentId],
        ) -> Result<Vec<ConsumptionRecord>, CoreError> {
            self.record("consumption");
            Ok(self.consumption.clone())
        }

        fn load_gate_events(
            &self,
            _students: &[StudentId],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<GateEvent>, CoreError> {
            self.record("gate");
            Ok(self.gate.clone())
        }

        fn load_dorm_events(
            &self,
            _students: &[StudentId],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<DormEvent>, CoreError> {
            self.record("dorm");
            Ok(self.dorm.clone())
        }

        fn load_network_sessions(
            &self,
            _students: &[StudentId],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<NetworkSession>, CoreError> {
            self.record("network");
            Ok(self.network.clone())
        }

        fn load_grades(&self, _students: &[StudentId]) -> Result<Vec<GradeRecord>, CoreError> {
            self.record("grades");
            Ok(self.grades.clone())
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn at(day: u32, hour: u32) -> chrono::NaiveDateTime {
        date(day).and_hms_opt(hour, 0, 0).unwrap()
    }

    fn students(ids: &[&str]) -> Vec<StudentId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn one_bulk_read_per_stream_regardless_of_scale() {
        let source = MemorySource::default();
        let ids = students(&["a", "b", "c", "d", "e"]);
        aggregate_range(
            &source,
            &ids,
            date(1),
            date(28),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();
        let calls = source.calls.borrow();
        for stream in ["consumption", "gate", "dorm", "network", "grades"] {
            assert_eq!(calls.get(stream), Some(&1), "{stream} read more than once");
        }
    }

    #[test]
    fn rerun_is_idempotent() {
        let mut source = MemorySource::default();
        source.consumption.push(ConsumptionRecord {
            student_id: "a".into(),
            month: "2025-03".into(),
            amount: 420.0,
        });
        source.gate.push(GateEvent {
            student_id: "a".into(),
            occurred_at: at(2, 22),
            direction: crate::models::Direction::Out,
            location: "north".into(),
        });
        let ids = students(&["a"]);
        let config = AnalysisConfig::default();

        let first =
            aggregate_range(&source, &ids, date(1), date(3), &BTreeSet::new(), &config).unwrap();
        let existing: BTreeSet<AggregateKey> =
            first.creates.iter().map(DailyAggregate::key).collect();
        let second =
            aggregate_range(&source, &ids, date(1), date(3), &existing, &config).unwrap();

        assert!(second.creates.is_empty(), "rerun must overwrite, not append");
        assert_eq!(second.updates.len(), first.creates.len());
        let first_payloads: Vec<_> = first.creates.iter().map(|r| &r.payload).collect();
        let second_payloads: Vec<_> = second.updates.iter().map(|r| &r.payload).collect();
        assert_eq!(first_payloads, second_payloads);
    }

    #[test]
    fn month_amounts_broadcast_with_trend_and_minimum() {
        let mut source = MemorySource::default();
        for (month, amount) in [("2025-02", 400.0), ("2025-03", 500.0)] {
            source.consumption.push(ConsumptionRecord {
                student_id: "a".into(),
                month: month.into(),
                amount,
            });
        }
        let plan = aggregate_range(
            &source,
            &students(&["a"]),
            date(1),
            date(2),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        let rows: Vec<_> = plan
            .creates
            .iter()
            .filter(|r| r.stream == StreamKind::Consumption)
            .collect();
        assert_eq!(rows.len(), 2);
        for row in rows {
            match &row.payload {
                AggregatePayload::Consumption {
                    amount,
                    trend_pct,
                    min_month,
                } => {
                    assert_eq!(*amount, 500.0);
                    assert_eq!(*trend_pct, 25.0);
                    assert_eq!(*min_month, 400.0);
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn access_windows_split_night_and_late_night() {
        let mut source = MemorySource::default();
        for hour in [8, 22, 23, 2] {
            source.dorm.push(DormEvent {
                student_id: "a".into(),
                occurred_at: at(1, hour),
                direction: crate::models::Direction::In,
                building: "b1".into(),
            });
        }
        let plan = aggregate_range(
            &source,
            &students(&["a"]),
            date(1),
            date(1),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        let row = plan
            .creates
            .iter()
            .find(|r| r.stream == StreamKind::Dorm)
            .unwrap();
        assert_eq!(
            row.payload,
            AggregatePayload::Access {
                total: 4,
                night: 2,
                late_night: 1,
            }
        );
    }

    #[test]
    fn network_flags_fire_when_either_endpoint_touches_the_window() {
        let mut source = MemorySource::default();
        // Starts before the night window, ends inside it.
        source.network.push(NetworkSession {
            student_id: "a".into(),
            started_at: at(1, 21),
            ended_at: at(1, 22),
            domain: "example.com".into(),
            used_vpn: true,
        });
        source.network.push(NetworkSession {
            student_id: "a".into(),
            started_at: at(1, 10),
            ended_at: at(1, 11),
            domain: "example.com".into(),
            used_vpn: false,
        });
        let plan = aggregate_range(
            &source,
            &students(&["a"]),
            date(1),
            date(1),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        let row = plan
            .creates
            .iter()
            .find(|r| r.stream == StreamKind::Network)
            .unwrap();
        assert_eq!(
            row.payload,
            AggregatePayload::Network {
                vpn_rate_pct: 50.0,
                night_flag: true,
                late_night_flag: false,
                duration_hours: 2.0,
            }
        );
    }

    #[test]
    fn session_overrunning_the_range_end_counts_on_its_start_date() {
        let mut source = MemorySource::default();
        // Starts 23:00 on the last requested day, ends 01:00 the next day.
        source.network.push(NetworkSession {
            student_id: "a".into(),
            started_at: at(2, 23),
            ended_at: at(3, 1),
            domain: "example.com".into(),
            used_vpn: true,
        });
        let plan = aggregate_range(
            &source,
            &students(&["a"]),
            date(1),
            date(2),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        let row = plan
            .creates
            .iter()
            .find(|r| r.stream == StreamKind::Network && r.date == date(2))
            .unwrap();
        assert_eq!(
            row.payload,
            AggregatePayload::Network {
                vpn_rate_pct: 100.0,
                night_flag: true,
                late_night_flag: true,
                duration_hours: 2.0,
            }
        );
    }

    #[test]
    fn grade_trend_is_a_score_delta_not_a_percentage() {
        let mut source = MemorySource::default();
        for (month, score) in [("2025-02", 80.0), ("2025-03", 72.0)] {
            source.grades.push(GradeRecord {
                student_id: "a".into(),
                month: month.into(),
                subjects: [("math".to_string(), score)].into_iter().collect(),
            });
        }
        let plan = aggregate_range(
            &source,
            &students(&["a"]),
            date(1),
            date(1),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        let row = plan
            .creates
            .iter()
            .find(|r| r.stream == StreamKind::Grades)
            .unwrap();
        assert_eq!(
            row.payload,
            AggregatePayload::Grades {
                avg_score: 72.0,
                trend: -8.0,
            }
        );
    }

    #[test]
    fn student_without_data_still_gets_zero_rows_for_every_stream() {
        let source = MemorySource::default();
        let plan = aggregate_range(
            &source,
            &students(&["ghost"]),
            date(1),
            date(2),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();
        // 2 days x 5 streams.
        assert_eq!(plan.creates.len(), 10);
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn empty_student_list_yields_empty_plan_without_reads() {
        let source = MemorySource::default();
        let plan = aggregate_range(
            &source,
            &[],
            date(1),
            date(5),
            &BTreeSet::new(),
            &AnalysisConfig::default(),
        )
        .unwrap();
        assert!(plan.is_empty());
        assert!(source.calls.borrow().is_empty());
    }
}
