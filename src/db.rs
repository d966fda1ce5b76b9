use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::aggregate::{RawEventSource, WritePlan, WRITE_CHUNK_SIZE};
use crate::error::CoreError;
use crate::models::{
    AggregateKey, ConsumptionRecord, DailyAggregate, Direction, DormEvent, EventBatch, GateEvent,
    GradeRecord, NetworkSession, StreamKind, StudentId,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        ("2023010101", "Chen Wei", "cs-2023"),
        ("2023010102", "Li Na", "cs-2023"),
        ("2023010103", "Zhang Yu", "math-2023"),
    ];

    for (student_id, full_name, cohort) in students {
        sqlx::query(
            r#"
            INSERT INTO campus_insight.students (id, student_id, full_name, cohort)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (student_id) DO UPDATE
            SET full_name = EXCLUDED.full_name, cohort = EXCLUDED.cohort
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(full_name)
        .bind(cohort)
        .execute(pool)
        .await?;
    }

    let consumption = vec![
        ("2023010101", "2026-05", 520.0),
        ("2023010101", "2026-06", 505.0),
        ("2023010102", "2026-05", 260.0),
        ("2023010102", "2026-06", 240.0),
        ("2023010103", "2026-05", 430.0),
        ("2023010103", "2026-06", 445.0),
    ];
    for (student_id, month, amount) in consumption {
        sqlx::query(
            r#"
            INSERT INTO campus_insight.consumption_records (id, student_id, month, amount)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (student_id, month) DO UPDATE SET amount = EXCLUDED.amount
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(month)
        .bind(amount)
        .execute(pool)
        .await?;
    }

    let gate_events = vec![
        ("2023010101", "2026-06-06T08:10:00", "out", "north"),
        ("2023010101", "2026-06-06T18:30:00", "in", "north"),
        ("2023010102", "2026-06-06T23:15:00", "out", "east"),
        ("2023010102", "2026-06-07T05:40:00", "in", "east"),
    ];
    for (student_id, at, direction, location) in gate_events {
        let occurred_at = NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M:%S")
            .context("invalid seed timestamp")?;
        sqlx::query(
            r#"
            INSERT INTO campus_insight.gate_events (id, student_id, occurred_at, direction, location)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(occurred_at)
        .bind(direction)
        .bind(location)
        .execute(pool)
        .await?;
    }

    let grades = vec![
        ("2023010101", "2026-05", r#"{"math": 88, "physics": 84}"#),
        ("2023010101", "2026-06", r#"{"math": 90, "physics": 86}"#),
        ("2023010102", "2026-05", r#"{"math": 58, "physics": 62}"#),
        ("2023010102", "2026-06", r#"{"math": 52, "physics": 55}"#),
    ];
    for (student_id, month, subjects) in grades {
        let subjects: serde_json::Value =
            serde_json::from_str(subjects).context("invalid seed grade payload")?;
        sqlx::query(
            r#"
            INSERT INTO campus_insight.grade_records (id, student_id, month, subjects)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (student_id, month) DO UPDATE SET subjects = EXCLUDED.subjects
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(month)
        .bind(subjects)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn fetch_student_ids(pool: &PgPool) -> anyhow::Result<Vec<StudentId>> {
    let rows = sqlx::query("SELECT student_id FROM campus_insight.students ORDER BY student_id")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get("student_id")).collect())
}

/// Load the full raw history of every stream for one population. One query
/// per stream, whatever the population size.
pub async fn load_batch(pool: &PgPool, students: &[StudentId]) -> anyhow::Result<EventBatch> {
    Ok(EventBatch {
        consumption: fetch_consumption(pool, students).await?,
        gate: fetch_gate_events(pool, students, None).await?,
        dorm: fetch_dorm_events(pool, students, None).await?,
        network: fetch_network_sessions(pool, students, None).await?,
        grades: fetch_grades(pool, students).await?,
    })
}

pub async fn fetch_consumption(
    pool: &PgPool,
    students: &[StudentId],
) -> anyhow::Result<Vec<ConsumptionRecord>> {
    let rows = sqlx::query(
        "SELECT student_id, month, amount \
         FROM campus_insight.consumption_records \
         WHERE student_id = ANY($1) \
         ORDER BY student_id, month",
    )
    .bind(students)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ConsumptionRecord {
            student_id: row.get("student_id"),
            month: row.get("month"),
            amount: row.get("amount"),
        })
        .collect())
}

pub async fn fetch_gate_events(
    pool: &PgPool,
    students: &[StudentId],
    range: Option<(NaiveDate, NaiveDate)>,
) -> anyhow::Result<Vec<GateEvent>> {
    let mut query = String::from(
        "SELECT student_id, occurred_at, direction, location \
         FROM campus_insight.gate_events \
         WHERE student_id = ANY($1)",
    );
    if range.is_some() {
        query.push_str(" AND occurred_at >= $2 AND occurred_at < $3");
    }
    query.push_str(" ORDER BY student_id, occurred_at");

    let mut rows = sqlx::query(&query).bind(students);
    if let Some((start, end)) = range {
        rows = rows.bind(day_start(start)).bind(day_after(end));
    }

    let mut events = Vec::new();
    for row in rows.fetch_all(pool).await? {
        events.push(GateEvent {
            student_id: row.get("student_id"),
            occurred_at: row.get("occurred_at"),
            direction: parse_direction(row.get("direction"))?,
            location: row.get("location"),
        });
    }
    Ok(events)
}

pub async fn fetch_dorm_events(
    pool: &PgPool,
    students: &[StudentId],
    range: Option<(NaiveDate, NaiveDate)>,
) -> anyhow::Result<Vec<DormEvent>> {
    let mut query = String::from(
        "SELECT student_id, occurred_at, direction, building \
         FROM campus_insight.dorm_events \
         WHERE student_id = ANY($1)",
    );
    if range.is_some() {
        query.push_str(" AND occurred_at >= $2 AND occurred_at < $3");
    }
    query.push_str(" ORDER BY student_id, occurred_at");

    let mut rows = sqlx::query(&query).bind(students);
    if let Some((start, end)) = range {
        rows = rows.bind(day_start(start)).bind(day_after(end));
    }

    let mut events = Vec::new();
    for row in rows.fetch_all(pool).await? {
        events.push(DormEvent {
            student_id: row.get("student_id"),
            occurred_at: row.get("occurred_at"),
            direction: parse_direction(row.get("direction"))?,
            building: row.get("building"),
        });
    }
    Ok(events)
}

pub async fn fetch_network_sessions(
    pool: &PgPool,
    students: &[StudentId],
    range: Option<(NaiveDate, NaiveDate)>,
) -> anyhow::Result<Vec<NetworkSession>> {
    let mut query = String::from(
        "SELECT student_id, started_at, ended_at, domain, used_vpn \
         FROM campus_insight.network_sessions \
         WHERE student_id = ANY($1)",
    );
    // Sessions belong to their start date, so the range filters on
    // started_at only; a session may legitimately end past the range.
    if range.is_some() {
        query.push_str(" AND started_at >= $2 AND started_at < $3");
    }
    query.push_str(" ORDER BY student_id, started_at");

    let mut rows = sqlx::query(&query).bind(students);
    if let Some((start, end)) = range {
        rows = rows.bind(day_start(start)).bind(day_after(end));
    }

    Ok(rows
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| NetworkSession {
            student_id: row.get("student_id"),
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            domain: row.get("domain"),
            used_vpn: row.get("used_vpn"),
        })
        .collect())
}

pub async fn fetch_grades(
    pool: &PgPool,
    students: &[StudentId],
) -> anyhow::Result<Vec<GradeRecord>> {
    let rows = sqlx::query(
        "SELECT student_id, month, subjects \
         FROM campus_insight.grade_records \
         WHERE student_id = ANY($1) \
         ORDER BY student_id, month",
    )
    .bind(students)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::new();
    for row in rows {
        let subjects: serde_json::Value = row.get("subjects");
        let subjects = serde_json::from_value(subjects)
            .context("grade_records.subjects is not a score map")?;
        records.push(GradeRecord {
            student_id: row.get("student_id"),
            month: row.get("month"),
            subjects,
        });
    }
    Ok(records)
}

fn parse_direction(raw: String) -> anyhow::Result<Direction> {
    Direction::from_str(&raw).map_err(|e| anyhow::anyhow!(e))
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn day_after(date: NaiveDate) -> NaiveDateTime {
    day_start(date.succ_opt().unwrap_or(date))
}

/// Existing aggregate keys for a student list and inclusive date range.
pub async fn fetch_aggregate_keys(
    pool: &PgPool,
    students: &[StudentId],
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<BTreeSet<AggregateKey>> {
    let rows = sqlx::query(
        "SELECT student_id, stream, date \
         FROM campus_insight.daily_aggregates \
         WHERE student_id = ANY($1) AND date >= $2 AND date <= $3",
    )
    .bind(students)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut keys = BTreeSet::new();
    for row in rows {
        let stream: String = row.get("stream");
        let stream = StreamKind::from_str(&stream)
            .map_err(|e| anyhow::anyhow!("stored aggregate row: {e}"))?;
        keys.insert(AggregateKey {
            student_id: row.get("student_id"),
            stream,
            date: row.get("date"),
        });
    }
    Ok(keys)
}

/// Outcome of flushing one write plan. A chunk failure stops the flush and is
/// reported here rather than raised; earlier chunks stay committed.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub created: usize,
    pub updated: usize,
    pub error: Option<String>,
}

impl FlushReport {
    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Flush a write plan in bounded chunks: plain inserts for new keys, payload
/// upserts for existing ones.
pub async fn write_aggregates(pool: &PgPool, plan: &WritePlan) -> anyhow::Result<FlushReport> {
    let mut report = FlushReport::default();

    for chunk in plan.creates.chunks(WRITE_CHUNK_SIZE) {
        match insert_chunk(pool, chunk, false).await {
            Ok(()) => report.created += chunk.len(),
            Err(e) => {
                warn!(error = %e, committed = report.created, "aggregate create chunk failed");
                report.error = Some(e.to_string());
                return Ok(report);
            }
        }
    }
    for chunk in plan.updates.chunks(WRITE_CHUNK_SIZE) {
        match insert_chunk(pool, chunk, true).await {
            Ok(()) => report.updated += chunk.len(),
            Err(e) => {
                warn!(error = %e, committed = report.updated, "aggregate update chunk failed");
                report.error = Some(e.to_string());
                return Ok(report);
            }
        }
    }

    Ok(report)
}

async fn insert_chunk(
    pool: &PgPool,
    chunk: &[DailyAggregate],
    upsert: bool,
) -> anyhow::Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }

    let mut sql = String::from(
        "INSERT INTO campus_insight.daily_aggregates (id, student_id, stream, date, payload) VALUES ",
    );
    for i in 0..chunk.len() {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * 5;
        sql.push_str(&format!(
            "(${}, ${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5
        ));
    }
    if upsert {
        sql.push_str(
            " ON CONFLICT (student_id, stream, date) DO UPDATE SET payload = EXCLUDED.payload",
        );
    }

    let mut query = sqlx::query(&sql);
    for row in chunk {
        let payload = serde_json::to_value(&row.payload)
            .context("aggregate payload is not serializable")?;
        query = query
            .bind(Uuid::new_v4())
            .bind(&row.student_id)
            .bind(row.stream.as_str())
            .bind(row.date)
            .bind(payload);
    }
    query.execute(pool).await?;
    Ok(())
}

/// Upper bound on reject samples kept in an import outcome; the total count
/// keeps growing past it.
const MAX_REJECT_SAMPLES: usize = 50;

/// CSV import outcome: accepted rows plus a bounded sample of the rejects
/// with their row numbers.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub inserted: usize,
    pub rejected_total: usize,
    pub rejected: Vec<(usize, String)>,
}

impl ImportReport {
    fn reject(&mut self, line: usize, message: String) {
        self.rejected_total += 1;
        if self.rejected.len() < MAX_REJECT_SAMPLES {
            self.rejected.push((line, message));
        }
    }
}

/// Import one stream's CSV file. Malformed rows are collected, not fatal;
/// unknown students are registered on first sight.
pub async fn import_csv(
    pool: &PgPool,
    stream: StreamKind,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportReport> {
    let mut reader = csv::Reader::from_path(csv_path)
        .map_err(|e| CoreError::SourceRead(e.to_string()))?;
    let mut report = ImportReport::default();

    match stream {
        StreamKind::Consumption => {
            #[derive(serde::Deserialize)]
            struct CsvRow {
                student_id: String,
                month: String,
                amount: f64,
            }
            for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
                let row = match result {
                    Ok(row) => row,
                    Err(e) => {
                        report.reject(line + 2, e.to_string());
                        continue;
                    }
                };
                ensure_student(pool, &row.student_id).await?;
                sqlx::query(
                    r#"
                    INSERT INTO campus_insight.consumption_records (id, student_id, month, amount)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (student_id, month) DO UPDATE SET amount = EXCLUDED.amount
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&row.student_id)
                .bind(&row.month)
                .bind(row.amount)
                .execute(pool)
                .await?;
                report.inserted += 1;
            }
        }
        StreamKind::Gate | StreamKind::Dorm => {
            #[derive(serde::Deserialize)]
            struct CsvRow {
                student_id: String,
                occurred_at: NaiveDateTime,
                direction: String,
                #[serde(default)]
                place: String,
            }
            let (table, place_col) = match stream {
                StreamKind::Gate => ("gate_events", "location"),
                _ => ("dorm_events", "building"),
            };
            let sql = format!(
                "INSERT INTO campus_insight.{table} (id, student_id, occurred_at, direction, {place_col}) \
                 VALUES ($1, $2, $3, $4, $5)"
            );
            for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
                let row = match result {
                    Ok(row) => row,
                    Err(e) => {
                        report.reject(line + 2, e.to_string());
                        continue;
                    }
                };
                let direction = match Direction::from_str(&row.direction) {
                    Ok(direction) => direction,
                    Err(e) => {
                        report.reject(line + 2, e);
                        continue;
                    }
                };
                ensure_student(pool, &row.student_id).await?;
                sqlx::query(&sql)
                    .bind(Uuid::new_v4())
                    .bind(&row.student_id)
                    .bind(row.occurred_at)
                    .bind(direction.to_string())
                    .bind(&row.place)
                    .execute(pool)
                    .await?;
                report.inserted += 1;
            }
        }
        StreamKind::Network => {
            #[derive(serde::Deserialize)]
            struct CsvRow {
                student_id: String,
                started_at: NaiveDateTime,
                ended_at: NaiveDateTime,
                #[serde(default)]
                domain: String,
                #[serde(default)]
                used_vpn: bool,
            }
            for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
                let row = match result {
                    Ok(row) => row,
                    Err(e) => {
                        report.reject(line + 2, e.to_string());
                        continue;
                    }
                };
                ensure_student(pool, &row.student_id).await?;
                sqlx::query(
                    r#"
                    INSERT INTO campus_insight.network_sessions
                    (id, student_id, started_at, ended_at, domain, used_vpn)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&row.student_id)
                .bind(row.started_at)
                .bind(row.ended_at)
                .bind(&row.domain)
                .bind(row.used_vpn)
                .execute(pool)
                .await?;
                report.inserted += 1;
            }
        }
        StreamKind::Grades => {
            #[derive(serde::Deserialize)]
            struct CsvRow {
                student_id: String,
                month: String,
                /// JSON object of subject name to score.
                subjects: String,
            }
            for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
                let row = match result {
                    Ok(row) => row,
                    Err(e) => {
                        report.reject(line + 2, e.to_string());
                        continue;
                    }
                };
                let subjects: serde_json::Value = match serde_json::from_str(&row.subjects) {
                    Ok(value) => value,
                    Err(e) => {
                        report.reject(line + 2, format!("subjects: {e}"));
                        continue;
                    }
                };
                ensure_student(pool, &row.student_id).await?;
                sqlx::query(
                    r#"
                    INSERT INTO campus_insight.grade_records (id, student_id, month, subjects)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (student_id, month) DO UPDATE SET subjects = EXCLUDED.subjects
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&row.student_id)
                .bind(&row.month)
                .bind(subjects)
                .execute(pool)
                .await?;
                report.inserted += 1;
            }
        }
    }

    if report.rejected_total > 0 {
        warn!(
            rejected = report.rejected_total,
            "csv import skipped malformed rows"
        );
    }
    Ok(report)
}

async fn ensure_student(pool: &PgPool, student_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO campus_insight.students (id, student_id, full_name, cohort)
        VALUES ($1, $2, $2, '')
        ON CONFLICT (student_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres-backed bulk reader for the aggregation engine. The trait is sync,
/// so each call blocks on the runtime handle it was built with.
pub struct PgEventSource {
    pool: PgPool,
    handle: tokio::runtime::Handle,
}

impl PgEventSource {
    pub fn new(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self { pool, handle }
    }

    fn run<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, CoreError> {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
            .map_err(|e| CoreError::SourceRead(e.to_string()))
    }
}

impl RawEventSource for PgEventSource {
    fn load_consumption(
        &self,
        students: &[StudentId],
    ) -> Result<Vec<ConsumptionRecord>, CoreError> {
        self.run(fetch_consumption(&self.pool, students))
    }

    fn load_gate_events(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<GateEvent>, CoreError> {
        self.run(fetch_gate_events(&self.pool, students, Some((start, end))))
    }

    fn load_dorm_events(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DormEvent>, CoreError> {
        self.run(fetch_dorm_events(&self.pool, students, Some((start, end))))
    }

    fn load_network_sessions(
        &self,
        students: &[StudentId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NetworkSession>, CoreError> {
        self.run(fetch_network_sessions(
            &self.pool,
            students,
            Some((start, end)),
        ))
    }

    fn load_grades(&self, students: &[StudentId]) -> Result<Vec<GradeRecord>, CoreError> {
        self.run(fetch_grades(&self.pool, students))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_report_caps_reject_samples_but_counts_them_all() {
        let mut report = ImportReport::default();
        for line in 0..MAX_REJECT_SAMPLES + 20 {
            report.reject(line + 2, "bad row".to_string());
        }
        assert_eq!(report.rejected.len(), MAX_REJECT_SAMPLES);
        assert_eq!(report.rejected_total, MAX_REJECT_SAMPLES + 20);
        // The sample keeps the earliest rows.
        assert_eq!(report.rejected[0].0, 2);
    }
}
