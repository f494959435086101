//! Attendance ledger keyed by (course, date, student).
//!
//! At most one record exists per key. The uniqueness check and the insert
//! are a single `INSERT .. ON CONFLICT DO NOTHING` statement run on the
//! connection thread, so concurrent submissions for the same student can
//! never both insert.

use crate::db::{conversion_error, now_rfc3339, Database};
use crate::error::Result;
use chrono::{NaiveDate, NaiveTime, Timelike};
use rollcall_core::{AttendanceRecord, AttendanceStatus, MatchResult, StudentId};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::HashSet;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(AttendanceRecord),
    /// A record for this key already exists; nothing was written.
    AlreadyPresent,
}

/// What one photo did to the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub newly_present: Vec<AttendanceRecord>,
    pub already_present: Vec<StudentId>,
    /// Probes that resolved to no enrolled student.
    pub unmatched: usize,
}

#[derive(Clone)]
pub struct AttendanceLedger {
    db: Database,
}

impl AttendanceLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        course: &str,
        date: NaiveDate,
        time: NaiveTime,
        student_id: &str,
    ) -> Result<AppendOutcome> {
        let record = new_record(course, date, time, student_id);
        let outcome = self
            .db
            .call("append_attendance", move |conn| insert_record(conn, record))
            .await?;

        if matches!(outcome, AppendOutcome::AlreadyPresent) {
            tracing::debug!(course, %date, student_id, "already marked present");
        }
        Ok(outcome)
    }

    /// Append a record for every probe that resolved to a student.
    ///
    /// Unresolved probes are only counted. A student resolved more than once
    /// in the same batch is recorded once.
    pub async fn recognize_and_record(
        &self,
        course: &str,
        date: NaiveDate,
        time: NaiveTime,
        matches: &[MatchResult],
    ) -> Result<RecordingSummary> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut unmatched = 0usize;
        for m in matches {
            match m.student_id() {
                Some(id) if seen.insert(id.to_string()) => {
                    candidates.push(new_record(course, date, time, id))
                }
                Some(_) => {}
                None => unmatched += 1,
            }
        }

        let mut summary = self
            .db
            .call("record_batch", move |conn| {
                // One transaction per photo: a failed batch leaves nothing behind,
                // so a retry reports the same outcome a clean run would.
                let tx = conn.transaction()?;
                let mut summary = RecordingSummary::default();
                for record in candidates {
                    let student_id = record.student_id.clone();
                    match insert_record(&tx, record)? {
                        AppendOutcome::Inserted(r) => summary.newly_present.push(r),
                        AppendOutcome::AlreadyPresent => summary.already_present.push(student_id),
                    }
                }
                tx.commit()?;
                Ok(summary)
            })
            .await?;
        summary.unmatched = unmatched;

        tracing::info!(
            course,
            %date,
            inserted = summary.newly_present.len(),
            already_present = summary.already_present.len(),
            unmatched,
            "attendance recorded"
        );
        Ok(summary)
    }

    /// Records for one class session, in insertion order.
    pub async fn query(&self, course: &str, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let course = course.to_string();
        let date = date.format(DATE_FORMAT).to_string();
        self.db
            .call("query_attendance", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, student_id, course, date, time
                     FROM attendance WHERE course = ?1 AND date = ?2 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([&course, &date], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Members of `roster` with no record for the session. Absence is never stored.
    pub async fn absentees(
        &self,
        course: &str,
        date: NaiveDate,
        roster: &[StudentId],
    ) -> Result<Vec<StudentId>> {
        let present: HashSet<StudentId> = self
            .query(course, date)
            .await?
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        Ok(roster
            .iter()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect())
    }
}

fn new_record(course: &str, date: NaiveDate, time: NaiveTime, student_id: &str) -> AttendanceRecord {
    AttendanceRecord {
        id: uuid::Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        course: course.to_string(),
        date,
        time: time.with_nanosecond(0).unwrap_or(time),
        status: AttendanceStatus::Present,
    }
}

fn insert_record(conn: &Connection, record: AttendanceRecord) -> Result<AppendOutcome> {
    let changed = conn.execute(
        "INSERT INTO attendance (id, student_id, course, date, time, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (course, date, student_id) DO NOTHING",
        params![
            record.id,
            record.student_id,
            record.course,
            record.date.format(DATE_FORMAT).to_string(),
            record.time.format(TIME_FORMAT).to_string(),
            record.status.as_str(),
            now_rfc3339(),
        ],
    )?;
    Ok(if changed == 0 {
        AppendOutcome::AlreadyPresent
    } else {
        AppendOutcome::Inserted(record)
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date: String = row.get(3)?;
    let time: String = row.get(4)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        course: row.get(2)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| conversion_error(3, e))?,
        time: NaiveTime::parse_from_str(&time, TIME_FORMAT).map_err(|e| conversion_error(4, e))?,
        status: AttendanceStatus::Present,
    })
}
