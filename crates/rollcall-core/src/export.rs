//! Comma-separated export of a ledger slice.

use crate::types::AttendanceRecord;
use chrono::NaiveDate;
use std::collections::HashMap;
use thiserror::Error;

const HEADER: [&str; 6] = ["Student Name", "Student ID", "Course", "Date", "Time", "Status"];
const LINE_END: &str = "\r\n";

#[derive(Error, Debug, PartialEq)]
pub enum ExportError {
    #[error("no attendance records to export")]
    EmptyExport,
}

/// Whether an export with zero records is acceptable output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportPolicy {
    pub reject_empty: bool,
}

/// Render records as CSV, one row per record in the order given.
///
/// `names` maps student ids to display names; unknown ids render an empty name.
pub fn render_csv(
    records: &[AttendanceRecord],
    names: &HashMap<String, String>,
    policy: ExportPolicy,
) -> Result<Vec<u8>, ExportError> {
    if records.is_empty() && policy.reject_empty {
        return Err(ExportError::EmptyExport);
    }

    let mut out = String::new();
    write_row(&mut out, HEADER.iter().copied());

    for record in records {
        let name = names.get(&record.student_id).map(String::as_str).unwrap_or("");
        let date = record.date.format("%Y-%m-%d").to_string();
        let time = record.time.format("%H:%M:%S").to_string();
        write_row(
            &mut out,
            [
                name,
                record.student_id.as_str(),
                record.course.as_str(),
                date.as_str(),
                time.as_str(),
                record.status.as_str(),
            ],
        );
    }

    Ok(out.into_bytes())
}

/// `attendance_{course}_{date}.csv`, with path separators in the course replaced.
pub fn export_filename(course: &str, date: NaiveDate) -> String {
    let course: String = course
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("attendance_{course}_{}.csv", date.format("%Y-%m-%d"))
}

fn write_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push_str(LINE_END);
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}
