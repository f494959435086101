use crate::attendance::{AttendanceError, AttendanceService};
use crate::training::{TrainingError, TrainingJobManager};
use chrono::{NaiveDate, NaiveTime};
use rollcall_store::{Database, StoreError, StudentDirectory};
use std::path::PathBuf;
use std::time::Instant;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct RollcallService {
    pub db: Database,
    pub students: StudentDirectory,
    pub attendance: AttendanceService,
    pub training: TrainingJobManager,
    pub db_path: PathBuf,
    pub embedding_dim: usize,
    pub similarity_threshold: f32,
    pub started_at: Instant,
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallService {
    /// Register a student. Returns the stored record as JSON.
    async fn add_student(
        &self,
        student_id: &str,
        name: &str,
        email: &str,
    ) -> fdo::Result<String> {
        tracing::info!(student_id, "add_student requested");
        let student = self
            .students
            .add(student_id, name, email)
            .await
            .map_err(store_error)?;
        to_json(&student)
    }

    /// Registered students ordered by name.
    async fn list_students(&self) -> fdo::Result<String> {
        let students = self.students.list().await.map_err(store_error)?;
        to_json(&students)
    }

    /// Recognize faces in a photo and mark matched students present.
    ///
    /// `time` is `HH:MM:SS` or `HH:MM`; empty means now.
    async fn submit_photo(
        &self,
        course: &str,
        date: &str,
        time: &str,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let time = parse_time(time)?;
        tracing::info!(course, %date, bytes = image.len(), "submit_photo requested");
        let report = self
            .attendance
            .submit_photo(course, date, time, image)
            .await
            .map_err(attendance_error)?;
        to_json(&report)
    }

    /// Attendance rows for one class session in capture order.
    async fn attendance(&self, course: &str, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let rows = self
            .attendance
            .query(course, date)
            .await
            .map_err(attendance_error)?;
        to_json(&rows)
    }

    /// Roster members not marked present. An empty roster means all students.
    async fn absentees(
        &self,
        course: &str,
        date: &str,
        roster: Vec<String>,
    ) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let absent = self
            .attendance
            .absentees(course, date, roster)
            .await
            .map_err(attendance_error)?;
        to_json(&absent)
    }

    /// CSV export as `(filename, bytes)`.
    async fn export_attendance(&self, course: &str, date: &str) -> fdo::Result<(String, Vec<u8>)> {
        let date = parse_date(date)?;
        self.attendance
            .export(course, date)
            .await
            .map_err(attendance_error)
    }

    /// Accept an enrollment job. Returns the pending job snapshot as JSON.
    async fn start_training(
        &self,
        student_id: &str,
        images: Vec<Vec<u8>>,
        replace: bool,
    ) -> fdo::Result<String> {
        tracing::info!(student_id, images = images.len(), replace, "start_training requested");
        let job = self
            .training
            .start(student_id, images, replace)
            .await
            .map_err(training_error)?;
        to_json(&job)
    }

    async fn training_status(&self, student_id: &str) -> fdo::Result<String> {
        let job = self
            .training
            .status(student_id)
            .await
            .map_err(training_error)?;
        to_json(&job)
    }

    /// Remove every enrolled embedding for a student. Returns the updated
    /// student record as JSON.
    async fn clear_gallery(&self, student_id: &str) -> fdo::Result<String> {
        tracing::info!(student_id, "clear_gallery requested");
        self.training
            .clear_gallery(student_id)
            .await
            .map_err(training_error)?;
        let student = self
            .students
            .get(student_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("not found: {student_id}")))?;
        to_json(&student)
    }

    /// Aggregate counts over the stored data.
    async fn stats(&self) -> fdo::Result<String> {
        let stats = self.db.stats().await.map_err(store_error)?;
        to_json(&stats)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "db_path": self.db_path.display().to_string(),
            "embedding_dim": self.embedding_dim,
            "similarity_threshold": self.similarity_threshold,
            "uptime_secs": self.started_at.elapsed().as_secs(),
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn parse_date(value: &str) -> fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| fdo::Error::InvalidArgs(format!("invalid date {value:?}, expected YYYY-MM-DD")))
}

fn parse_time(value: &str) -> fdo::Result<Option<NaiveTime>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map(Some)
        .map_err(|_| fdo::Error::InvalidArgs(format!("invalid time {value:?}, expected HH:MM[:SS]")))
}

fn store_error(err: StoreError) -> fdo::Error {
    match err {
        StoreError::InvalidVector { .. }
        | StoreError::StudentNotFound(_)
        | StoreError::DuplicateStudent(_)
        | StoreError::InvalidInput(_) => fdo::Error::InvalidArgs(err.to_string()),
        other => {
            tracing::error!(error = %other, "storage failure");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn training_error(err: TrainingError) -> fdo::Error {
    match err {
        TrainingError::Store(e) => store_error(e),
        TrainingError::JobAlreadyRunning(_)
        | TrainingError::ClearInProgress(_)
        | TrainingError::NotFound(_)
        | TrainingError::NoImages
        | TrainingError::NoUsableFaces => fdo::Error::InvalidArgs(err.to_string()),
    }
}

fn attendance_error(err: AttendanceError) -> fdo::Error {
    match err {
        AttendanceError::Store(e) => store_error(e),
        AttendanceError::InvalidArgument(_) | AttendanceError::Export(_) => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        AttendanceError::Extraction(_) | AttendanceError::Match(_) => {
            tracing::warn!(error = %err, "recognition failed");
            fdo::Error::Failed(err.to_string())
        }
    }
}
