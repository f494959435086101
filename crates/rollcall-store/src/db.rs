//! Connection lifecycle, schema, and shared query plumbing.
//!
//! A single SQLite connection lives on a dedicated thread owned by
//! `tokio_rusqlite`. Every operation is a closure queued to that thread,
//! so writes are applied one at a time in submission order.

use crate::error::{Result, StoreError};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Extra attempts made when SQLite reports the database busy or locked.
const STORAGE_RETRIES: u32 = 1;
const RETRY_DELAY: Duration = Duration::from_millis(50);
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS students (
    student_id       TEXT PRIMARY KEY NOT NULL,
    name             TEXT NOT NULL,
    email            TEXT NOT NULL UNIQUE,
    enrollment_count INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id  TEXT NOT NULL CHECK (student_id <> ''),
    dim         INTEGER NOT NULL,
    vector      BLOB NOT NULL,
    captured_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_student ON embeddings (student_id);

CREATE TABLE IF NOT EXISTS attendance (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    student_id TEXT NOT NULL,
    course     TEXT NOT NULL,
    date       TEXT NOT NULL,
    time       TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'present',
    created_at TEXT NOT NULL,
    UNIQUE (course, date, student_id)
);

CREATE TABLE IF NOT EXISTS training_jobs (
    student_id       TEXT PRIMARY KEY NOT NULL,
    job_id           TEXT NOT NULL,
    state            TEXT NOT NULL,
    progress         INTEGER NOT NULL,
    total_images     INTEGER NOT NULL,
    processed_images INTEGER NOT NULL,
    usable_images    INTEGER NOT NULL,
    gallery_size     INTEGER,
    error            TEXT,
    updated_at       TEXT NOT NULL
);
";

/// Aggregate counts for operational visibility. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub students: u32,
    pub enrolled_students: u32,
    pub embeddings: u32,
    pub attendance_records: u32,
    pub galleries: Vec<GallerySize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GallerySize {
    pub student_id: String,
    pub embeddings: u32,
}

/// Handle to the attendance database. Cheap to clone; all clones share
/// the same connection thread.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open or create the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
        let db = Self { conn };
        db.call("init", |conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Run `op` on the connection thread.
    ///
    /// Busy/locked failures are retried at most [`STORAGE_RETRIES`] times;
    /// anything else is returned to the caller as-is.
    pub(crate) async fn call<F, R>(&self, name: &'static str, op: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            let op = op.clone();
            let result = self.conn.call(move |conn| Ok(op(conn))).await?;
            match result {
                Err(err) if attempt < STORAGE_RETRIES && err.is_busy() => {
                    attempt += 1;
                    tracing::warn!(op = name, attempt, error = %err, "database busy; retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.call("stats", |conn| {
            let count = |sql: &str| -> Result<u32> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
            let students = count("SELECT COUNT(*) FROM students")?;
            let enrolled_students = count("SELECT COUNT(DISTINCT student_id) FROM embeddings")?;
            let embeddings = count("SELECT COUNT(*) FROM embeddings")?;
            let attendance_records = count("SELECT COUNT(*) FROM attendance")?;

            let mut stmt = conn.prepare(
                "SELECT student_id, COUNT(*) FROM embeddings GROUP BY student_id ORDER BY student_id",
            )?;
            let galleries = stmt
                .query_map([], |row| {
                    Ok(GallerySize {
                        student_id: row.get(0)?,
                        embeddings: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(StoreStats {
                students,
                enrolled_students,
                embeddings,
                attendance_records,
                galleries,
            })
        })
        .await
    }
}

impl StoreError {
    pub(crate) fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Map a parse failure on a stored column into a rusqlite conversion error.
pub(crate) fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_database_has_empty_stats() {
        let db = Database::open_in_memory().await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.students, 0);
        assert_eq!(stats.enrolled_students, 0);
        assert_eq!(stats.embeddings, 0);
        assert_eq!(stats.attendance_records, 0);
        assert!(stats.galleries.is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/rollcall.db");
        Database::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_busy_errors_are_retryable() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());

        let locked = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(locked.is_busy());

        assert!(!StoreError::StudentNotFound("S1".into()).is_busy());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_busy());
    }
}
