//! Student identity lookup and registration.

use crate::db::{now_rfc3339, Database};
use crate::error::{Result, StoreError};
use rollcall_core::Student;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

#[derive(Clone)]
pub struct StudentDirectory {
    db: Database,
}

impl StudentDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a student. Ids and emails are unique.
    pub async fn add(&self, student_id: &str, name: &str, email: &str) -> Result<Student> {
        let (student_id, name, email) = (student_id.trim(), name.trim(), email.trim());
        if student_id.is_empty() || name.is_empty() || email.is_empty() {
            return Err(StoreError::InvalidInput(
                "student_id, name and email are required".into(),
            ));
        }

        let student = Student {
            student_id: student_id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            enrollment_count: 0,
        };
        let row = student.clone();

        self.db
            .call("add_student", move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO students (student_id, name, email, enrollment_count, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![row.student_id, row.name, row.email, now_rfc3339()],
                );
                match inserted {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(StoreError::DuplicateStudent(row.student_id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        tracing::info!(student_id, "student registered");
        Ok(student)
    }

    pub async fn get(&self, student_id: &str) -> Result<Option<Student>> {
        let student_id = student_id.to_string();
        self.db
            .call("get_student", move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT student_id, name, email, enrollment_count
                         FROM students WHERE student_id = ?1",
                        [&student_id],
                        student_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    /// All students, ordered by name (case-insensitive).
    pub async fn list(&self) -> Result<Vec<Student>> {
        self.db
            .call("list_students", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, name, email, enrollment_count
                     FROM students ORDER BY name COLLATE NOCASE, student_id",
                )?;
                let rows = stmt
                    .query_map([], student_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Display names keyed by student id.
    pub async fn names(&self) -> Result<HashMap<String, String>> {
        self.db
            .call("student_names", |conn| {
                let mut stmt = conn.prepare("SELECT student_id, name FROM students")?;
                let names = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<HashMap<_, _>>>()?;
                Ok(names)
            })
            .await
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        student_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        enrollment_count: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn directory() -> StudentDirectory {
        StudentDirectory::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let dir = directory().await;
        dir.add("S1", "John Smith", "john.smith@university.edu").await.unwrap();

        let s = dir.get("S1").await.unwrap().unwrap();
        assert_eq!(s.name, "John Smith");
        assert_eq!(s.email, "john.smith@university.edu");
        assert_eq!(s.enrollment_count, 0);
        assert!(dir.get("S2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = directory().await;
        dir.add("S1", "John Smith", "john@u.edu").await.unwrap();
        let err = dir.add("S1", "Someone Else", "else@u.edu").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStudent(id) if id == "S1"));
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let dir = directory().await;
        dir.add("S1", "John Smith", "john@u.edu").await.unwrap();
        let err = dir.add("S2", "John Again", "john@u.edu").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStudent(_)));
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let dir = directory().await;
        let err = dir.add("  ", "Name", "a@b.c").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_list_orders_by_name_ignoring_case() {
        let dir = directory().await;
        dir.add("S1", "emma Wilson", "emma@u.edu").await.unwrap();
        dir.add("S2", "Michael Chen", "michael@u.edu").await.unwrap();
        dir.add("S3", "Alice Brown", "alice@u.edu").await.unwrap();

        let ids: Vec<_> = dir.list().await.unwrap().into_iter().map(|s| s.student_id).collect();
        assert_eq!(ids, ["S3", "S1", "S2"]);

        let names = dir.names().await.unwrap();
        assert_eq!(names["S2"], "Michael Chen");
    }
}
