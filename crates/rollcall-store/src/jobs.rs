//! Persisted training job snapshots, one row per student.

use crate::db::{now_rfc3339, Database};
use crate::error::{Result, StoreError};
use rollcall_core::{JobState, TrainingJob};
use rusqlite::{params, OptionalExtension};

const INTERRUPTED: &str = "interrupted by daemon restart";

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the student's job row.
    pub async fn save(&self, job: &TrainingJob) -> Result<()> {
        let job = job.clone();
        self.db
            .call("save_job", move |conn| {
                conn.execute(
                    "INSERT INTO training_jobs (
                        student_id, job_id, state, progress, total_images,
                        processed_images, usable_images, gallery_size, error, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (student_id) DO UPDATE SET
                        job_id = excluded.job_id,
                        state = excluded.state,
                        progress = excluded.progress,
                        total_images = excluded.total_images,
                        processed_images = excluded.processed_images,
                        usable_images = excluded.usable_images,
                        gallery_size = excluded.gallery_size,
                        error = excluded.error,
                        updated_at = excluded.updated_at",
                    params![
                        job.student_id,
                        job.job_id,
                        job.state.as_str(),
                        job.progress,
                        job.total_images,
                        job.processed_images,
                        job.usable_images,
                        job.gallery_size,
                        job.error,
                        now_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, student_id: &str) -> Result<Option<TrainingJob>> {
        let student_id = student_id.to_string();
        self.db
            .call("get_job", move |conn| {
                let row = conn
                    .query_row(
                        "SELECT job_id, student_id, state, progress, total_images,
                                processed_images, usable_images, gallery_size, error
                         FROM training_jobs WHERE student_id = ?1",
                        [&student_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(2)?,
                                TrainingJob {
                                    job_id: row.get(0)?,
                                    student_id: row.get(1)?,
                                    state: JobState::Pending,
                                    progress: row.get(3)?,
                                    total_images: row.get(4)?,
                                    processed_images: row.get(5)?,
                                    usable_images: row.get(6)?,
                                    gallery_size: row.get(7)?,
                                    error: row.get(8)?,
                                },
                            ))
                        },
                    )
                    .optional()?;

                row.map(|(state, mut job)| -> Result<TrainingJob> {
                    job.state = JobState::parse(&state).ok_or_else(|| {
                        StoreError::InvalidDbValue(format!("unknown job state: {state}"))
                    })?;
                    Ok(job)
                })
                .transpose()
            })
            .await
    }

    /// Fail every job left active by a previous process. Returns how many were marked.
    pub async fn mark_interrupted(&self) -> Result<usize> {
        let marked = self
            .db
            .call("mark_interrupted", |conn| {
                Ok(conn.execute(
                    "UPDATE training_jobs
                     SET state = 'failed', progress = 100, error = ?1, updated_at = ?2
                     WHERE state IN ('pending', 'running')",
                    params![INTERRUPTED, now_rfc3339()],
                )?)
            })
            .await?;
        if marked > 0 {
            tracing::warn!(count = marked, "marked interrupted training jobs as failed");
        }
        Ok(marked)
    }
}
