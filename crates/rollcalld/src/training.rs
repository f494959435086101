//! Enrollment jobs: extract embeddings from a set of images and write them
//! into the student's gallery.
//!
//! At most one job per student is active at a time, and a gallery is never
//! cleared while a job for it is running. The slot table is guarded by a
//! mutex that is only held for check-and-set and snapshot updates, never
//! across extraction or storage awaits.

use crate::extraction::extract_faces;
use rollcall_core::{Embedding, FaceExtractor, JobState, StudentId, TrainingJob};
use rollcall_store::{EmbeddingStore, JobStore, StoreError, StudentDirectory};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Extra attempts at archiving a finished job before it is kept in memory only.
const ARCHIVE_RETRIES: u32 = 1;
const ARCHIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("a training job is already running for student {0}")]
    JobAlreadyRunning(StudentId),
    #[error("gallery for student {0} is being cleared")]
    ClearInProgress(StudentId),
    #[error("not found: {0}")]
    NotFound(StudentId),
    #[error("no usable faces in any enrollment image")]
    NoUsableFaces,
    #[error("no enrollment images supplied")]
    NoImages,
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

/// Clone-safe handle to the job manager.
#[derive(Clone)]
pub struct TrainingJobManager {
    inner: Arc<Inner>,
}

struct Inner {
    slots: Mutex<Slots>,
    embeddings: EmbeddingStore,
    students: StudentDirectory,
    jobs: JobStore,
    extractor: Arc<dyn FaceExtractor>,
    extract_timeout: Duration,
}

/// Per-student in-memory state.
///
/// `jobs` holds active jobs, plus finished jobs whose archive write failed so
/// `status` keeps reporting them. `clearing` marks galleries being wiped.
#[derive(Default)]
struct Slots {
    jobs: HashMap<StudentId, TrainingJob>,
    clearing: HashSet<StudentId>,
}

impl Slots {
    fn check_idle(&self, student_id: &str) -> Result<(), TrainingError> {
        if self.jobs.get(student_id).is_some_and(|j| j.state.is_active()) {
            return Err(TrainingError::JobAlreadyRunning(student_id.to_string()));
        }
        if self.clearing.contains(student_id) {
            return Err(TrainingError::ClearInProgress(student_id.to_string()));
        }
        Ok(())
    }
}

impl TrainingJobManager {
    pub fn new(
        embeddings: EmbeddingStore,
        students: StudentDirectory,
        jobs: JobStore,
        extractor: Arc<dyn FaceExtractor>,
        extract_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots::default()),
                embeddings,
                students,
                jobs,
                extractor,
                extract_timeout,
            }),
        }
    }

    /// Accept an enrollment job and start it in the background.
    ///
    /// With `replace`, the student's existing gallery is swapped for the new
    /// embeddings on success; otherwise they are appended.
    pub async fn start(
        &self,
        student_id: &str,
        images: Vec<Vec<u8>>,
        replace: bool,
    ) -> Result<TrainingJob, TrainingError> {
        if images.is_empty() {
            return Err(TrainingError::NoImages);
        }
        if self.inner.students.get(student_id).await?.is_none() {
            return Err(TrainingError::NotFound(student_id.to_string()));
        }

        let job = TrainingJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            state: JobState::Pending,
            progress: 0,
            total_images: images.len() as u32,
            processed_images: 0,
            usable_images: 0,
            gallery_size: None,
            error: None,
        };

        {
            let mut slots = self.inner.lock();
            if let Err(e) = slots.check_idle(student_id) {
                tracing::info!(student_id, error = %e, "training rejected");
                return Err(e);
            }
            slots.jobs.insert(student_id.to_string(), job.clone());
        }

        if let Err(e) = self.inner.jobs.save(&job).await {
            self.inner.lock().jobs.remove(student_id);
            return Err(e.into());
        }

        tracing::info!(
            student_id,
            job_id = %job.job_id,
            images = images.len(),
            replace,
            "training job accepted"
        );

        let manager = self.clone();
        let student = student_id.to_string();
        let job_id = job.job_id.clone();
        tokio::spawn(async move { manager.run(student, job_id, images, replace).await });

        Ok(job)
    }

    /// Current snapshot of the student's most recent job.
    pub async fn status(&self, student_id: &str) -> Result<TrainingJob, TrainingError> {
        let cached = self.inner.lock().jobs.get(student_id).cloned();
        if let Some(job) = cached {
            return Ok(job);
        }
        self.inner
            .jobs
            .get(student_id)
            .await?
            .ok_or_else(|| TrainingError::NotFound(student_id.to_string()))
    }

    /// Remove every enrolled embedding for a student.
    ///
    /// Rejected while a job for the student is active; no job can start
    /// until the clear has finished.
    pub async fn clear_gallery(&self, student_id: &str) -> Result<(), TrainingError> {
        if self.inner.students.get(student_id).await?.is_none() {
            return Err(TrainingError::NotFound(student_id.to_string()));
        }
        {
            let mut slots = self.inner.lock();
            slots.check_idle(student_id)?;
            slots.clearing.insert(student_id.to_string());
        }

        let result = self.inner.embeddings.clear(student_id).await;
        self.inner.lock().clearing.remove(student_id);
        Ok(result?)
    }

    async fn run(&self, student_id: StudentId, job_id: String, images: Vec<Vec<u8>>, replace: bool) {
        let total = images.len() as u32;
        if let Some(job) = self.update(&student_id, |job| job.state = JobState::Running) {
            if let Err(e) = self.inner.jobs.save(&job).await {
                tracing::warn!(%student_id, error = %e, "failed to persist running job");
            }
        }

        let mut vectors: Vec<Embedding> = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            match extract_faces(&self.inner.extractor, image, self.inner.extract_timeout).await {
                Ok(faces) => {
                    let best = faces.into_iter().max_by(|a, b| {
                        a.region
                            .confidence
                            .partial_cmp(&b.region.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    match best {
                        Some(face) => vectors.push(face.embedding),
                        None => tracing::warn!(%student_id, index, "no face in enrollment image; skipping"),
                    }
                }
                Err(e) => {
                    tracing::warn!(%student_id, index, error = %e, "extraction failed; skipping image");
                }
            }

            let processed = index as u32 + 1;
            let usable = vectors.len() as u32;
            self.update(&student_id, |job| {
                job.processed_images = processed;
                job.usable_images = usable;
                // 100 is reserved for terminal states.
                job.progress = job.progress.max(running_progress(processed, total));
            });
        }

        let outcome = if vectors.is_empty() {
            Err(TrainingError::NoUsableFaces)
        } else if replace {
            self.inner.embeddings.replace(&student_id, &vectors).await.map_err(Into::into)
        } else {
            self.inner.embeddings.enroll(&student_id, &vectors).await.map_err(Into::into)
        };

        let finished = self.update(&student_id, |job| {
            job.progress = 100;
            match &outcome {
                Ok(size) => {
                    job.state = JobState::Succeeded;
                    job.gallery_size = Some(*size);
                }
                Err(e) => {
                    job.state = JobState::Failed;
                    job.error = Some(e.to_string());
                }
            }
        });

        match &outcome {
            Ok(size) => tracing::info!(
                %student_id,
                usable = vectors.len(),
                total,
                gallery_size = size,
                "training job succeeded"
            ),
            Err(e) => tracing::warn!(%student_id, error = %e, "training job failed"),
        }

        // Release the slot only once the archive holds the terminal state;
        // otherwise the finished snapshot stays in memory for `status`.
        let archived = match finished {
            Some(job) => self.archive(&job).await,
            None => false,
        };
        if archived {
            let mut slots = self.inner.lock();
            if slots.jobs.get(&student_id).is_some_and(|j| j.job_id == job_id) {
                slots.jobs.remove(&student_id);
            }
        }
    }

    fn update(&self, student_id: &str, f: impl FnOnce(&mut TrainingJob)) -> Option<TrainingJob> {
        let mut slots = self.inner.lock();
        let job = slots.jobs.get_mut(student_id)?;
        f(job);
        Some(job.clone())
    }

    /// Persist a terminal snapshot, retrying a bounded number of times.
    async fn archive(&self, job: &TrainingJob) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.inner.jobs.save(job).await {
                Ok(()) => return true,
                Err(e) if attempt < ARCHIVE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(student_id = %job.student_id, attempt, error = %e, "archiving training job failed; retrying");
                    tokio::time::sleep(ARCHIVE_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        student_id = %job.student_id,
                        job_id = %job.job_id,
                        error = %e,
                        "failed to archive finished training job; keeping it in memory"
                    );
                    return false;
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the guard leaves only plain data behind.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Progress while running: floor(processed / total * 100), capped at 99.
fn running_progress(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (processed as u64 * 100 / total as u64).min(99) as u8
}
