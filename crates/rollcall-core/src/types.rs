use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Externally assigned student identifier.
pub type StudentId = String;

/// Bounding region for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector. Dimensionality is fixed by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]; features from the reference extractor
    /// are non-negative, so they land in [0, 1]. Zero-norm vectors score 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self.values.iter().zip(&other.values).map(|(a, b)| a * b).sum();
        let norms = self.norm() * other.norm();
        if norms > 0.0 {
            dot / norms
        } else {
            0.0
        }
    }

    /// Scale to unit length. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|v| *v /= norm);
        }
        self
    }

    fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// One face found in a submitted image: where it is and what it looks like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// All embeddings enrolled for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub student_id: StudentId,
    pub embeddings: Vec<Embedding>,
}

/// Registered student identity. Profile fields beyond name/email live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: StudentId,
    pub name: String,
    pub email: String,
    /// Number of embeddings currently stored for this student.
    pub enrollment_count: u32,
}

/// How a single probe was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Student(StudentId),
    None,
}

/// Result of matching one probe against every enrolled gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index of the probe region within the submitted photo.
    pub probe: usize,
    pub resolution: Resolution,
    /// Best similarity found, clamped to [0, 1].
    pub score: f32,
}

impl MatchResult {
    pub fn student_id(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Student(id) => Some(id),
            Resolution::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
        }
    }
}

/// One ledger row. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: StudentId,
    pub course: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// Training job lifecycle: `Pending → Running → {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Snapshot of a student's enrollment job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: String,
    pub student_id: StudentId,
    pub state: JobState,
    /// 0–100, non-decreasing. Reaches 100 only in a terminal state.
    pub progress: u8,
    pub total_images: u32,
    pub processed_images: u32,
    pub usable_images: u32,
    /// Gallery size after a successful enrollment.
    pub gallery_size: Option<u32>,
    pub error: Option<String>,
}
