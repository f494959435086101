//! rollcall-core: face matching and attendance export.
//!
//! Resolves probe embeddings to enrolled students by cosine similarity,
//! defines the face extraction capability contract, and renders ledger
//! slices as CSV.

pub mod export;
pub mod extractor;
pub mod matcher;
pub mod types;

pub use export::{export_filename, render_csv, ExportError, ExportPolicy};
pub use extractor::{ExtractError, FaceExtractor, HistogramExtractor, HISTOGRAM_EMBEDDING_DIM};
pub use matcher::{CosineMatcher, MatchError, Matcher};
pub use types::{
    AttendanceRecord, AttendanceStatus, BoundingBox, DetectedFace, Embedding, Gallery, JobState,
    MatchResult, Resolution, Student, StudentId, TrainingJob,
};
