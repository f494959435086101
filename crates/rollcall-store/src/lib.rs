//! rollcall-store: durable state for the attendance engine.
//!
//! Embedding galleries, the attendance ledger, student identities, and
//! training job snapshots, all on one SQLite database.

pub mod db;
pub mod embeddings;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod students;

pub use db::{Database, GallerySize, StoreStats};
pub use embeddings::EmbeddingStore;
pub use error::{Result, StoreError};
pub use jobs::JobStore;
pub use ledger::{AppendOutcome, AttendanceLedger, RecordingSummary};
pub use students::StudentDirectory;
