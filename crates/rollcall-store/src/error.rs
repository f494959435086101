use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid vector: expected {expected} dimensions, got {actual}")]
    InvalidVector { expected: usize, actual: usize },
    #[error("student not found: {0}")]
    StudentNotFound(String),
    #[error("student already registered: {0}")]
    DuplicateStudent(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid stored value: {0}")]
    InvalidDbValue(String),
}
