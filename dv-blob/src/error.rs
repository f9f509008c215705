use thiserror::Error;

/// Error kinds surfaced by the blob engine.
///
/// These are the matchable cases a caller needs to branch on (the
/// [`crate::Ingestor`] treats [`BlobError::AlreadyExists`] as the dedup
/// path, [`crate::GarbageCollector`] treats [`BlobError::NotFound`] as
/// "already gone, skip"). Anything else propagates as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
