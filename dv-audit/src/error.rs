use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("audit entry not found: {0}")]
    NotFound(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
