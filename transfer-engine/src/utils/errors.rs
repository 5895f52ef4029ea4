//! Error taxonomy for archive, chunk, pipeline and recovery operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Payload checksum does not match the manifest. Never auto-repaired.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Missing or malformed manifest/payload stream.
    #[error("Invalid archive format: {0}")]
    Format(String),

    /// The job lock is held by another migration.
    #[error("Transfer already in progress: {0}")]
    Conflict(String),

    /// An asset or row failed to copy/insert.
    #[error("Partial write: {0}")]
    PartialWrite(String),

    /// Out-of-bounds or otherwise unusable chunk request. Scoped to one request.
    #[error("Chunk error: {0}")]
    Chunk(String),

    #[error("Invalid chunk data: {0}")]
    InvalidChunk(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl TransferError {
    /// Wrap an error raised inside a pipeline step.
    pub fn step(step: &str, err: TransferError) -> Self {
        TransferError::Step {
            step: step.to_string(),
            message: err.to_string(),
        }
    }

    /// Errors the client is expected to retry (same chunk index, or later for locks).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Conflict(_) | TransferError::Write(_) | TransferError::Chunk(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
