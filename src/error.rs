//! Error handling for linewatch

use crate::frame_source::CaptureError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Batch status change not allowed from the current state/owner
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Camera / frame source failure
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Embedding service returned an unusable answer
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Circuit breaker is open, call was not attempted
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl Error {
    /// Errors that indicate the shared store itself is unreachable or failing.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Sqlx(_))
    }
}

/// True when a database error is a primary/unique key violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return true;
            }
            // MySQL 1062 / SQLite 1555, 2067 through the Any driver
            let msg = db.message().to_ascii_lowercase();
            msg.contains("duplicate entry") || msg.contains("unique constraint")
        }
        _ => false,
    }
}
