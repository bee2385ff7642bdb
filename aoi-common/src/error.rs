//! Common error types for the AOI agent

use thiserror::Error;

/// Common result type for AOI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the agent crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upload rejected (file type, size or content)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Path or identifier tried to escape the storage roots
    #[error("Security violation: {0}")]
    Security(String),

    /// Artifact or archive write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input or inconsistent entity graph
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors raised because a requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
