//! Common error types for peersync.

use thiserror::Error;

/// Top-level error type for peersync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A peer could not be reached or a send failed.
    #[error("Network error: {0}")]
    Network(String),

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unexpected message kind or unroutable message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transferred content never matched the advertised checksum.
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// A reconciliation run stopped early.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
