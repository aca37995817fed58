//! Error types for stratadb.

use std::io;
use thiserror::Error;

/// Result type alias for stratadb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage-engine operations.
///
/// Each non-OK value carries a single message string; nested causes are
/// composed as `"outer: inner"`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from the environment.
    #[error("IO error: {0}")]
    Io(String),

    /// Data corruption detected (bad checksum, bad magic, malformed block).
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Requested entity was not found.
    #[error("NotFound: {0}")]
    NotFound(String),

    /// Operation is not supported by this build or configuration.
    #[error("Not implemented: {0}")]
    NotSupported(String),

    /// Caller supplied an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a not-supported error.
    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an I/O error from a message and a cause.
    pub fn io<S: Into<String>>(msg: S, cause: io::Error) -> Self {
        Error::Io(format!("{}: {}", msg.into(), cause))
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Check if this error indicates a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error came from the environment.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
