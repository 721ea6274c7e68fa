//! Error types for OmniDL core

use omnidl_types::{Protocol, TaskId};
use thiserror::Error;

/// Errors that can occur in OmniDL core
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("HTTP {status}: download failed")]
    Protocol { status: u16 },

    /// Server ignored a range request; handled internally by restarting from zero
    #[error("Server does not support range requests")]
    RangeNotSupported,

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(Protocol),

    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download paused")]
    Paused,

    #[error("Connection closed after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CoreError {
    /// Whether this error is the expected outcome of an abort or pause
    /// rather than a transfer failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::Cancelled | CoreError::Paused)
    }
}

// Allow converting to String for hosts that only carry messages
impl From<CoreError> for String {
    fn from(error: CoreError) -> Self {
        error.to_string()
    }
}
