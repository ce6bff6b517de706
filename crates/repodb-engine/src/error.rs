use std::time::Duration;

use repodb_remote::RemoteError;
use thiserror::Error;

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The branch moved underneath a write (another writer got there first).
    #[error("conflict on branch {branch}: {reason}")]
    Conflict { branch: String, reason: String },

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// A stored document or remote response could not be decoded.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A name, path or configuration value was rejected before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    /// The write queue's worker has stopped.
    #[error("write queue closed")]
    QueueClosed,

    /// The remote rejected a request in a way retrying will not fix.
    #[error("remote returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::TransientNetwork(_) | Self::Timeout(_)
        )
    }

    /// Returns `true` for a missing path, ref or object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(what) => Self::NotFound(what),
            RemoteError::Conflict { branch, reason } => Self::Conflict { branch, reason },
            RemoteError::TransientNetwork(msg) => Self::TransientNetwork(msg),
            RemoteError::Malformed(msg) => Self::Malformed(msg),
            RemoteError::Api { status, message } => Self::Api { status, message },
            RemoteError::Config(msg) => Self::Validation(msg),
            RemoteError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<repodb_types::TypeError> for EngineError {
    fn from(err: repodb_types::TypeError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
