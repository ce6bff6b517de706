use thiserror::Error;

/// Errors from remote object-graph operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The requested path, ref or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The branch moved underneath us; the ref update was not a fast-forward.
    #[error("branch {branch} rejected update: {reason}")]
    Conflict { branch: String, reason: String },

    /// The request failed for a reason worth retrying (network, 5xx, rate limit).
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// A response body or stored object could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The remote rejected the request and retrying will not help.
    #[error("remote returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The backend was configured incorrectly.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal backend failure (e.g. a poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Returns `true` if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::TransientNetwork(_))
    }
}

/// Result alias for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;
