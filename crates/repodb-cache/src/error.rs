use repodb_engine::EngineError;
use thiserror::Error;

/// Errors produced by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// `collection()` or a store-wide operation ran before `initialize()`.
    #[error("document store not initialized; call initialize() first")]
    NotInitialized,

    #[error("record {key} not found in {collection}")]
    RecordNotFound { collection: String, key: String },

    /// `create`/`update` need a JSON object.
    #[error("invalid document for {collection}: {reason}")]
    InvalidDocument { collection: String, reason: String },

    /// Some keys could not be written by `save_all`.
    #[error("failed to persist {} record(s) in {collection}: {}", keys.len(), keys.join(", "))]
    Unsaved { collection: String, keys: Vec<String> },
}

impl CacheError {
    /// Returns `true` if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Engine(e) => e.is_retryable(),
            Self::Unsaved { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_their_retry_class() {
        let conflict: CacheError = EngineError::Conflict {
            branch: "main".into(),
            reason: "moved".into(),
        }
        .into();
        assert!(conflict.is_retryable());

        let invalid: CacheError = EngineError::Validation("bad key".into()).into();
        assert!(!invalid.is_retryable());
        assert!(!CacheError::NotInitialized.is_retryable());
    }

    #[test]
    fn unsaved_lists_keys() {
        let err = CacheError::Unsaved {
            collection: "tasks".into(),
            keys: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "failed to persist 2 record(s) in tasks: a, b");
    }
}
