use thiserror::Error;

use crate::Record;

/// Errors raised by a durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Classified failure reported by the remote save contract.
///
/// The engine decides retry, queueing and conflict handling from the variant
/// alone; the message is only carried for display.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SaveFailure {
    /// The remote store rejected the record. Retrying will not help.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Network or server unavailable. Worth retrying.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The remote copy moved past the version this session expected.
    #[error("Remote version conflict (remote version {remote_version:?})")]
    Conflict {
        remote: Record,
        remote_version: Option<String>,
    },
}

impl SaveFailure {
    /// Whether the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SaveFailure::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SaveFailure::Transient("timeout".into()).is_retryable());
        assert!(!SaveFailure::Validation("title required".into()).is_retryable());
        assert!(!SaveFailure::Conflict {
            remote: serde_json::json!({}),
            remote_version: Some("7".into()),
        }
        .is_retryable());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<Record>("{not json").unwrap_err();
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::Serialization(_)));
    }
}
