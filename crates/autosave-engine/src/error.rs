use autosave_core::StorageError;
use thiserror::Error;

/// Errors returned by session and manager operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session has an unresolved conflict")]
    ConflictUnresolved,

    #[error("No conflict to resolve")]
    NoConflict,

    #[error("Save failed: {0}")]
    SaveFailed(String),

    #[error("Session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Why a queued item stopped a replay pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayFailure {
    #[error("host is offline")]
    Offline,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("remote version conflict")]
    Conflict,
}
