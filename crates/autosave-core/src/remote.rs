use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SaveFailure;
use crate::Record;

/// One save sent to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// Storage key of the session
    pub key: String,
    /// Record to persist
    pub data: Record,
    /// Version the session believes the remote holds. `None` skips the check.
    pub expected_version: Option<String>,
}

/// Acknowledgment of a successful remote save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    /// Version assigned by the remote store, if it reports one
    pub version: Option<String>,
    /// When the save was confirmed
    pub saved_at: DateTime<Utc>,
}

impl SaveReceipt {
    pub fn new(version: Option<String>) -> Self {
        Self {
            version,
            saved_at: Utc::now(),
        }
    }
}

/// The remote save contract.
///
/// Implementations must reject with `SaveFailure::Conflict` when the remote
/// version differs from `expected_version` rather than overwrite.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn save(&self, request: SaveRequest) -> Result<SaveReceipt, SaveFailure>;
}

/// Field-level validation run before every attempt.
pub trait Validator: Send + Sync {
    /// `Err` carries a description of what is wrong with the record.
    fn validate(&self, data: &Record) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&Record) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, data: &Record) -> Result<(), String> {
        self(data)
    }
}
