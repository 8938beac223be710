use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::Record;

/// Key/value persistence that survives a process restart.
///
/// Keys are namespaced per session by the engine, so one store can be shared
/// by several sessions.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a value. `None` if the key was never written or was removed.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Returns whether something was removed.
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;
}

/// Latest intended data of a session, written before every risky step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    /// The most recent data handed to the session
    pub data: Record,
    /// When the snapshot was written
    pub written_at: DateTime<Utc>,
    /// Remote version the session last confirmed
    #[serde(default)]
    pub known_version: Option<String>,
}

impl RecoverySnapshot {
    pub fn new(data: Record, known_version: Option<String>) -> Self {
        Self {
            data,
            written_at: Utc::now(),
            known_version,
        }
    }
}

/// A save that could not reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item id
    pub id: Uuid,
    /// Storage key of the session that produced the save
    pub key: String,
    /// Record to send
    pub payload: Record,
    /// When the item was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    #[serde(default)]
    pub attempt_count: u32,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, payload: Record) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }
}
