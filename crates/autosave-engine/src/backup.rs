use std::sync::Arc;

use autosave_core::{DurableStore, Record, RecoverySnapshot, StorageError};
use tracing::debug;

/// Recovery snapshot slot of one session in the durable store.
#[derive(Clone)]
pub struct BackupStore {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl BackupStore {
    pub fn new(store: Arc<dyn DurableStore>, storage_key: &str) -> Self {
        Self {
            store,
            key: format!("{}:backup", storage_key),
        }
    }

    /// Replace the snapshot with `data`.
    pub async fn write(
        &self,
        data: &Record,
        known_version: Option<String>,
    ) -> Result<(), StorageError> {
        let snapshot = RecoverySnapshot::new(data.clone(), known_version);
        let json = serde_json::to_string(&snapshot)?;
        self.store.set(&self.key, &json).await?;
        debug!("Wrote recovery snapshot {}", self.key);
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<RecoverySnapshot>, StorageError> {
        match self.store.get(&self.key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        if self.store.remove(&self.key).await? {
            debug!("Cleared recovery snapshot {}", self.key);
        }
        Ok(())
    }
}
