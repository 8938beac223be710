use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use autosave_core::{DurableStore, StorageError};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument};

/// File-backed durable store.
///
/// Each key maps to `{root}/{sha256(key)}.json`, so arbitrary keys are safe
/// as file names. Writes go through a unique temp file and a rename, so a
/// crash mid-write leaves either the old value or the new one.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: the platform's local data directory, under `autosave/`.
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("autosave")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("key must not be empty".to_string()));
        }
        let digest = Sha256::digest(key.as_bytes());
        Ok(self.root.join(format!("{}.json", hex::encode(digest))))
    }
}

#[async_trait]
impl DurableStore for LocalFileStore {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create store directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        // Unique temp name: concurrent writers of one key must not share it
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, value).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(format!(
                "Failed to rename temp file to {}: {}",
                path.display(),
                e
            )));
        }

        debug!("Stored {} bytes for key {} at {}", value.len(), key, path.display());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed key {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
