use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use autosave_core::{
    AutoSaveConfig, ConflictCase, ConflictResolver, DurableStore, HostSignals, QueueItem, Record,
    RemoteStore, SaveState, SaveStatus, StateObserver, Validator,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::error::{ReplayFailure, Result, SessionError};
use crate::manager::{AttemptOutcome, AutoSaveManager, ManagerOptions};
use crate::queue::ReplayReport;

/// Configures and creates a [`Session`].
pub struct SessionBuilder {
    storage_key: String,
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn DurableStore>,
    config: AutoSaveConfig,
    observers: Vec<Arc<dyn StateObserver>>,
    validator: Option<Arc<dyn Validator>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    signals: Option<HostSignals>,
    baseline: Option<(Record, Option<String>)>,
    online: bool,
}

impl SessionBuilder {
    pub fn new(
        storage_key: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            storage_key: storage_key.into(),
            remote,
            store,
            config: AutoSaveConfig::default(),
            observers: Vec::new(),
            validator: None,
            resolver: None,
            signals: None,
            baseline: None,
            online: true,
        }
    }

    pub fn config(mut self, config: AutoSaveConfig) -> Self {
        self.config = config;
        self
    }

    /// Called synchronously on every save state change.
    pub fn observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Merge strategy used when the remote copy changed underneath us.
    /// Without one, conflicts wait for [`Session::resolve_conflict`].
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Follow connectivity and visibility events from `signals`.
    pub fn signals(mut self, signals: &HostSignals) -> Self {
        self.signals = Some(signals.clone());
        self
    }

    /// Record already held by the remote store, with its version if known.
    pub fn baseline(mut self, record: Record, version: Option<String>) -> Self {
        self.baseline = Some((record, version));
        self
    }

    /// Connectivity assumed until the host reports otherwise.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn build(self) -> Session {
        let manager = AutoSaveManager::new(ManagerOptions {
            storage_key: self.storage_key,
            config: self.config,
            remote: self.remote,
            store: self.store,
            validator: self.validator,
            resolver: self.resolver,
            observers: self.observers,
            baseline: self.baseline,
            online: self.online,
        });

        Session {
            manager,
            signals: self.signals,
            listener: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }
}

/// One editing session: the facade the host talks to.
///
/// Dropping the session runs [`Session::cleanup`].
pub struct Session {
    manager: AutoSaveManager,
    signals: Option<HostSignals>,
    listener: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl Session {
    pub fn builder(
        storage_key: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn DurableStore>,
    ) -> SessionBuilder {
        SessionBuilder::new(storage_key, remote, store)
    }

    /// Restore durable state and start following host events.
    ///
    /// Idempotent: later calls return immediately.
    #[instrument(skip(self), level = "debug", fields(key = %self.manager.storage_key()))]
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let restored = match self.manager.restore().await {
            Ok(restored) => restored,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if let Some(snapshot) = restored {
            info!(
                "Restored unsaved changes for {} from {}",
                self.manager.storage_key(),
                snapshot.written_at
            );
        }

        if let Some(signals) = &self.signals {
            let handle = self.manager.spawn_signal_listener(signals.subscribe());
            if let Some(previous) = self.listener.lock().expect("listener poisoned").replace(handle) {
                previous.abort();
            }
        }

        debug!("Session {} initialized", self.manager.storage_key());
        Ok(())
    }

    /// Record a new value from the editor.
    ///
    /// Returns false when `data` equals the last confirmed save, in which case
    /// nothing is scheduled and any pending attempt is dropped.
    #[instrument(skip(self, data), level = "debug", fields(key = %self.manager.storage_key()))]
    pub async fn update_data(&self, data: Record) -> Result<bool> {
        if self.manager.is_closed() {
            return Err(SessionError::Closed);
        }

        if self.manager.last_saved().as_ref() == Some(&data) {
            if self.manager.get_backup_data().as_ref() != Some(&data) {
                debug!("Update matches last save, dropping pending changes");
                self.manager.revert_to_saved(data).await?;
            }
            return Ok(false);
        }

        // The snapshot goes first: a save finishing right after scheduling
        // clears it, and must not be followed by a stale write.
        let backed_up = self.manager.write_backup(&data).await;
        self.manager.schedule_auto_save(data);
        backed_up?;
        Ok(true)
    }

    /// Save the current data now, skipping the debounce.
    pub async fn force_save(&self) -> Result<AttemptOutcome> {
        match self.manager.get_backup_data() {
            Some(data) => self.manager.force_save(data).await,
            None => Ok(AttemptOutcome::Skipped),
        }
    }

    /// Like [`Session::force_save`], but any outcome short of a confirmed
    /// save is returned as an error.
    pub async fn manual_save(&self) -> Result<AttemptOutcome> {
        info!("Manual save requested for {}", self.manager.storage_key());
        match self.force_save().await? {
            outcome @ (AttemptOutcome::Saved | AttemptOutcome::Skipped) => Ok(outcome),
            outcome => Err(SessionError::SaveFailed(outcome.to_string())),
        }
    }

    /// Latest intended data, confirmed or not.
    pub fn get_recovery_data(&self) -> Option<Record> {
        self.manager.get_backup_data()
    }

    pub async fn retry_failed_saves(&self) -> Result<ReplayReport<ReplayFailure>> {
        self.manager.retry_failed_saves().await
    }

    pub async fn resolve_conflict(&self, merged: Record) -> Result<AttemptOutcome> {
        self.manager.resolve_conflict(merged).await
    }

    /// Drop pending changes: the current data counts as saved.
    pub async fn clear_pending_changes(&self) -> Result<()> {
        self.manager.clear_pending_changes().await
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        self.manager.clear_queue().await
    }

    pub async fn queued_items(&self) -> Vec<QueueItem> {
        self.manager.queued_items().await
    }

    pub fn conflict(&self) -> Option<ConflictCase> {
        self.manager.conflict()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.manager.has_pending_changes()
    }

    pub fn state(&self) -> SaveState {
        self.manager.state()
    }

    pub fn status(&self) -> SaveStatus {
        self.manager.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveStatus> {
        self.manager.subscribe()
    }

    pub fn manager(&self) -> &AutoSaveManager {
        &self.manager
    }

    /// Stop timers and the event listener. Safe to call more than once.
    pub fn cleanup(&self) {
        self.manager.cleanup();
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
