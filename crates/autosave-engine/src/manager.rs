//! Save state machine for one editing session.
//!
//! Turns a stream of updates into as few remote saves as possible: updates are
//! debounced, attempts are serialized through a single in-flight lock, transient
//! failures are retried with backoff and then parked in the offline queue, and
//! conflicts are handed to the resolver.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use autosave_core::{
    AutoSaveConfig, ConflictCase, ConflictResolver, DurableStore, HostEvent, QueueItem, Record,
    RecoverySnapshot, RemoteStore, SaveFailure, SaveReceipt, SaveRequest, SaveState, SaveStatus,
    StateObserver, StorageError, Validator,
};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff;
use crate::backup::BackupStore;
use crate::connectivity::Connectivity;
use crate::error::{ReplayFailure, Result, SessionError};
use crate::notify::StateNotifier;
use crate::queue::{OfflineQueue, ReplayReport};

/// How a save attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The remote store acknowledged the record.
    Saved,
    /// The record waits in the offline queue.
    Queued { offline: bool },
    /// The record failed validation, locally or remotely.
    Rejected(String),
    /// Every retry failed; the record was queued.
    Exhausted { last_error: String },
    /// The remote copy diverged and no merge was saved.
    Conflict,
    /// Nothing to save.
    Skipped,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Saved => f.write_str("saved"),
            AttemptOutcome::Queued { offline: true } => f.write_str("queued while offline"),
            AttemptOutcome::Queued { offline: false } => f.write_str("queued behind a stalled sync"),
            AttemptOutcome::Rejected(msg) => write!(f, "rejected: {}", msg),
            AttemptOutcome::Exhausted { last_error } => {
                write!(f, "retries exhausted ({}), queued for later", last_error)
            }
            AttemptOutcome::Conflict => f.write_str("remote copy changed"),
            AttemptOutcome::Skipped => f.write_str("nothing to save"),
        }
    }
}

/// Everything a manager is built from.
pub(crate) struct ManagerOptions {
    pub storage_key: String,
    pub config: AutoSaveConfig,
    pub remote: Arc<dyn RemoteStore>,
    pub store: Arc<dyn DurableStore>,
    pub validator: Option<Arc<dyn Validator>>,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    pub observers: Vec<Arc<dyn StateObserver>>,
    pub baseline: Option<(Record, Option<String>)>,
    pub online: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: SaveState,
    /// Latest intended data (the recovery snapshot)
    current: Option<Record>,
    /// Last data the remote store acknowledged
    last_saved: Option<Record>,
    known_version: Option<String>,
    last_saved_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    conflict: Option<ConflictCase>,
    /// Queued item whose replay raised `conflict`
    conflict_item: Option<Uuid>,
    /// Bumped by every schedule and cancel; stale scheduled attempts skip
    generation: u64,
}

impl Shared {
    fn has_pending_changes(&self) -> bool {
        match &self.current {
            Some(current) => self.last_saved.as_ref() != Some(current),
            None => false,
        }
    }

    fn move_to(&mut self, next: SaveState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!("Ignoring save state transition {} -> {}", self.state, next);
            return false;
        }
        debug!("Save state {} -> {}", self.state, next);
        self.state = next;
        true
    }

    /// Finish an attempt, unless a newer update moved the state on meanwhile.
    fn settle(&mut self, next: SaveState) {
        if self.state == SaveState::Saving {
            self.move_to(next);
        }
    }

    fn record_saved(&mut self, data: &Record, receipt: &SaveReceipt) {
        self.last_saved = Some(data.clone());
        if receipt.version.is_some() {
            self.known_version = receipt.version.clone();
        }
        self.last_saved_at = Some(receipt.saved_at);
        self.last_error = None;
    }
}

/// Result of sending one record with retries.
enum Sent {
    Saved(SaveReceipt),
    Rejected(String),
    Offline,
    Exhausted(String),
    Conflict {
        remote: Record,
        remote_version: Option<String>,
    },
}

enum AttemptData {
    Given(Record),
    /// Whatever is current once the in-flight lock is held, if no newer
    /// schedule or cancel happened since the timer was armed
    Scheduled(u64),
}

struct Inner {
    storage_key: String,
    config: AutoSaveConfig,
    remote: Arc<dyn RemoteStore>,
    validator: Option<Arc<dyn Validator>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    backup: BackupStore,
    queue: OfflineQueue,
    connectivity: Connectivity,
    notifier: StateNotifier,
    shared: Mutex<Shared>,
    /// Held for the whole of every attempt and replay pass
    in_flight: AsyncMutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Owns the save state machine, the debounce timer, retries and backups.
///
/// Cloning yields another handle to the same session state.
#[derive(Clone)]
pub struct AutoSaveManager {
    inner: Arc<Inner>,
}

impl AutoSaveManager {
    pub(crate) fn new(options: ManagerOptions) -> Self {
        let mut config = options.config;
        config.max_retries = config.attempt_budget();

        let mut shared = Shared::default();
        if let Some((record, version)) = options.baseline {
            shared.current = Some(record.clone());
            shared.last_saved = Some(record);
            shared.known_version = version;
        }

        let inner = Inner {
            backup: BackupStore::new(options.store.clone(), &options.storage_key),
            queue: OfflineQueue::new(options.store, &options.storage_key),
            storage_key: options.storage_key,
            config,
            remote: options.remote,
            validator: options.validator,
            resolver: options.resolver,
            connectivity: Connectivity::new(options.online),
            notifier: StateNotifier::new(options.observers),
            shared: Mutex::new(shared),
            in_flight: AsyncMutex::new(()),
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SaveState {
        self.inner.lock().state
    }

    pub fn status(&self) -> SaveStatus {
        let shared = self.inner.lock();
        self.inner.status_of(&shared)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveStatus> {
        self.inner.notifier.subscribe()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.inner.lock().has_pending_changes()
    }

    pub fn last_saved(&self) -> Option<Record> {
        self.inner.lock().last_saved.clone()
    }

    pub fn conflict(&self) -> Option<ConflictCase> {
        self.inner.lock().conflict.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Latest intended data, confirmed or not.
    pub fn get_backup_data(&self) -> Option<Record> {
        self.inner.lock().current.clone()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub async fn queued_items(&self) -> Vec<QueueItem> {
        self.inner.queue.items().await
    }

    /// Restart the debounce window with `data` as the value to save.
    ///
    /// Calls within one window coalesce: only the value current when the timer
    /// fires is sent.
    pub fn schedule_auto_save(&self, data: Record) {
        self.inner.schedule(data);
    }

    /// Cancel any pending debounce and save `data` now.
    ///
    /// Waits for an attempt already in flight, then runs its own.
    #[instrument(skip(self, data), level = "debug", fields(key = %self.inner.storage_key))]
    pub async fn force_save(&self, data: Record) -> Result<AttemptOutcome> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.state() == SaveState::Conflict {
            return Err(SessionError::ConflictUnresolved);
        }

        self.inner.cancel_timer();
        self.inner.mutate(|s| s.current = Some(data.clone()));
        self.inner.run_attempt(AttemptData::Given(data)).await
    }

    /// Save `merged` as the answer to the pending conflict.
    #[instrument(skip(self, merged), level = "debug", fields(key = %self.inner.storage_key))]
    pub async fn resolve_conflict(&self, merged: Record) -> Result<AttemptOutcome> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let _guard = self.inner.in_flight.lock().await;
        let (case, stalled_item) = {
            let s = self.inner.lock();
            let case = s.conflict.clone().ok_or(SessionError::NoConflict)?;
            (case, s.conflict_item)
        };

        // A replay conflict: the merged record takes the stalled item's place
        // so the unmerged payload is never sent again.
        let replaced = match stalled_item {
            Some(id) => self.inner.queue.replace_payload(id, merged.clone()).await?,
            None => false,
        };

        self.inner.cancel_timer();
        self.inner.adopt_resolution(&case, &merged, true);

        if replaced {
            info!("Replaying queue for {} with the resolved record", self.inner.storage_key);
            self.inner.backup_before_attempt(&merged).await;
            let report = self.inner.replay_locked().await;
            return Ok(replay_outcome(report));
        }

        info!("Saving externally resolved record for {}", self.inner.storage_key);
        self.inner.attempt_locked(merged).await
    }

    /// Treat the current data as caught up without contacting the remote store.
    #[instrument(skip(self), level = "debug", fields(key = %self.inner.storage_key))]
    pub async fn clear_pending_changes(&self) -> Result<()> {
        self.inner.cancel_timer();
        self.inner.mutate(|s| {
            s.last_saved = s.current.clone();
            s.conflict = None;
            s.conflict_item = None;
            s.last_error = None;
            if s.state != SaveState::Saving {
                s.move_to(SaveState::Idle);
            }
        });
        if self.inner.config.enable_local_backup {
            self.inner.backup.clear().await?;
        }
        debug!("Cleared pending changes for {}", self.inner.storage_key);
        Ok(())
    }

    /// Replay the offline queue in order and report how far it got.
    #[instrument(skip(self), level = "debug", fields(key = %self.inner.storage_key))]
    pub async fn retry_failed_saves(&self) -> Result<ReplayReport<ReplayFailure>> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let _guard = self.inner.in_flight.lock().await;
        if self.state() == SaveState::Conflict {
            return Err(SessionError::ConflictUnresolved);
        }
        if self.inner.queue.is_empty() {
            return Ok(ReplayReport::empty());
        }
        Ok(self.inner.replay_locked().await)
    }

    /// Drop every queued save.
    pub async fn clear_queue(&self) -> Result<usize> {
        let _guard = self.inner.in_flight.lock().await;
        let dropped = self.inner.queue.clear().await?;
        let status = {
            let shared = self.inner.lock();
            self.inner.status_of(&shared)
        };
        self.inner.notifier.emit(status);
        Ok(dropped)
    }

    /// Cancel timers and stop accepting work. Safe to call more than once.
    ///
    /// An attempt already in flight runs to completion.
    pub fn cleanup(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel_timer();
        debug!("Closed autosave manager {}", self.inner.storage_key);
    }

    /// Load the durable queue and recovery snapshot left by an earlier process.
    pub(crate) async fn restore(&self) -> Result<Option<RecoverySnapshot>> {
        let queued = self.inner.queue.load().await?;
        if queued > 0 {
            info!("{} saves waiting in queue for {}", queued, self.inner.storage_key);
        }

        if !self.inner.config.enable_local_backup {
            return Ok(None);
        }

        let snapshot = self.inner.backup.load().await?;
        if let Some(snapshot) = &snapshot {
            self.inner.mutate(|s| {
                if s.current.is_none() || s.current == s.last_saved {
                    s.current = Some(snapshot.data.clone());
                }
                if s.known_version.is_none() {
                    s.known_version = snapshot.known_version.clone();
                }
            });
        }
        Ok(snapshot)
    }

    /// Write the recovery snapshot now.
    pub(crate) async fn write_backup(&self, data: &Record) -> std::result::Result<(), StorageError> {
        if !self.inner.config.enable_local_backup {
            return Ok(());
        }
        let version = self.inner.lock().known_version.clone();
        self.inner.backup.write(data, version).await
    }

    /// Make `data` current again without saving it, when it equals the last save.
    pub(crate) async fn revert_to_saved(&self, data: Record) -> Result<()> {
        self.inner.cancel_timer();
        self.inner.mutate(|s| {
            s.current = Some(data);
            if s.state == SaveState::Pending {
                s.move_to(SaveState::Idle);
            }
        });
        if self.inner.config.enable_local_backup {
            self.inner.backup.clear().await?;
        }
        Ok(())
    }

    /// Follow host events until the channel closes or the manager is dropped.
    pub(crate) fn spawn_signal_listener(
        &self,
        mut events: broadcast::Receiver<HostEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} host events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_closed() {
                    break;
                }
                AutoSaveManager { inner }.handle_host_event(event);
            }
        })
    }

    fn handle_host_event(self, event: HostEvent) {
        debug!("Host event {:?} for {}", event, self.inner.storage_key);
        match event {
            HostEvent::Offline => {
                self.inner.connectivity.set_online(false);
            }
            HostEvent::Online => {
                let reconnected = self.inner.connectivity.set_online(true);
                if reconnected && self.inner.queue.has_queued_items() {
                    tokio::spawn(async move {
                        match self.retry_failed_saves().await {
                            Ok(report) => info!(
                                "Drained {} queued saves after reconnect ({} left)",
                                report.replayed, report.remaining
                            ),
                            Err(e) => warn!("Queue drain after reconnect failed: {}", e),
                        }
                    });
                }
            }
            HostEvent::Hidden => {
                let flush = {
                    let s = self.inner.lock();
                    if s.has_pending_changes() && s.state != SaveState::Conflict {
                        s.current.clone()
                    } else {
                        None
                    }
                };
                if let Some(data) = flush {
                    info!("Visibility lost with pending changes, saving {}", self.inner.storage_key);
                    tokio::spawn(async move {
                        if let Err(e) = self.force_save(data).await {
                            warn!("Flush on visibility loss failed: {}", e);
                        }
                    });
                }
            }
            HostEvent::Visible => {}
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("autosave state poisoned")
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn status_of(&self, s: &Shared) -> SaveStatus {
        SaveStatus {
            storage_key: self.storage_key.clone(),
            state: s.state,
            has_pending_changes: s.has_pending_changes(),
            last_saved_at: s.last_saved_at,
            last_error: s.last_error.clone(),
            queued_items: self.queue.len(),
            known_version: s.known_version.clone(),
        }
    }

    /// Apply `f` to the shared state and notify if the save state changed.
    ///
    /// Observers run after the lock is released.
    fn mutate<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let (result, status) = {
            let mut shared = self.lock();
            let before = shared.state;
            let result = f(&mut shared);
            let status = (shared.state != before).then(|| self.status_of(&shared));
            (result, status)
        };
        if let Some(status) = status {
            self.notifier.emit(status);
        }
        result
    }

    /// Abort the debounce timer and invalidate any scheduled attempt that
    /// already left it.
    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().expect("autosave timer poisoned").take() {
            handle.abort();
        }
        self.lock().generation += 1;
    }

    fn timer_active(&self) -> bool {
        self.timer
            .lock()
            .expect("autosave timer poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn expected_version(&self) -> Option<String> {
        if self.config.enable_conflict_detection {
            self.lock().known_version.clone()
        } else {
            None
        }
    }

    fn schedule(self: &Arc<Self>, data: Record) {
        if self.is_closed() {
            return;
        }
        let generation = self.mutate(|s| {
            s.current = Some(data);
            s.move_to(SaveState::Pending);
            s.generation += 1;
            s.generation
        });

        let weak = Arc::downgrade(self);
        let debounce = self.config.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else { return };
            // The attempt gets its own task: aborting the timer must never
            // cancel a save that already started.
            tokio::spawn(async move {
                if let Err(e) = inner.run_attempt(AttemptData::Scheduled(generation)).await {
                    warn!("Scheduled save for {} failed: {}", inner.storage_key, e);
                }
            });
        });

        if let Some(previous) = self
            .timer
            .lock()
            .expect("autosave timer poisoned")
            .replace(handle)
        {
            previous.abort();
        }
    }

    async fn run_attempt(self: &Arc<Self>, what: AttemptData) -> Result<AttemptOutcome> {
        let _guard = self.in_flight.lock().await;
        if self.is_closed() {
            return Ok(AttemptOutcome::Skipped);
        }

        let data = match what {
            AttemptData::Given(data) => data,
            AttemptData::Scheduled(generation) => {
                let s = self.lock();
                if s.generation != generation {
                    debug!("Scheduled save for {} was superseded", self.storage_key);
                    return Ok(AttemptOutcome::Skipped);
                }
                match &s.current {
                    Some(current) if s.state == SaveState::Pending && s.has_pending_changes() => {
                        current.clone()
                    }
                    _ => {
                        debug!("Scheduled save for {} has nothing to do", self.storage_key);
                        return Ok(AttemptOutcome::Skipped);
                    }
                }
            }
        };

        self.attempt_locked(data).await
    }

    /// One attempt, with the in-flight lock held by the caller.
    async fn attempt_locked(self: &Arc<Self>, data: Record) -> Result<AttemptOutcome> {
        let mut data = data;
        let mut may_resolve = true;

        loop {
            if let Some(validator) = &self.validator {
                if let Err(message) = validator.validate(&data) {
                    warn!("Record for {} failed validation: {}", self.storage_key, message);
                    self.mutate(|s| {
                        s.move_to(SaveState::Saving);
                        s.last_error = Some(message.clone());
                        s.settle(SaveState::Error);
                    });
                    return Ok(AttemptOutcome::Rejected(message));
                }
            }

            self.mutate(|s| s.move_to(SaveState::Saving));
            self.backup_before_attempt(&data).await;

            if !self.connectivity.is_online() {
                return self.defer(data, None).await;
            }

            if self.queue.has_queued_items() {
                // Older saves are still queued: this one goes behind them
                self.enqueue(data).await?;
                let report = self.replay_locked().await;
                return Ok(replay_outcome(report));
            }

            match self.send_with_retry(&data).await {
                Sent::Saved(receipt) => {
                    self.on_saved(&data, &receipt).await;
                    return Ok(AttemptOutcome::Saved);
                }
                Sent::Rejected(message) => {
                    warn!("Remote store rejected {}: {}", self.storage_key, message);
                    self.mutate(|s| {
                        s.last_error = Some(message.clone());
                        s.settle(SaveState::Error);
                    });
                    return Ok(AttemptOutcome::Rejected(message));
                }
                Sent::Offline => return self.defer(data, None).await,
                Sent::Exhausted(message) => return self.defer(data, Some(message)).await,
                Sent::Conflict {
                    remote,
                    remote_version,
                } => {
                    let case = self.mutate(|s| {
                        let case = ConflictCase {
                            local_data: s.current.clone().unwrap_or_else(|| data.clone()),
                            remote_data: remote,
                            remote_version,
                        };
                        s.conflict = Some(case.clone());
                        s.conflict_item = None;
                        s.last_error = Some("remote copy changed".to_string());
                        s.settle(SaveState::Conflict);
                        case
                    });
                    warn!(
                        "Conflict saving {} (remote version {:?})",
                        self.storage_key, case.remote_version
                    );

                    let resolver = match (&self.resolver, may_resolve) {
                        (Some(resolver), true) => resolver.clone(),
                        _ => return Ok(AttemptOutcome::Conflict),
                    };
                    let merged = resolver.resolve(&case.local_data, &case.remote_data).await;
                    info!("Conflict on {} resolved, saving merged record", self.storage_key);
                    self.adopt_resolution(&case, &merged, true);
                    data = merged;
                    may_resolve = false;
                }
            }
        }
    }

    /// Send `data`, retrying transient failures up to the attempt budget.
    async fn send_with_retry(&self, data: &Record) -> Sent {
        let budget = self.config.attempt_budget();
        let expected_version = self.expected_version();
        let mut last_error = String::new();

        for attempt in 1..=budget {
            if attempt > 1 {
                let delay = backoff::retry_delay(&self.config, attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying save for {}",
                    self.storage_key
                );
                tokio::time::sleep(delay).await;
                if self.is_closed() {
                    return Sent::Exhausted("session closed before retry".to_string());
                }
                if !self.connectivity.is_online() {
                    return Sent::Offline;
                }
            }

            let request = SaveRequest {
                key: self.storage_key.clone(),
                data: data.clone(),
                expected_version: expected_version.clone(),
            };
            match self.remote.save(request).await {
                Ok(receipt) => return Sent::Saved(receipt),
                Err(SaveFailure::Validation(message)) => return Sent::Rejected(message),
                Err(SaveFailure::Conflict {
                    remote,
                    remote_version,
                }) => {
                    return Sent::Conflict {
                        remote,
                        remote_version,
                    }
                }
                Err(SaveFailure::Transient(message)) => {
                    warn!(
                        attempt,
                        budget, "Save attempt for {} failed: {}", self.storage_key, message
                    );
                    last_error = message;
                }
            }
        }

        Sent::Exhausted(last_error)
    }

    async fn on_saved(self: &Arc<Self>, data: &Record, receipt: &SaveReceipt) {
        // `current` can differ from what was sent when the user reverted or
        // discarded changes mid-flight. Nothing else will save it unless a
        // newer update already moved the state to Pending.
        let (caught_up, resave) = self.mutate(|s| {
            s.record_saved(data, receipt);
            s.conflict = None;
            s.conflict_item = None;
            let caught_up = s.current.as_ref() == Some(data);
            let resave = match s.state {
                SaveState::Saving | SaveState::Idle if s.has_pending_changes() => {
                    s.current.clone()
                }
                _ => None,
            };
            if resave.is_none() {
                s.settle(SaveState::Saved);
            }
            (caught_up, resave)
        });
        info!(
            "Saved {} (version {:?})",
            self.storage_key, receipt.version
        );

        if caught_up && self.config.enable_local_backup {
            if let Err(e) = self.backup.clear().await {
                warn!("Failed to clear recovery snapshot for {}: {}", self.storage_key, e);
            }
        }
        if let Some(current) = resave {
            debug!("Current data for {} differs from the save, rescheduling", self.storage_key);
            self.backup_before_attempt(&current).await;
            self.schedule(current);
        }
    }

    /// Take over the remote version and the merged record after a resolution.
    fn adopt_resolution(&self, case: &ConflictCase, merged: &Record, replace_current: bool) {
        self.mutate(|s| {
            s.known_version = case.remote_version.clone();
            s.conflict = None;
            s.conflict_item = None;
            if replace_current || s.current.as_ref() == Some(&case.local_data) {
                s.current = Some(merged.clone());
            }
        });
    }

    async fn backup_before_attempt(&self, data: &Record) {
        if !self.config.enable_local_backup {
            return;
        }
        let version = self.lock().known_version.clone();
        if let Err(e) = self.backup.write(data, version).await {
            warn!("Failed to write recovery snapshot for {}: {}", self.storage_key, e);
        }
    }

    async fn enqueue(&self, data: Record) -> Result<()> {
        if let Err(e) = self.queue.enqueue(&self.storage_key, data).await {
            self.mutate(|s| {
                s.last_error = Some(format!("failed to queue save: {}", e));
                s.settle(SaveState::Error);
            });
            return Err(e.into());
        }
        Ok(())
    }

    /// Park `data` in the queue. `exhausted` carries the last transient error
    /// when retries ran out; `None` means the host is offline.
    async fn defer(&self, data: Record, exhausted: Option<String>) -> Result<AttemptOutcome> {
        self.enqueue(data).await?;
        match exhausted {
            None => {
                info!("Host offline, queued save for {}", self.storage_key);
                self.mutate(|s| s.settle(SaveState::Offline));
                Ok(AttemptOutcome::Queued { offline: true })
            }
            Some(last_error) => {
                warn!(
                    "Retries exhausted for {}, queued save: {}",
                    self.storage_key, last_error
                );
                self.mutate(|s| {
                    s.last_error = Some(last_error.clone());
                    s.settle(SaveState::Error);
                });
                Ok(AttemptOutcome::Exhausted { last_error })
            }
        }
    }

    /// Replay the queue, with the in-flight lock held by the caller.
    async fn replay_locked(self: &Arc<Self>) -> ReplayReport<ReplayFailure> {
        self.mutate(|s| s.move_to(SaveState::Saving));

        let this: &Inner = self;
        let report = self
            .queue
            .process_queue(move |item| this.replay_item(item))
            .await;

        let failure = report.stalled.as_ref().map(|s| s.error.clone());
        match failure {
            None => {
                let (caught_up, pending) = self.mutate(|s| {
                    let pending = if s.has_pending_changes() {
                        s.settle(SaveState::Pending);
                        s.current.clone()
                    } else {
                        s.settle(SaveState::Saved);
                        None
                    };
                    (pending.is_none(), pending)
                });
                if caught_up && self.config.enable_local_backup {
                    if let Err(e) = self.backup.clear().await {
                        warn!("Failed to clear recovery snapshot for {}: {}", self.storage_key, e);
                    }
                }
                if let Some(pending) = pending {
                    if !self.timer_active() {
                        self.schedule(pending);
                    }
                }
            }
            Some(ReplayFailure::Offline) => self.mutate(|s| s.settle(SaveState::Offline)),
            Some(ReplayFailure::Conflict) => self.mutate(|s| s.settle(SaveState::Conflict)),
            Some(ReplayFailure::Transient(message)) | Some(ReplayFailure::Rejected(message)) => {
                self.mutate(|s| {
                    s.last_error = Some(format!("sync stalled: {}", message));
                    s.settle(SaveState::Error);
                })
            }
        }

        report
    }

    /// Send one queued item. A single try: the queue stops on failure.
    async fn replay_item(&self, item: QueueItem) -> std::result::Result<(), ReplayFailure> {
        if !self.connectivity.is_online() {
            return Err(ReplayFailure::Offline);
        }

        let mut payload = item.payload;
        let mut may_resolve = true;
        loop {
            let request = SaveRequest {
                key: item.key.clone(),
                data: payload.clone(),
                expected_version: self.expected_version(),
            };
            match self.remote.save(request).await {
                Ok(receipt) => {
                    self.mutate(|s| s.record_saved(&payload, &receipt));
                    return Ok(());
                }
                Err(SaveFailure::Transient(message)) => {
                    return Err(ReplayFailure::Transient(message))
                }
                Err(SaveFailure::Validation(message)) => {
                    return Err(ReplayFailure::Rejected(message))
                }
                Err(SaveFailure::Conflict {
                    remote,
                    remote_version,
                }) => {
                    let case = ConflictCase {
                        local_data: payload.clone(),
                        remote_data: remote,
                        remote_version,
                    };
                    match (&self.resolver, may_resolve) {
                        (Some(resolver), true) => {
                            let merged = resolver.resolve(&case.local_data, &case.remote_data).await;
                            info!("Resolved conflict on queued item {}", item.id);
                            self.adopt_resolution(&case, &merged, false);
                            payload = merged;
                            may_resolve = false;
                        }
                        _ => {
                            self.mutate(|s| {
                                s.last_error = Some("remote copy changed".to_string());
                                s.conflict = Some(case);
                                s.conflict_item = Some(item.id);
                            });
                            return Err(ReplayFailure::Conflict);
                        }
                    }
                }
            }
        }
    }
}

/// Outcome of a save that went through a replay pass.
fn replay_outcome(report: ReplayReport<ReplayFailure>) -> AttemptOutcome {
    match report.stalled.map(|s| s.error) {
        None => AttemptOutcome::Saved,
        Some(ReplayFailure::Offline) => AttemptOutcome::Queued { offline: true },
        Some(ReplayFailure::Transient(_)) => AttemptOutcome::Queued { offline: false },
        Some(ReplayFailure::Rejected(msg)) => AttemptOutcome::Rejected(msg),
        Some(ReplayFailure::Conflict) => AttemptOutcome::Conflict,
    }
}
