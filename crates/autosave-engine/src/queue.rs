//! Durable FIFO of saves that could not reach the remote store.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use autosave_core::{DurableStore, QueueItem, Record, StorageError};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// The queue item that stopped a replay pass, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledItem<E> {
    pub item_id: Uuid,
    pub error: E,
}

/// Result of one replay pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport<E> {
    /// Items acknowledged and removed during this pass
    pub replayed: usize,
    /// Items still queued after the pass
    pub remaining: usize,
    /// Set when the pass stopped at a failing item ("sync stalled")
    pub stalled: Option<StalledItem<E>>,
}

impl<E> ReplayReport<E> {
    pub(crate) fn empty() -> Self {
        Self {
            replayed: 0,
            remaining: 0,
            stalled: None,
        }
    }

    /// True when the pass did not stop on a failure.
    pub fn is_complete(&self) -> bool {
        self.stalled.is_none()
    }
}

/// Durable FIFO queue of deferred saves for one session.
///
/// Every mutation rewrites the whole list under `{storage_key}:queue`.
/// Items leave the queue only through a successful replay or `clear`.
pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    key: String,
    items: Mutex<VecDeque<QueueItem>>,
    len: AtomicUsize,
    /// Serializes replay passes
    replay: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn DurableStore>, storage_key: &str) -> Self {
        Self {
            store,
            key: format!("{}:queue", storage_key),
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            replay: Mutex::new(()),
        }
    }

    /// Load durable items written by an earlier process.
    ///
    /// Items already queued in memory stay behind the loaded ones.
    #[instrument(skip(self), level = "debug", fields(key = %self.key))]
    pub async fn load(&self) -> Result<usize, StorageError> {
        let stored: Vec<QueueItem> = match self.store.get(&self.key).await? {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        let mut items = self.items.lock().await;
        let known: HashSet<Uuid> = stored.iter().map(|i| i.id).collect();
        let mut merged: VecDeque<QueueItem> = stored.into();
        merged.extend(items.drain(..).filter(|i| !known.contains(&i.id)));
        *items = merged;
        self.len.store(items.len(), Ordering::SeqCst);

        debug!("Loaded {} queued items", items.len());
        Ok(items.len())
    }

    /// Append a save to the tail. Safe while a replay pass is running.
    #[instrument(skip(self, payload), level = "debug", fields(queue = %self.key))]
    pub async fn enqueue(&self, key: &str, payload: Record) -> Result<QueueItem, StorageError> {
        let item = QueueItem::new(key, payload);
        let mut items = self.items.lock().await;
        items.push_back(item.clone());

        if let Err(e) = self.persist(&items).await {
            items.pop_back();
            return Err(e);
        }
        self.len.store(items.len(), Ordering::SeqCst);

        debug!("Queued item {} ({} in queue)", item.id, items.len());
        Ok(item)
    }

    pub fn has_queued_items(&self) -> bool {
        self.len() > 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued items, oldest first.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.items.lock().await.iter().cloned().collect()
    }

    /// Swap the payload of a queued item, keeping its place in line.
    ///
    /// Returns false if the item already left the queue.
    #[instrument(skip(self, payload), level = "debug", fields(queue = %self.key))]
    pub async fn replace_payload(&self, id: Uuid, payload: Record) -> Result<bool, StorageError> {
        let mut items = self.items.lock().await;
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return Ok(false);
        };
        let previous = std::mem::replace(&mut item.payload, payload);

        if let Err(e) = self.persist(&items).await {
            if let Some(item) = items.iter_mut().find(|i| i.id == id) {
                item.payload = previous;
            }
            return Err(e);
        }

        debug!("Replaced payload of queued item {}", id);
        Ok(true)
    }

    /// Drop every queued item. Returns how many were dropped.
    #[instrument(skip(self), level = "debug", fields(queue = %self.key))]
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let mut items = self.items.lock().await;
        let dropped = items.len();
        self.store.remove(&self.key).await?;
        items.clear();
        self.len.store(0, Ordering::SeqCst);

        warn!("Cleared {} queued items", dropped);
        Ok(dropped)
    }

    /// Replay queued items oldest first through `apply`.
    ///
    /// Each acknowledged item is removed before the next one is sent. The pass
    /// stops at the first failure, leaving that item and everything behind it
    /// queued in order. Items enqueued after the pass started wait for the
    /// next pass.
    pub async fn process_queue<F, Fut, E>(&self, mut apply: F) -> ReplayReport<E>
    where
        F: FnMut(QueueItem) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let _pass = self.replay.lock().await;
        let pass_ids: HashSet<Uuid> = self.items.lock().await.iter().map(|i| i.id).collect();
        let mut report = ReplayReport::empty();

        loop {
            let head = self.items.lock().await.front().cloned();
            let Some(item) = head else { break };
            if !pass_ids.contains(&item.id) {
                break;
            }

            let id = item.id;
            match apply(item).await {
                Ok(()) => {
                    let mut items = self.items.lock().await;
                    if let Some(pos) = items.iter().position(|i| i.id == id) {
                        items.remove(pos);
                    }
                    self.len.store(items.len(), Ordering::SeqCst);
                    if let Err(e) = self.persist(&items).await {
                        // Worst case the item is sent again after a restart
                        warn!("Failed to persist queue after replaying {}: {}", id, e);
                    }
                    report.replayed += 1;
                    debug!("Replayed queued item {}", id);
                }
                Err(error) => {
                    let mut items = self.items.lock().await;
                    if let Some(item) = items.iter_mut().find(|i| i.id == id) {
                        item.attempt_count += 1;
                    }
                    if let Err(e) = self.persist(&items).await {
                        warn!("Failed to persist attempt count for {}: {}", id, e);
                    }
                    warn!("Replay stalled at item {}: {}", id, error);
                    report.stalled = Some(StalledItem { item_id: id, error });
                    break;
                }
            }
        }

        report.remaining = self.len();
        report
    }

    async fn persist(&self, items: &VecDeque<QueueItem>) -> Result<(), StorageError> {
        if items.is_empty() {
            self.store.remove(&self.key).await?;
        } else {
            let json = serde_json::to_string(items)?;
            self.store.set(&self.key, &json).await?;
        }
        Ok(())
    }
}
