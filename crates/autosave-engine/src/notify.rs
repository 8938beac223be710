use std::sync::Arc;

use autosave_core::{SaveStatus, StateObserver};
use tokio::sync::broadcast;

/// Fans save status changes out to observers and broadcast subscribers.
pub(crate) struct StateNotifier {
    observers: Vec<Arc<dyn StateObserver>>,
    tx: broadcast::Sender<SaveStatus>,
}

impl StateNotifier {
    pub(crate) fn new(observers: Vec<Arc<dyn StateObserver>>) -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { observers, tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SaveStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, status: SaveStatus) {
        for observer in &self.observers {
            observer.on_state_change(&status);
        }
        // No subscribers is fine
        let _ = self.tx.send(status);
    }
}
