use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connectivity and visibility events raised by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    Online,
    Offline,
    /// The editing surface lost visibility (tab hidden, window closing).
    Hidden,
    Visible,
}

/// Event source the host uses to publish `HostEvent`s to its sessions.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct HostSignals {
    tx: broadcast::Sender<HostEvent>,
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn emit(&self, event: HostEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let signals = HostSignals::new();
        assert_eq!(signals.emit(HostEvent::Offline), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let signals = HostSignals::new();
        let mut rx = signals.subscribe();
        signals.emit(HostEvent::Offline);
        signals.clone().emit(HostEvent::Online);
        assert_eq!(rx.recv().await.unwrap(), HostEvent::Offline);
        assert_eq!(rx.recv().await.unwrap(), HostEvent::Online);
    }
}
