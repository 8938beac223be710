use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Last connectivity state reported by the host.
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a new state. Returns true if the host just came back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!("Host is now {}", if online { "online" } else { "offline" });
        }
        online && !was_online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_detection() {
        let connectivity = Connectivity::default();
        assert!(connectivity.is_online());
        assert!(!connectivity.set_online(true));
        assert!(!connectivity.set_online(false));
        assert!(!connectivity.is_online());
        assert!(connectivity.set_online(true));
        assert!(!connectivity.set_online(true));
    }
}
