use std::time::Duration;

/// Per-session autosave settings. Fixed once a session is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSaveConfig {
    /// Quiet period after the last update before a save fires.
    pub debounce: Duration,
    /// Total attempts for one save before it is handed to the offline queue.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every further retry.
    pub retry_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_delay: Duration,
    /// Write a recovery snapshot to the durable store on every update and attempt.
    pub enable_local_backup: bool,
    /// Send the last known remote version with each save.
    pub enable_conflict_detection: bool,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(30),
            enable_local_backup: true,
            enable_conflict_detection: true,
        }
    }
}

impl AutoSaveConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Zero is treated as one: every save gets at least one attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_delay(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_delay = base;
        self.max_retry_delay = cap.max(base);
        self
    }

    pub fn with_local_backup(mut self, enabled: bool) -> Self {
        self.enable_local_backup = enabled;
        self
    }

    pub fn with_conflict_detection(mut self, enabled: bool) -> Self {
        self.enable_conflict_detection = enabled;
        self
    }

    /// Attempt budget for a single save.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}
