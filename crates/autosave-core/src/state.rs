use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Save state of an editing session. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Idle,
    Pending,
    Saving,
    Saved,
    Error,
    Offline,
    Conflict,
}

impl Default for SaveState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SaveState {
    /// Whether `next` is reachable from this state in a single step.
    ///
    /// `Saving` is the only way into a terminal state, and terminal states
    /// only leave through a new update (`Pending`), a new attempt (`Saving`)
    /// or an explicit discard (`Idle`).
    pub fn can_transition_to(self, next: SaveState) -> bool {
        use SaveState::*;
        match (self, next) {
            (Idle, Pending | Saving) => true,
            (Pending, Pending | Saving | Idle) => true,
            (Saving, Saved | Error | Offline | Conflict | Pending) => true,
            (Saved | Error | Offline | Conflict, Pending | Saving | Idle) => true,
            _ => false,
        }
    }

    /// Outcome of a finished attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SaveState::Saved | SaveState::Error | SaveState::Offline | SaveState::Conflict
        )
    }
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SaveState::Idle => "idle",
            SaveState::Pending => "pending",
            SaveState::Saving => "saving",
            SaveState::Saved => "saved",
            SaveState::Error => "error",
            SaveState::Offline => "offline",
            SaveState::Conflict => "conflict",
        };
        f.write_str(label)
    }
}

/// Snapshot of a session's save status, emitted on every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveStatus {
    /// Storage key of the session
    pub storage_key: String,
    /// Current save state
    pub state: SaveState,
    /// Whether the current data differs from the last confirmed save
    pub has_pending_changes: bool,
    /// Time of the last confirmed save
    pub last_saved_at: Option<DateTime<Utc>>,
    /// Last error message, if any
    pub last_error: Option<String>,
    /// Number of saves waiting in the offline queue
    pub queued_items: usize,
    /// Last remote version confirmed by the remote store
    pub known_version: Option<String>,
}

/// Receives save status changes.
///
/// Called after the session's internal locks are released, so an observer may
/// read back from the session. Must not block.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, status: &SaveStatus);
}

impl<F> StateObserver for F
where
    F: Fn(&SaveStatus) + Send + Sync,
{
    fn on_state_change(&self, status: &SaveStatus) {
        self(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SaveState::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Idle.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Saving));
        assert!(Saving.can_transition_to(Saved));
        assert!(Saved.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_states_require_saving() {
        for terminal in [Saved, Error, Offline, Conflict] {
            assert!(!Idle.can_transition_to(terminal));
            assert!(!Pending.can_transition_to(terminal));
            assert!(Saving.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_conflict_never_jumps_to_saved() {
        assert!(!Conflict.can_transition_to(Saved));
        assert!(Conflict.can_transition_to(Saving));
        assert!(Conflict.can_transition_to(Pending));
    }

    #[test]
    fn test_saving_cannot_go_idle() {
        assert!(!Saving.can_transition_to(Idle));
    }

    #[test]
    fn test_display_matches_serde() {
        for state in [Idle, Pending, Saving, Saved, Error, Offline, Conflict] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
