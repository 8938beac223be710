//! Core traits and types for the autosave session engine.
//!
//! This crate defines the data model and the boundary contracts shared between
//! the engine and its collaborators:
//! - `DurableStore`: key/value persistence that survives a process restart
//! - `RemoteStore`: the remote save contract with classified failures
//! - `Validator` / `ConflictResolver`: caller-supplied record policies
//! - `HostSignals`: connectivity and visibility events from the host
//! - `StateObserver`: save status notifications

mod config;
mod conflict;
mod error;
mod remote;
mod signals;
mod state;
mod storage;

pub use config::AutoSaveConfig;
pub use conflict::{ConflictCase, ConflictResolver};
pub use error::{SaveFailure, StorageError};
pub use remote::{RemoteStore, SaveReceipt, SaveRequest, Validator};
pub use signals::{HostEvent, HostSignals};
pub use state::{SaveState, SaveStatus, StateObserver};
pub use storage::{DurableStore, QueueItem, RecoverySnapshot};

/// A structured record being edited.
pub type Record = serde_json::Value;
