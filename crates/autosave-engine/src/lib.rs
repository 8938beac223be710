//! Autosave session engine.
//!
//! A [`Session`] takes every edit from the host, debounces it into remote
//! saves, keeps a local recovery snapshot, queues saves that cannot reach the
//! remote store and replays them in order once it is reachable again.
//!
//! ```ignore
//! let session = Session::builder("doc-42", remote, store)
//!     .config(AutoSaveConfig::default())
//!     .signals(&signals)
//!     .build();
//! session.initialize().await?;
//! session.update_data(json!({"title": "Draft"})).await?;
//! ```

pub mod backoff;
pub mod backup;
pub mod connectivity;
pub mod error;
pub mod manager;
mod notify;
pub mod queue;
pub mod session;

pub use backup::BackupStore;
pub use connectivity::Connectivity;
pub use error::{ReplayFailure, Result, SessionError};
pub use manager::{AttemptOutcome, AutoSaveManager};
pub use queue::{OfflineQueue, ReplayReport, StalledItem};
pub use session::{Session, SessionBuilder};
