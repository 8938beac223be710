//! Durable local stores for autosave sessions.
//!
//! - `LocalFileStore`: one file per key under a root directory, written atomically
//! - `MemoryStore`: process-local map, for tests and ephemeral sessions

mod file;
mod memory;

pub use file::LocalFileStore;
pub use memory::MemoryStore;
