//! HTTP remote store for the autosave engine.
//!
//! Records live at `{base_url}/records/{key}`. Versions travel as entity tags:
//! saves send `If-Match` and the server answers `409`/`412` with its current
//! copy when the tag is stale.

mod client;

pub use client::HttpRemoteStore;
