//! Offline mutation sync
//!
//! Drains the local queue against a remote backend and reacts to
//! connectivity changes.
//!
//! # Feature Flags
//!
//! - `rest`: enables the PostgREST/Supabase backend

mod backend;
mod engine;
mod events;
mod memory;
mod monitor;
#[cfg(feature = "rest")]
mod rest;

pub use backend::{record_id, split_update, RemoteBackend, RemoteError};
pub use engine::SyncEngine;
pub use events::{EventType, MonitorEvent};
pub use memory::{AppliedCall, InMemoryBackend};
pub use monitor::{spawn_probe, ConnectivityMonitor, MonitorConfig};
#[cfg(feature = "rest")]
pub use rest::{RestBackend, RestConfig};
