//! lifesync - offline mutation queue
//!
//! Durable local queue for writes made while offline, replayed in order
//! against the remote backend when connectivity returns.

pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{LifesyncError, Result};
pub use storage::QueueStore;
pub use sync::{ConnectivityMonitor, RemoteBackend, SyncEngine};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
