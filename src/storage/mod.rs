//! Durable queue storage
//!
//! Handles the SQLite queue database, its schema and the queue queries.

mod connection;
mod migrations;
pub mod queries;

pub use connection::QueueStore;
pub use migrations::SCHEMA_VERSION;
