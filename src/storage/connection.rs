//! Queue database handle with lazy, idempotent initialization
//!
//! The handle is cheap to clone; clones share one SQLite connection.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use super::queries;
use crate::error::{LifesyncError, Result};
use crate::types::*;

/// Durable store of pending mutations
pub struct QueueStore {
    config: QueueConfig,
    conn: Arc<Mutex<Option<Connection>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl QueueStore {
    /// Create a handle without touching the disk; the database opens on first use
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Open or create the queue database
    pub fn open(config: QueueConfig) -> Result<Self> {
        let store = Self::new(config);
        store.initialize()?;
        Ok(store)
    }

    /// Open an in-memory queue (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(QueueConfig::in_memory())
    }

    /// Open the database and apply the schema if that has not happened yet.
    ///
    /// Safe to call repeatedly; an open handle is never replaced.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.conn.lock();
        Self::ensure_open(&mut slot, &self.config)?;
        Ok(())
    }

    /// Whether the underlying connection has been opened
    pub fn is_initialized(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn ensure_open<'a>(
        slot: &'a mut Option<Connection>,
        config: &QueueConfig,
    ) -> Result<&'a mut Connection> {
        if slot.is_none() {
            *slot = Some(Self::create_connection(config)?);
            tracing::debug!("Opened mutation queue at {}", config.db_path);
        }
        slot.as_mut()
            .ok_or_else(|| LifesyncError::Internal("queue connection missing".to_string()))
    }

    /// Create a new connection with pragmas, schema and quota applied
    fn create_connection(config: &QueueConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        Self::configure_pragmas(&conn, config.storage_mode)?;
        run_migrations(&conn)?;

        if let Some(max_bytes) = config.max_size_bytes {
            Self::apply_quota(&conn, max_bytes)?;
        }

        Ok(conn)
    }

    /// Configure SQLite pragmas based on storage mode
    fn configure_pragmas(conn: &Connection, mode: StorageMode) -> Result<()> {
        match mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    /// Cap the database size; SQLite answers writes past it with SQLITE_FULL
    fn apply_quota(conn: &Connection, max_bytes: u64) -> Result<()> {
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let pages = (max_bytes / page_size.max(1) as u64).max(1);
        let applied: i64 = conn.query_row(
            &format!("PRAGMA max_page_count = {}", pages),
            [],
            |row| row.get(0),
        )?;
        tracing::debug!("Queue quota set to {} pages of {} bytes", applied, page_size);
        Ok(())
    }

    /// Execute a function with the connection, opening it if needed
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut slot = self.conn.lock();
        let conn = Self::ensure_open(&mut slot, &self.config)?;
        f(conn)
    }

    /// Execute a function within a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut slot = self.conn.lock();
        let conn = Self::ensure_open(&mut slot, &self.config)?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Persist a mutation and return its generated id.
    ///
    /// A failed write is returned as a persistence error; the mutation is
    /// not queued anywhere else.
    pub fn enqueue(&self, input: NewMutation) -> Result<MutationId> {
        let mutation =
            self.with_transaction(|conn| queries::enqueue_mutation(conn, &input, now_ms()))?;
        tracing::debug!(
            "Queued {} on {} as {}",
            mutation.operation,
            mutation.table,
            mutation.id
        );
        Ok(mutation.id)
    }

    /// All pending mutations in drain order
    pub fn list_pending(&self) -> Result<Vec<PendingMutation>> {
        self.with_connection(queries::list_pending)
    }

    /// Pending mutations targeting one table, in drain order
    pub fn list_pending_for_table(&self, table: Table) -> Result<Vec<PendingMutation>> {
        self.with_connection(|conn| queries::list_pending_for_table(conn, table))
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
        self.with_connection(|conn| queries::get_pending(conn, id))
    }

    /// Remove one mutation; returns false if it was not queued
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.with_transaction(|conn| queries::remove_mutation(conn, id))
    }

    /// Drop every pending mutation
    pub fn clear(&self) -> Result<usize> {
        let cleared = self.with_transaction(queries::clear_pending)?;
        if cleared > 0 {
            tracing::info!("Cleared {} pending mutations", cleared);
        }
        Ok(cleared)
    }

    /// Number of pending mutations
    pub fn size(&self) -> Result<usize> {
        self.with_connection(queries::count_pending)
    }

    /// Record a failed remote attempt; returns the attempt count so far
    pub fn record_failure(&self, id: &str, error: &str) -> Result<u32> {
        self.with_connection(|conn| queries::record_failure(conn, id, error, now_ms()))
    }

    /// Failed attempts recorded for a pending mutation
    pub fn attempts(&self, id: &str) -> Result<u32> {
        self.with_connection(|conn| queries::get_attempts(conn, id))
    }

    /// Move a pending mutation to the dead-letter table
    pub fn dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.with_transaction(|conn| queries::dead_letter_mutation(conn, id, now_ms()))
    }

    pub fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.with_connection(queries::list_dead_letters)
    }

    /// Return a dead letter to the end of the queue
    pub fn requeue_dead_letter(&self, id: &str) -> Result<bool> {
        self.with_transaction(|conn| queries::requeue_dead_letter(conn, id, now_ms()))
    }

    pub fn purge_dead_letters(&self) -> Result<usize> {
        self.with_transaction(queries::purge_dead_letters)
    }

    /// Get database path
    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Get configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Clone for QueueStore {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}
