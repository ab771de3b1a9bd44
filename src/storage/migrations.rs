//! Database migrations for the queue store

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < SCHEMA_VERSION {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Mutations waiting for the remote backend. Rows are never updated.
        CREATE TABLE IF NOT EXISTS pending_mutations (
            id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            user_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_timestamp ON pending_mutations(timestamp);
        CREATE INDEX IF NOT EXISTS idx_pending_table ON pending_mutations(table_name);

        -- Retry bookkeeping, kept apart so queued envelopes stay immutable
        CREATE TABLE IF NOT EXISTS mutation_attempts (
            mutation_id TEXT PRIMARY KEY,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_attempt_at INTEGER NOT NULL
        );

        -- Mutations that exhausted their attempts
        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT,
            dead_lettered_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_at ON dead_letters(dead_lettered_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}
