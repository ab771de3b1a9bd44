//! Database queries for queued mutations

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{LifesyncError, Result};
use crate::types::*;

/// Columns shared by `pending_mutations` and `dead_letters`
const MUTATION_COLUMNS: &str = "id, table_name, operation, data, timestamp, user_id";

/// A mutation row as stored, before its text columns are validated
struct MutationRow {
    id: String,
    table_name: String,
    operation: String,
    data: String,
    timestamp: i64,
    user_id: String,
}

impl MutationRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            table_name: row.get("table_name")?,
            operation: row.get("operation")?,
            data: row.get("data")?,
            timestamp: row.get("timestamp")?,
            user_id: row.get("user_id")?,
        })
    }

    fn into_mutation(self) -> Result<PendingMutation> {
        let table: Table = self
            .table_name
            .parse()
            .map_err(|e| LifesyncError::Corrupt(format!("mutation {}: {}", self.id, e)))?;
        let operation: Operation = self
            .operation
            .parse()
            .map_err(|e| LifesyncError::Corrupt(format!("mutation {}: {}", self.id, e)))?;
        let data = serde_json::from_str(&self.data).map_err(|e| {
            LifesyncError::Corrupt(format!("mutation {}: invalid payload: {}", self.id, e))
        })?;

        Ok(PendingMutation {
            id: self.id,
            table,
            operation,
            data,
            timestamp: self.timestamp,
            user_id: self.user_id,
        })
    }
}

/// Next drain timestamp: wall clock, but never behind the newest queued entry
fn next_timestamp(conn: &Connection, now_ms: i64) -> Result<i64> {
    let newest: i64 = conn.query_row(
        "SELECT COALESCE(MAX(timestamp), 0) FROM pending_mutations",
        [],
        |row| row.get(0),
    )?;
    Ok(now_ms.max(newest))
}

fn insert_pending(conn: &Connection, mutation: &PendingMutation) -> Result<()> {
    let data = serde_json::to_string(&mutation.data)?;
    conn.execute(
        "INSERT INTO pending_mutations (id, table_name, operation, data, timestamp, user_id)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            mutation.id,
            mutation.table.as_str(),
            mutation.operation.as_str(),
            data,
            mutation.timestamp,
            mutation.user_id,
        ],
    )?;
    Ok(())
}

/// Append a mutation to the queue, assigning its id and timestamp
pub fn enqueue_mutation(
    conn: &Connection,
    input: &NewMutation,
    now_ms: i64,
) -> Result<PendingMutation> {
    let mutation = PendingMutation {
        id: uuid::Uuid::new_v4().to_string(),
        table: input.table,
        operation: input.operation,
        data: input.data.clone(),
        timestamp: next_timestamp(conn, now_ms)?,
        user_id: input.user_id.clone(),
    };

    insert_pending(conn, &mutation)?;
    Ok(mutation)
}

fn collect_mutations(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, MutationRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(MutationRow::into_mutation).collect()
}

/// All queued mutations, oldest first (ties in insertion order)
pub fn list_pending(conn: &Connection) -> Result<Vec<PendingMutation>> {
    let sql = format!(
        "SELECT {} FROM pending_mutations ORDER BY timestamp ASC, rowid ASC",
        MUTATION_COLUMNS
    );
    collect_mutations(conn, &sql, params![])
}

/// Queued mutations for one table, oldest first
pub fn list_pending_for_table(conn: &Connection, table: Table) -> Result<Vec<PendingMutation>> {
    let sql = format!(
        "SELECT {} FROM pending_mutations WHERE table_name = ? ORDER BY timestamp ASC, rowid ASC",
        MUTATION_COLUMNS
    );
    collect_mutations(conn, &sql, params![table.as_str()])
}

/// Get a queued mutation by id
pub fn get_pending(conn: &Connection, id: &str) -> Result<Option<PendingMutation>> {
    let sql = format!("SELECT {} FROM pending_mutations WHERE id = ?", MUTATION_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], MutationRow::read)
        .optional()?;
    row.map(MutationRow::into_mutation).transpose()
}

/// Remove a queued mutation. Absent ids are not an error.
pub fn remove_mutation(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute("DELETE FROM pending_mutations WHERE id = ?", params![id])?;
    conn.execute(
        "DELETE FROM mutation_attempts WHERE mutation_id = ?",
        params![id],
    )?;
    Ok(affected > 0)
}

/// Remove every queued mutation
pub fn clear_pending(conn: &Connection) -> Result<usize> {
    let affected = conn.execute("DELETE FROM pending_mutations", [])?;
    conn.execute("DELETE FROM mutation_attempts", [])?;
    Ok(affected)
}

/// Number of queued mutations
pub fn count_pending(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

/// Record a failed remote attempt and return the attempt count so far
pub fn record_failure(conn: &Connection, id: &str, error: &str, now_ms: i64) -> Result<u32> {
    conn.execute(
        "INSERT INTO mutation_attempts (mutation_id, attempts, last_error, last_attempt_at)
         VALUES (?1, 1, ?2, ?3)
         ON CONFLICT(mutation_id) DO UPDATE SET
            attempts = attempts + 1,
            last_error = excluded.last_error,
            last_attempt_at = excluded.last_attempt_at",
        params![id, error, now_ms],
    )?;
    get_attempts(conn, id)
}

/// Failed attempts recorded for a mutation
pub fn get_attempts(conn: &Connection, id: &str) -> Result<u32> {
    let attempts: Option<i64> = conn
        .query_row(
            "SELECT attempts FROM mutation_attempts WHERE mutation_id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(attempts.unwrap_or(0) as u32)
}

fn dead_letter_from_row(row: &Row) -> rusqlite::Result<(MutationRow, i64, Option<String>, i64)> {
    Ok((
        MutationRow::read(row)?,
        row.get("attempts")?,
        row.get("last_error")?,
        row.get("dead_lettered_at")?,
    ))
}

fn into_dead_letter(
    (row, attempts, last_error, dead_lettered_at): (MutationRow, i64, Option<String>, i64),
) -> Result<DeadLetter> {
    Ok(DeadLetter {
        mutation: row.into_mutation()?,
        attempts: attempts as u32,
        last_error,
        dead_lettered_at,
    })
}

/// Move a queued mutation to the dead-letter table.
///
/// Run inside a transaction. Returns `None` if the mutation is not queued.
pub fn dead_letter_mutation(
    conn: &Connection,
    id: &str,
    now_ms: i64,
) -> Result<Option<DeadLetter>> {
    let moved = conn.execute(
        "INSERT OR REPLACE INTO dead_letters
            (id, table_name, operation, data, timestamp, user_id, attempts, last_error, dead_lettered_at)
         SELECT p.id, p.table_name, p.operation, p.data, p.timestamp, p.user_id,
                COALESCE(a.attempts, 0), a.last_error, ?2
         FROM pending_mutations p
         LEFT JOIN mutation_attempts a ON a.mutation_id = p.id
         WHERE p.id = ?1",
        params![id, now_ms],
    )?;

    if moved == 0 {
        return Ok(None);
    }

    remove_mutation(conn, id)?;
    get_dead_letter(conn, id)
}

/// Get a dead letter by mutation id
pub fn get_dead_letter(conn: &Connection, id: &str) -> Result<Option<DeadLetter>> {
    let sql = format!(
        "SELECT {}, attempts, last_error, dead_lettered_at FROM dead_letters WHERE id = ?",
        MUTATION_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![id], dead_letter_from_row)
        .optional()?;
    row.map(into_dead_letter).transpose()
}

/// All dead letters, most recent first
pub fn list_dead_letters(conn: &Connection) -> Result<Vec<DeadLetter>> {
    let sql = format!(
        "SELECT {}, attempts, last_error, dead_lettered_at FROM dead_letters
         ORDER BY dead_lettered_at DESC, rowid DESC",
        MUTATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], dead_letter_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(into_dead_letter).collect()
}

/// Put a dead letter back at the end of the queue with a clean attempt count.
///
/// Run inside a transaction.
pub fn requeue_dead_letter(conn: &Connection, id: &str, now_ms: i64) -> Result<bool> {
    let Some(dead) = get_dead_letter(conn, id)? else {
        return Ok(false);
    };

    let mutation = PendingMutation {
        timestamp: next_timestamp(conn, now_ms)?,
        ..dead.mutation
    };
    insert_pending(conn, &mutation)?;
    conn.execute("DELETE FROM dead_letters WHERE id = ?", params![id])?;

    Ok(true)
}

/// Delete every dead letter
pub fn purge_dead_letters(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM dead_letters", [])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn task_insert(id: &str) -> NewMutation {
        NewMutation::insert(Table::Tasks, json!({"id": id, "title": "Buy milk"}), "u1")
    }

    #[test]
    fn test_enqueue_assigns_id_and_timestamp() {
        let conn = setup();
        let a = enqueue_mutation(&conn, &task_insert("t1"), 1_000).unwrap();
        let b = enqueue_mutation(&conn, &task_insert("t2"), 2_000).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.timestamp, 1_000);
        assert_eq!(b.timestamp, 2_000);
        assert_eq!(get_pending(&conn, &a.id).unwrap(), Some(a));
    }

    #[test]
    fn test_clock_regression_keeps_insertion_order() {
        let conn = setup();
        let first = enqueue_mutation(&conn, &task_insert("t1"), 5_000).unwrap();
        let second = enqueue_mutation(&conn, &task_insert("t2"), 4_000).unwrap();
        let third = enqueue_mutation(&conn, &task_insert("t3"), 5_000).unwrap();

        assert_eq!(second.timestamp, 5_000);
        let ids: Vec<_> = list_pending(&conn).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[test]
    fn test_list_by_table() {
        let conn = setup();
        enqueue_mutation(&conn, &task_insert("t1"), 1).unwrap();
        enqueue_mutation(
            &conn,
            &NewMutation::insert(Table::Habits, json!({"id": "h1"}), "u1"),
            2,
        )
        .unwrap();

        let habits = list_pending_for_table(&conn, Table::Habits).unwrap();
        assert_eq!(habits.len(), 1);
        assert_eq!(habits[0].table, Table::Habits);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let conn = setup();
        let m = enqueue_mutation(&conn, &task_insert("t1"), 1).unwrap();

        assert!(remove_mutation(&conn, &m.id).unwrap());
        assert!(!remove_mutation(&conn, &m.id).unwrap());
        assert!(!remove_mutation(&conn, "missing").unwrap());
        assert_eq!(count_pending(&conn).unwrap(), 0);
    }

    #[test]
    fn test_record_failure_counts_attempts() {
        let conn = setup();
        let m = enqueue_mutation(&conn, &task_insert("t1"), 1).unwrap();

        assert_eq!(record_failure(&conn, &m.id, "timeout", 10).unwrap(), 1);
        assert_eq!(record_failure(&conn, &m.id, "refused", 20).unwrap(), 2);
        assert_eq!(get_attempts(&conn, &m.id).unwrap(), 2);

        // the envelope itself is untouched
        assert_eq!(get_pending(&conn, &m.id).unwrap(), Some(m));
    }

    #[test]
    fn test_dead_letter_and_requeue() {
        let conn = setup();
        let m = enqueue_mutation(&conn, &task_insert("t1"), 1).unwrap();
        record_failure(&conn, &m.id, "invalid payload", 5).unwrap();

        let dead = dead_letter_mutation(&conn, &m.id, 9).unwrap().unwrap();
        assert_eq!(dead.mutation, m);
        assert_eq!(dead.attempts, 1);
        assert_eq!(dead.last_error.as_deref(), Some("invalid payload"));
        assert_eq!(count_pending(&conn).unwrap(), 0);
        assert_eq!(get_attempts(&conn, &m.id).unwrap(), 0);

        let later = enqueue_mutation(&conn, &task_insert("t2"), 50).unwrap();
        assert!(requeue_dead_letter(&conn, &m.id, 40).unwrap());
        assert!(list_dead_letters(&conn).unwrap().is_empty());

        let pending = list_pending(&conn).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, later.id);
        assert_eq!(pending[1].id, m.id);
        assert_eq!(pending[1].timestamp, 50);
    }

    #[test]
    fn test_dead_letter_missing_is_none() {
        let conn = setup();
        assert!(dead_letter_mutation(&conn, "missing", 1).unwrap().is_none());
        assert!(!requeue_dead_letter(&conn, "missing", 1).unwrap());
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let conn = setup();
        conn.execute(
            "INSERT INTO pending_mutations (id, table_name, operation, data, timestamp, user_id)
             VALUES ('bad', 'todo_items', 'INSERT', '{}', 1, 'u1')",
            [],
        )
        .unwrap();

        let err = list_pending(&conn).unwrap_err();
        assert!(matches!(err, LifesyncError::Corrupt(_)));
        assert!(err.is_persistence());
    }
}
