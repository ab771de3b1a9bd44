//! Core types for lifesync

use serde::{Deserialize, Serialize};

use crate::error::LifesyncError;

/// Unique identifier for a queued mutation
pub type MutationId = String;

/// Remote tables that accept offline writes.
///
/// Each variant maps to exactly one backend table name, so a misspelled
/// table is a compile error instead of a failure during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tasks,
    Habits,
    HabitCompletions,
    Transactions,
    Budgets,
    JournalEntries,
    Memories,
    Goals,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Tasks,
        Table::Habits,
        Table::HabitCompletions,
        Table::Transactions,
        Table::Budgets,
        Table::JournalEntries,
        Table::Memories,
        Table::Goals,
    ];

    /// Backend table name
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tasks => "tasks",
            Table::Habits => "habits",
            Table::HabitCompletions => "habit_completions",
            Table::Transactions => "transactions",
            Table::Budgets => "budgets",
            Table::JournalEntries => "journal_entries",
            Table::Memories => "memories",
            Table::Goals => "goals",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = LifesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LifesyncError::InvalidInput(format!("Unknown table: {}", s)))
    }
}

/// Kind of write carried by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = LifesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(LifesyncError::InvalidInput(format!(
                "Unknown operation: {}",
                s
            ))),
        }
    }
}

/// Mutation as handed to the queue; id and timestamp are assigned on enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMutation {
    pub table: Table,
    pub operation: Operation,
    /// Full record for INSERT, record plus id for UPDATE, id only for DELETE
    pub data: serde_json::Value,
    pub user_id: String,
}

impl NewMutation {
    pub fn insert(table: Table, data: serde_json::Value, user_id: impl Into<String>) -> Self {
        Self {
            table,
            operation: Operation::Insert,
            data,
            user_id: user_id.into(),
        }
    }

    pub fn update(table: Table, data: serde_json::Value, user_id: impl Into<String>) -> Self {
        Self {
            table,
            operation: Operation::Update,
            data,
            user_id: user_id.into(),
        }
    }

    pub fn delete(table: Table, data: serde_json::Value, user_id: impl Into<String>) -> Self {
        Self {
            table,
            operation: Operation::Delete,
            data,
            user_id: user_id.into(),
        }
    }
}

/// A mutation waiting in the local queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: MutationId,
    pub table: Table,
    pub operation: Operation,
    pub data: serde_json::Value,
    /// Enqueue time in milliseconds since epoch; drain order
    pub timestamp: i64,
    pub user_id: String,
}

/// A mutation that exhausted its attempts and left the active queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub mutation: PendingMutation,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: i64,
}

/// One mutation that did not leave the queue cleanly during a drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationFailure {
    pub mutation_id: MutationId,
    pub table: Table,
    pub operation: Operation,
    pub error: String,
    /// Attempts recorded so far, including this one (0 if bookkeeping failed)
    pub attempts: u32,
    pub dead_lettered: bool,
    /// The remote accepted the write but the local dequeue failed, so the
    /// mutation is still queued and will be replayed
    #[serde(default)]
    pub applied: bool,
}

/// Result of one drain of the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Applied remotely, including those that could not be dequeued
    pub synced: usize,
    /// Not applied; includes dead-lettered mutations
    pub failed: usize,
    pub dead_lettered: usize,
    /// Applied remotely but still queued locally
    #[serde(default)]
    pub dequeue_failed: usize,
    #[serde(default)]
    pub failures: Vec<MutationFailure>,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dequeue_failed == 0
    }
}

/// Connectivity and queue state observed by the UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    pub was_offline: bool,
    pub pending_mutations: usize,
    pub is_syncing: bool,
}

/// Queue storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Path to the SQLite queue database (":memory:" for tests)
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
    /// Upper bound on database size; writes beyond it fail with a quota error
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    /// Field of `data` that identifies the remote record
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Failed attempts before a mutation is dead-lettered (None = retry forever)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_db_path() -> String {
    "~/.local/share/lifesync/queue.db".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_mode: StorageMode::default(),
            max_size_bytes: None,
            id_field: default_id_field(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    /// In-memory queue, used by tests and dry runs
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            ..Default::default()
        }
    }
}

/// Journal mode of the queue database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// WAL journal, for local disks
    #[default]
    Local,
    /// Single-file DELETE journal, for synced folders
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = LifesyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" => Ok(StorageMode::CloudSafe),
            _ => Err(LifesyncError::Config(format!("Unknown storage mode: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_roundtrip() {
        for table in Table::ALL {
            let parsed: Table = table.as_str().parse().unwrap();
            assert_eq!(table, parsed);
        }
        assert!(matches!(
            "task".parse::<Table>(),
            Err(LifesyncError::InvalidInput(_))
        ));
        assert_eq!(" Tasks ".parse::<Table>().unwrap(), Table::Tasks);
    }

    #[test]
    fn test_operation_serde_uppercase() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert!("UPSERT".parse::<Operation>().is_err());
    }

    #[test]
    fn test_pending_mutation_json_shape() {
        let mutation = PendingMutation {
            id: "m1".to_string(),
            table: Table::JournalEntries,
            operation: Operation::Insert,
            data: serde_json::json!({"id": "j1"}),
            timestamp: 42,
            user_id: "u1".to_string(),
        };
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["table"], "journal_entries");
        assert_eq!(value["operation"], "INSERT");
        assert_eq!(value["userId"], "u1");
    }

    #[test]
    fn test_queue_config_defaults() {
        let config: QueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.id_field, "id");
        assert_eq!(config.max_attempts, Some(10));
        assert_eq!(config.storage_mode, StorageMode::Local);
    }
}
