//! In-process remote backend
//!
//! Keeps records in memory with primary-key semantics close to the real
//! backend: duplicate inserts conflict, updates need an existing record,
//! deletes are idempotent. Used for tests, benches and CLI dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::backend::{record_id, RemoteBackend, RemoteError};
use crate::types::{Operation, Table};

/// A call the backend accepted
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCall {
    pub table: Table,
    pub operation: Operation,
    pub record_id: String,
    pub payload: Value,
}

/// In-memory [`RemoteBackend`] with failure injection
pub struct InMemoryBackend {
    id_field: String,
    records: Mutex<HashMap<Table, HashMap<String, Value>>>,
    applied: Mutex<Vec<AppliedCall>>,
    injected: Mutex<VecDeque<RemoteError>>,
    attempts: Mutex<usize>,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_id_field("id")
    }

    pub fn with_id_field(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            records: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            injected: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(0),
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Seed a record as if another device had written it
    pub fn seed(&self, table: Table, record: Value) {
        if let Ok(id) = record_id(&record, &self.id_field) {
            self.records.lock().entry(table).or_default().insert(id, record);
        }
    }

    /// Remove a record as if another device had deleted it
    pub fn forget(&self, table: Table, id: &str) {
        if let Some(rows) = self.records.lock().get_mut(&table) {
            rows.remove(id);
        }
    }

    pub fn record(&self, table: Table, id: &str) -> Option<Value> {
        self.records
            .lock()
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn record_count(&self, table: Table) -> usize {
        self.records.lock().get(&table).map_or(0, |rows| rows.len())
    }

    /// Fail the next call with `error`; queued errors are used in order
    pub fn fail_next(&self, error: RemoteError) {
        self.injected.lock().push_back(error);
    }

    /// While offline every call fails with a network error
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay every call, to keep a drain in flight
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Calls that succeeded, in order
    pub fn applied(&self) -> Vec<AppliedCall> {
        self.applied.lock().clone()
    }

    /// Calls made, successful or not
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    async fn begin_call(&self) -> Result<(), RemoteError> {
        *self.attempts.lock() += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        if let Some(error) = self.injected.lock().pop_front() {
            return Err(error);
        }
        Ok(())
    }

    fn log(&self, table: Table, operation: Operation, record_id: String, payload: Value) {
        self.applied.lock().push(AppliedCall {
            table,
            operation,
            record_id,
            payload,
        });
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn insert(&self, table: Table, record: &Value) -> Result<(), RemoteError> {
        self.begin_call().await?;
        let id = record_id(record, &self.id_field)?;

        {
            let mut records = self.records.lock();
            let rows = records.entry(table).or_default();
            if rows.contains_key(&id) {
                return Err(RemoteError::Conflict(format!(
                    "duplicate key {} in {}",
                    id, table
                )));
            }
            rows.insert(id.clone(), record.clone());
        }

        self.log(table, Operation::Insert, id, record.clone());
        Ok(())
    }

    async fn update(&self, table: Table, id: &str, changes: &Value) -> Result<(), RemoteError> {
        self.begin_call().await?;
        let fields = changes
            .as_object()
            .ok_or_else(|| RemoteError::InvalidPayload("changes must be an object".to_string()))?;

        {
            let mut records = self.records.lock();
            let existing = records
                .get_mut(&table)
                .and_then(|rows| rows.get_mut(id))
                .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", table, id)))?;
            if let Some(target) = existing.as_object_mut() {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        self.log(table, Operation::Update, id.to_string(), changes.clone());
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.begin_call().await?;

        if let Some(rows) = self.records.lock().get_mut(&table) {
            rows.remove(id);
        }

        self.log(table, Operation::Delete, id.to_string(), Value::Null);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("backend unreachable".to_string()))
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_update_delete() {
        let backend = InMemoryBackend::new();
        backend
            .insert(Table::Tasks, &json!({"id": "t1", "title": "v1"}))
            .await
            .unwrap();
        backend
            .update(Table::Tasks, "t1", &json!({"title": "v2"}))
            .await
            .unwrap();
        assert_eq!(
            backend.record(Table::Tasks, "t1"),
            Some(json!({"id": "t1", "title": "v2"}))
        );

        backend.delete(Table::Tasks, "t1").await.unwrap();
        backend.delete(Table::Tasks, "t1").await.unwrap();
        assert_eq!(backend.record_count(Table::Tasks), 0);
        assert_eq!(backend.applied().len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let backend = InMemoryBackend::new();
        let record = json!({"id": "t1"});
        backend.insert(Table::Tasks, &record).await.unwrap();
        let err = backend.insert(Table::Tasks, &record).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let backend = InMemoryBackend::new();
        let err = backend
            .update(Table::Habits, "h1", &json!({"name": "run"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_and_offline() {
        let backend = InMemoryBackend::new();
        backend.fail_next(RemoteError::Rejected {
            status: 400,
            message: "bad".into(),
        });
        assert!(backend.insert(Table::Goals, &json!({"id": 1})).await.is_err());
        assert!(backend.insert(Table::Goals, &json!({"id": 1})).await.is_ok());

        backend.set_online(false);
        let err = backend.delete(Table::Goals, "1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.health_check().await.is_err());
        assert_eq!(backend.attempts(), 3);
    }
}
