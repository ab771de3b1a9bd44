//! Shared test backend

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use lifesync::sync::{record_id, InMemoryBackend, RemoteBackend, RemoteError};
use lifesync::types::{Operation, Table};

/// Wraps [`InMemoryBackend`], logging every attempt and failing chosen record ids
#[derive(Default)]
pub struct RecordingBackend {
    pub inner: InMemoryBackend,
    calls: Mutex<Vec<(Operation, String)>>,
    fail_ids: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every call touching this record id
    pub fn fail_record(&self, id: &str) {
        self.fail_ids.lock().insert(id.to_string());
    }

    /// Every call made, in order, as (operation, record id)
    pub fn calls(&self) -> Vec<(Operation, String)> {
        self.calls.lock().clone()
    }

    fn attempt(&self, operation: Operation, id: &str) -> Result<(), RemoteError> {
        self.calls.lock().push((operation, id.to_string()));
        if self.fail_ids.lock().contains(id) {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!("rejected {}", id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for RecordingBackend {
    async fn insert(&self, table: Table, record: &Value) -> Result<(), RemoteError> {
        let id = record_id(record, "id")?;
        self.attempt(Operation::Insert, &id)?;
        self.inner.insert(table, record).await
    }

    async fn update(&self, table: Table, id: &str, changes: &Value) -> Result<(), RemoteError> {
        self.attempt(Operation::Update, id)?;
        self.inner.update(table, id, changes).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.attempt(Operation::Delete, id)?;
        self.inner.delete(table, id).await
    }

    fn name(&self) -> &str {
        "recording"
    }
}
