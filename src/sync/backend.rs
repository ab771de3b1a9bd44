//! Remote data backend abstraction

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::Table;

/// Failure reported by a remote backend for one call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    /// Whether the failure is likely to clear up on its own
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Rejected { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Capability to apply writes to the remote store.
///
/// Implementations decide transport and authentication; the sync engine
/// only needs success or a [`RemoteError`] per call.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a full record
    async fn insert(&self, table: Table, record: &Value) -> Result<(), RemoteError>;

    /// Apply a partial update to the record identified by `id`
    async fn update(&self, table: Table, id: &str, changes: &Value) -> Result<(), RemoteError>;

    /// Delete the record identified by `id`
    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;

    /// Cheap reachability check used by the connectivity probe
    async fn health_check(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Extract the record id from a payload; strings and integers are accepted
pub fn record_id(data: &Value, id_field: &str) -> Result<String, RemoteError> {
    match data.get(id_field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(other) => Err(RemoteError::InvalidPayload(format!(
            "field '{}' is not a usable id: {}",
            id_field, other
        ))),
        None => Err(RemoteError::InvalidPayload(format!(
            "missing id field '{}'",
            id_field
        ))),
    }
}

/// Split an UPDATE payload into its record id and the remaining fields
pub fn split_update(data: &Value, id_field: &str) -> Result<(String, Value), RemoteError> {
    let id = record_id(data, id_field)?;
    let mut changes = data
        .as_object()
        .cloned()
        .ok_or_else(|| RemoteError::InvalidPayload("update payload is not an object".to_string()))?;
    changes.remove(id_field);
    Ok((id, Value::Object(changes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({"id": "t1"}), "id"), Ok("t1".to_string()));
        assert_eq!(record_id(&json!({"id": 42}), "id"), Ok("42".to_string()));
        assert_eq!(
            record_id(&json!({"uuid": "a"}), "uuid"),
            Ok("a".to_string())
        );
        assert!(record_id(&json!({"title": "x"}), "id").is_err());
        assert!(record_id(&json!({"id": ""}), "id").is_err());
        assert!(record_id(&json!({"id": 1.5}), "id").is_err());
        assert!(record_id(&json!("t1"), "id").is_err());
    }

    #[test]
    fn test_split_update() {
        let (id, changes) = split_update(&json!({"id": "t1", "title": "v2"}), "id").unwrap();
        assert_eq!(id, "t1");
        assert_eq!(changes, json!({"title": "v2"}));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Rejected { status: 503, message: String::new() }.is_transient());
        assert!(!RemoteError::Rejected { status: 400, message: String::new() }.is_transient());
        assert!(!RemoteError::Conflict("dup".into()).is_transient());
    }
}
