//! Error types for lifesync

use thiserror::Error;

use crate::sync::RemoteError;

/// Result type alias for lifesync operations
pub type Result<T> = std::result::Result<T, LifesyncError>;

/// Main error type for lifesync
#[derive(Error, Debug)]
pub enum LifesyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt queue record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote backend error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifesyncError {
    /// Whether the local queue store failed (unavailable, full or corrupt).
    ///
    /// Callers of `enqueue` must surface these to the user: the mutation was
    /// not persisted and there is no secondary fallback.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            LifesyncError::Database(_)
                | LifesyncError::Corrupt(_)
                | LifesyncError::Serialization(_)
                | LifesyncError::Io(_)
        )
    }

    /// Whether the storage write was rejected because the quota is exhausted
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            LifesyncError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            LifesyncError::Remote(e) => e.is_transient(),
            LifesyncError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_classification() {
        assert!(LifesyncError::Io(std::io::Error::other("disk gone")).is_persistence());
        assert!(LifesyncError::Corrupt("bad operation".into()).is_persistence());
        assert!(!LifesyncError::Config("missing url".into()).is_persistence());
        assert!(!LifesyncError::Remote(RemoteError::NotFound("t1".into())).is_persistence());
    }

    #[test]
    fn test_retryable() {
        assert!(LifesyncError::Remote(RemoteError::Network("reset".into())).is_retryable());
        assert!(!LifesyncError::Remote(RemoteError::NotFound("t1".into())).is_retryable());
        assert!(!LifesyncError::InvalidInput("x".into()).is_retryable());
    }
}
