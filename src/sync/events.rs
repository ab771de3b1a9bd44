//! Notices published by the connectivity monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MutationId, SyncSummary};

/// Types of monitor events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WentOffline,
    BackOnline,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    MutationDeadLettered,
}

/// A monitor event, suitable for transient UI notices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Pending mutations when the event was emitted
    pub pending: usize,
    pub summary: Option<SyncSummary>,
    pub mutation_id: Option<MutationId>,
    pub error: Option<String>,
}

impl MonitorEvent {
    fn new(event_type: EventType, pending: usize) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            pending,
            summary: None,
            mutation_id: None,
            error: None,
        }
    }

    pub fn went_offline(pending: usize) -> Self {
        Self::new(EventType::WentOffline, pending)
    }

    pub fn back_online(pending: usize) -> Self {
        Self::new(EventType::BackOnline, pending)
    }

    pub fn sync_started(pending: usize) -> Self {
        Self::new(EventType::SyncStarted, pending)
    }

    pub fn sync_completed(summary: SyncSummary, pending: usize) -> Self {
        Self {
            summary: Some(summary),
            ..Self::new(EventType::SyncCompleted, pending)
        }
    }

    pub fn sync_failed(error: &str, pending: usize) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(EventType::SyncFailed, pending)
        }
    }

    pub fn dead_lettered(mutation_id: MutationId, error: &str, pending: usize) -> Self {
        Self {
            mutation_id: Some(mutation_id),
            error: Some(error.to_string()),
            ..Self::new(EventType::MutationDeadLettered, pending)
        }
    }

    /// Short human-readable notice
    pub fn message(&self) -> String {
        match self.event_type {
            EventType::WentOffline => {
                "You're offline. Changes will sync when you reconnect.".to_string()
            }
            EventType::BackOnline => format!("Back online, {} changes to sync", self.pending),
            EventType::SyncStarted => format!("Syncing {} changes", self.pending),
            EventType::SyncCompleted => match &self.summary {
                Some(s) if s.failed > 0 => {
                    format!("{} changes synced, {} failed", s.synced, s.failed)
                }
                Some(s) => format!("{} changes synced", s.synced),
                None => "Sync complete".to_string(),
            },
            EventType::SyncFailed => format!(
                "Sync failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            EventType::MutationDeadLettered => format!(
                "Change {} was dropped after repeated failures",
                self.mutation_id.as_deref().unwrap_or("?")
            ),
        }
    }
}
