//! Drains the mutation queue against a remote backend

use std::sync::Arc;

use tokio::sync::Mutex;

use super::backend::{record_id, split_update, RemoteBackend, RemoteError};
use crate::error::Result;
use crate::storage::QueueStore;
use crate::types::*;

/// Applies pending mutations to the remote backend in queue order
pub struct SyncEngine {
    store: QueueStore,
    backend: Arc<dyn RemoteBackend>,
    id_field: String,
    max_attempts: Option<u32>,
    /// Held for the duration of a drain
    in_flight: Mutex<()>,
}

impl SyncEngine {
    /// Build an engine; id field and attempt limit come from the store's config
    pub fn new(store: QueueStore, backend: Arc<dyn RemoteBackend>) -> Self {
        let id_field = store.config().id_field.clone();
        let max_attempts = store.config().max_attempts;
        Self {
            store,
            backend,
            id_field,
            max_attempts,
            in_flight: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    /// Whether a drain is running right now
    pub fn is_syncing(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Drain the queue, waiting for any drain already in flight to finish first.
    ///
    /// Per-mutation failures are folded into the summary. Only a failure to
    /// read the queue itself is returned as an error.
    pub async fn sync_pending_mutations(&self) -> Result<SyncSummary> {
        let _guard = self.in_flight.lock().await;
        self.drain().await
    }

    /// Drain the queue unless a drain is already in flight (`Ok(None)`)
    pub async fn try_sync(&self) -> Result<Option<SyncSummary>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("Sync already in flight, skipping");
            return Ok(None);
        };
        self.drain().await.map(Some)
    }

    async fn drain(&self) -> Result<SyncSummary> {
        let pending = self.store.list_pending().map_err(|e| {
            tracing::error!("Cannot read pending mutations: {}", e);
            e
        })?;

        let mut summary = SyncSummary::default();
        if pending.is_empty() {
            return Ok(summary);
        }

        tracing::info!(
            "Syncing {} pending mutations to {}",
            pending.len(),
            self.backend.name()
        );

        for mutation in &pending {
            match self.apply(mutation).await {
                Ok(()) => {
                    summary.synced += 1;
                    if let Err(e) = self.store.remove(&mutation.id) {
                        // Applied remotely but still queued; the next drain replays it
                        tracing::error!(
                            "Applied mutation {} but could not dequeue it: {}",
                            mutation.id,
                            e
                        );
                        summary.dequeue_failed += 1;
                        summary.failures.push(MutationFailure {
                            mutation_id: mutation.id.clone(),
                            table: mutation.table,
                            operation: mutation.operation,
                            error: e.to_string(),
                            attempts: 0,
                            dead_lettered: false,
                            applied: true,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to sync {} on {} ({}): {}",
                        mutation.operation,
                        mutation.table,
                        mutation.id,
                        e
                    );
                    let failure = self.record_failure(mutation, &e);
                    if failure.dead_lettered {
                        summary.dead_lettered += 1;
                    }
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
            }
        }

        tracing::info!(
            "Sync finished: {} synced, {} failed, {} dead-lettered, {} not dequeued",
            summary.synced,
            summary.failed,
            summary.dead_lettered,
            summary.dequeue_failed
        );

        Ok(summary)
    }

    /// Dispatch one mutation to the backend
    async fn apply(&self, mutation: &PendingMutation) -> std::result::Result<(), RemoteError> {
        match mutation.operation {
            Operation::Insert => self.backend.insert(mutation.table, &mutation.data).await,
            Operation::Update => {
                let (id, changes) = split_update(&mutation.data, &self.id_field)?;
                self.backend.update(mutation.table, &id, &changes).await
            }
            Operation::Delete => {
                let id = record_id(&mutation.data, &self.id_field)?;
                self.backend.delete(mutation.table, &id).await
            }
        }
    }

    /// Count the failed attempt and dead-letter the mutation once it is exhausted
    fn record_failure(&self, mutation: &PendingMutation, error: &RemoteError) -> MutationFailure {
        let mut failure = MutationFailure {
            mutation_id: mutation.id.clone(),
            table: mutation.table,
            operation: mutation.operation,
            error: error.to_string(),
            attempts: 0,
            dead_lettered: false,
            applied: false,
        };

        failure.attempts = match self.store.record_failure(&mutation.id, &failure.error) {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!("Could not record attempt for {}: {}", mutation.id, e);
                return failure;
            }
        };

        if let Some(max) = self.max_attempts {
            if failure.attempts >= max {
                match self.store.dead_letter(&mutation.id) {
                    Ok(Some(_)) => {
                        tracing::error!(
                            "Mutation {} dead-lettered after {} attempts: {}",
                            mutation.id,
                            failure.attempts,
                            failure.error
                        );
                        failure.dead_lettered = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("Could not dead-letter {}: {}", mutation.id, e);
                    }
                }
            }
        }

        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::InMemoryBackend;
    use serde_json::json;

    fn engine_with(config: QueueConfig) -> (SyncEngine, Arc<InMemoryBackend>) {
        let store = QueueStore::open(config).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        (SyncEngine::new(store, backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (engine, backend) = engine_with(QueueConfig::in_memory());
        let summary = engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary, SyncSummary::default());
        assert_eq!(backend.attempts(), 0);
    }

    #[tokio::test]
    async fn test_update_sends_changes_without_id() {
        let (engine, backend) = engine_with(QueueConfig::in_memory());
        backend.seed(Table::Tasks, json!({"id": "t1", "title": "v1"}));
        engine
            .store()
            .enqueue(NewMutation::update(Table::Tasks, json!({"id": "t1", "title": "v2"}), "u1"))
            .unwrap();

        let summary = engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary.synced, 1);

        let applied = backend.applied();
        assert_eq!(applied[0].record_id, "t1");
        assert_eq!(applied[0].payload, json!({"title": "v2"}));
    }

    #[tokio::test]
    async fn test_missing_id_counts_as_failure() {
        let (engine, backend) = engine_with(QueueConfig::in_memory());
        let id = engine
            .store()
            .enqueue(NewMutation::delete(Table::Budgets, json!({"name": "food"}), "u1"))
            .unwrap();

        let summary = engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].mutation_id, id);
        assert!(summary.failures[0].error.contains("missing id"));
        assert_eq!(backend.attempts(), 0);
        assert_eq!(engine.store().attempts(&id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let config = QueueConfig {
            max_attempts: Some(2),
            ..QueueConfig::in_memory()
        };
        let (engine, _backend) = engine_with(config);
        let id = engine
            .store()
            .enqueue(NewMutation::update(Table::Tasks, json!({"id": "gone"}), "u1"))
            .unwrap();

        let first = engine.sync_pending_mutations().await.unwrap();
        assert_eq!((first.failed, first.dead_lettered), (1, 0));
        assert_eq!(engine.store().size().unwrap(), 1);

        let second = engine.sync_pending_mutations().await.unwrap();
        assert_eq!((second.failed, second.dead_lettered), (1, 1));
        assert!(second.failures[0].dead_lettered);
        assert_eq!(engine.store().size().unwrap(), 0);

        let dead = engine.store().list_dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].mutation.id, id);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_unbounded_attempts_keep_mutation() {
        let config = QueueConfig {
            max_attempts: None,
            ..QueueConfig::in_memory()
        };
        let (engine, _backend) = engine_with(config);
        engine
            .store()
            .enqueue(NewMutation::update(Table::Tasks, json!({"id": "gone"}), "u1"))
            .unwrap();

        for _ in 0..5 {
            engine.sync_pending_mutations().await.unwrap();
        }
        assert_eq!(engine.store().size().unwrap(), 1);
        assert!(engine.store().list_dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_failure_reported_in_summary() {
        let (engine, backend) = engine_with(QueueConfig::in_memory());
        let id = engine
            .store()
            .enqueue(NewMutation::insert(Table::Goals, json!({"id": "g1"}), "u1"))
            .unwrap();
        engine
            .store()
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER block_dequeue BEFORE DELETE ON pending_mutations
                     BEGIN SELECT RAISE(ABORT, 'queue is read-only'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let summary = engine.sync_pending_mutations().await.unwrap();

        assert_eq!((summary.synced, summary.failed), (1, 0));
        assert_eq!(summary.dequeue_failed, 1);
        assert!(!summary.is_clean());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].mutation_id, id);
        assert!(summary.failures[0].applied);
        assert!(!summary.failures[0].dead_lettered);

        assert_eq!(backend.record(Table::Goals, "g1"), Some(json!({"id": "g1"})));
        assert_eq!(engine.store().size().unwrap(), 1);
        assert_eq!(engine.store().attempts(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_try_sync_skips_while_in_flight() {
        let (engine, _backend) = engine_with(QueueConfig::in_memory());
        let _held = engine.in_flight.lock().await;

        assert!(engine.is_syncing());
        assert_eq!(engine.try_sync().await.unwrap(), None);
    }
}
