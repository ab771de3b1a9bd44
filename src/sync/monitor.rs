//! Connectivity monitor with debounced reconnect sync
//!
//! Bridges online/offline signals to the [`SyncEngine`]. A background task
//! owns the observable [`ConnectivityState`], guarantees a single drain in
//! flight and refreshes the pending count on a timer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use super::backend::RemoteBackend;
use super::engine::SyncEngine;
use super::events::MonitorEvent;
use crate::error::{LifesyncError, Result};
use crate::types::{ConnectivityState, SyncSummary};

/// Monitor timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Wait after coming online before draining, so the network stack settles
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Safety-net refresh of the pending count
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Drain once at start when online and mutations are already queued
    #[serde(default = "default_true")]
    pub sync_on_start: bool,
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_refresh_interval() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            refresh_interval_ms: default_refresh_interval(),
            sync_on_start: default_true(),
        }
    }
}

/// Commands for the monitor worker
#[derive(Debug)]
enum MonitorCommand {
    Online,
    Offline,
    SyncNow,
    Refresh,
    Stop,
}

/// Handle to the monitor worker. Clones talk to the same worker.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    sender: mpsc::Sender<MonitorCommand>,
    state: watch::Receiver<ConnectivityState>,
    events: broadcast::Sender<MonitorEvent>,
}

impl ConnectivityMonitor {
    /// Start the monitor worker on the current tokio runtime
    pub fn start(engine: Arc<SyncEngine>, config: MonitorConfig, initially_online: bool) -> Self {
        let pending_mutations = engine.store().size().unwrap_or_else(|e| {
            tracing::warn!("Could not read pending mutation count: {}", e);
            0
        });
        let (sender, receiver) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectivityState {
            is_online: initially_online,
            pending_mutations,
            ..Default::default()
        });
        let (events, _) = broadcast::channel(256);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            engine,
            config,
            state: state_tx,
            events: events.clone(),
            done_tx,
            rerun_requested: false,
        };
        tokio::spawn(worker.run(receiver, done_rx));

        Self {
            sender,
            state: state_rx,
            events,
        }
    }

    async fn send(&self, command: MonitorCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| LifesyncError::Sync("Monitor channel closed".to_string()))
    }

    /// Platform reported the network as available
    pub async fn set_online(&self) -> Result<()> {
        self.send(MonitorCommand::Online).await
    }

    /// Platform reported the network as gone
    pub async fn set_offline(&self) -> Result<()> {
        self.send(MonitorCommand::Offline).await
    }

    /// Drain now if online; deferred if a drain is running
    pub async fn sync_now(&self) -> Result<()> {
        self.send(MonitorCommand::SyncNow).await
    }

    /// Re-read the pending count, e.g. right after an enqueue
    pub async fn refresh(&self) -> Result<()> {
        self.send(MonitorCommand::Refresh).await
    }

    /// Stop the worker. A drain in flight runs to completion.
    pub async fn stop(&self) -> Result<()> {
        self.send(MonitorCommand::Stop).await
    }

    /// Whether the worker is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Current state snapshot
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.clone()
    }

    /// Subscribe to monitor events
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }
}

struct Worker {
    engine: Arc<SyncEngine>,
    config: MonitorConfig,
    state: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<MonitorEvent>,
    done_tx: mpsc::UnboundedSender<Result<SyncSummary>>,
    /// A sync was requested while one was running
    rerun_requested: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MonitorCommand>,
        mut done_rx: mpsc::UnboundedReceiver<Result<SyncSummary>>,
    ) {
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut refresh = interval(Duration::from_millis(self.config.refresh_interval_ms.max(1)));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and doubles as the on-mount refresh
        refresh.tick().await;

        let pending = self.refresh_pending();
        let mut reconnect_at: Option<Instant> = None;
        if self.config.sync_on_start && self.state.borrow().is_online && pending > 0 {
            reconnect_at = Some(Instant::now() + reconnect_delay);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Online) => {
                        if self.go_online() {
                            reconnect_at = Some(Instant::now() + reconnect_delay);
                        }
                    }
                    Some(MonitorCommand::Offline) => {
                        self.go_offline();
                        reconnect_at = None;
                    }
                    Some(MonitorCommand::SyncNow) => self.start_sync(),
                    Some(MonitorCommand::Refresh) => {
                        self.refresh_pending();
                    }
                    Some(MonitorCommand::Stop) | None => break,
                },
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    reconnect_at = None;
                    self.start_sync();
                }
                _ = refresh.tick() => {
                    self.refresh_pending();
                }
                Some(result) = done_rx.recv() => self.finish_sync(result),
            }
        }

        tracing::info!("Connectivity monitor stopped");
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    fn pending(&self) -> usize {
        self.state.borrow().pending_mutations
    }

    /// Re-read the queue size; keeps the last known value if the store fails
    fn refresh_pending(&self) -> usize {
        match self.engine.store().size() {
            Ok(count) => {
                self.state.send_if_modified(|state| {
                    let changed = state.pending_mutations != count;
                    state.pending_mutations = count;
                    changed
                });
                count
            }
            Err(e) => {
                tracing::warn!("Could not refresh pending mutation count: {}", e);
                self.pending()
            }
        }
    }

    /// Returns true on an offline to online transition
    fn go_online(&mut self) -> bool {
        if self.state.borrow().is_online {
            return false;
        }
        self.state.send_modify(|state| state.is_online = true);
        let pending = self.refresh_pending();
        tracing::info!("Back online with {} pending mutations", pending);
        self.emit(MonitorEvent::back_online(pending));
        true
    }

    fn go_offline(&mut self) {
        if !self.state.borrow().is_online {
            return;
        }
        self.state.send_modify(|state| {
            state.is_online = false;
            state.was_offline = true;
        });
        tracing::info!("Went offline; mutations will be queued");
        self.emit(MonitorEvent::went_offline(self.pending()));
    }

    /// Start a drain unless offline or one is already running
    fn start_sync(&mut self) {
        let current = *self.state.borrow();
        if !current.is_online {
            tracing::debug!("Offline, sync request ignored");
            return;
        }
        if current.is_syncing {
            tracing::debug!("Sync in progress, request deferred");
            self.rerun_requested = true;
            return;
        }

        self.state.send_modify(|state| state.is_syncing = true);
        self.emit(MonitorEvent::sync_started(current.pending_mutations));

        let engine = self.engine.clone();
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            // Waits out a drain started elsewhere, then lists the queue afresh
            let result = engine.sync_pending_mutations().await;
            // The worker may have stopped meanwhile
            let _ = done.send(result);
        });
    }

    fn finish_sync(&mut self, result: Result<SyncSummary>) {
        self.state.send_modify(|state| state.is_syncing = false);
        let pending = self.refresh_pending();

        match result {
            Ok(summary) => {
                for failure in summary.failures.iter().filter(|f| f.dead_lettered) {
                    self.emit(MonitorEvent::dead_lettered(
                        failure.mutation_id.clone(),
                        &failure.error,
                        pending,
                    ));
                }
                self.emit(MonitorEvent::sync_completed(summary, pending));
            }
            Err(e) => {
                tracing::error!("Sync failed: {}", e);
                self.emit(MonitorEvent::sync_failed(&e.to_string(), pending));
            }
        }

        if std::mem::take(&mut self.rerun_requested) && pending > 0 {
            self.start_sync();
        }
    }
}

/// Poll the backend's health check and forward transitions to the monitor.
///
/// Stands in for platform online/offline events. Ends when the monitor stops.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    backend: Arc<dyn RemoteBackend>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !monitor.is_running() {
                break;
            }
            let reachable = backend.health_check().await.is_ok();
            let result = match (reachable, monitor.state().is_online) {
                (true, false) => monitor.set_online().await,
                (false, true) => monitor.set_offline().await,
                _ => Ok(()),
            };
            if result.is_err() {
                break;
            }
        }
    })
}
