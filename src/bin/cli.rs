//! lifesync CLI
//!
//! Inspect, edit and drain the offline mutation queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lifesync::storage::QueueStore;
use lifesync::sync::{spawn_probe, ConnectivityMonitor, MonitorConfig, RemoteBackend, SyncEngine};
use lifesync::types::*;

#[derive(Parser)]
#[command(name = "lifesync")]
#[command(about = "Offline mutation queue CLI")]
#[command(version)]
struct Cli {
    /// Queue database path
    #[arg(
        long,
        env = "LIFESYNC_DB_PATH",
        default_value = "~/.local/share/lifesync/queue.db"
    )]
    db_path: String,

    /// Storage mode (local, cloud-safe)
    #[arg(long, env = "LIFESYNC_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// Failed attempts before a mutation is dead-lettered (0 = never)
    #[arg(long, env = "LIFESYNC_MAX_ATTEMPTS", default_value = "10")]
    max_attempts: u32,

    /// Remote project URL
    #[arg(long, env = "LIFESYNC_REMOTE_URL")]
    remote_url: Option<String>,

    /// Remote API key
    #[arg(long, env = "LIFESYNC_API_KEY")]
    api_key: Option<String>,

    /// User access token
    #[arg(long, env = "LIFESYNC_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation
    Enqueue {
        /// Target table (tasks, habits, transactions, ...)
        table: String,
        /// INSERT, UPDATE or DELETE
        operation: String,
        /// Payload as JSON
        data: String,
        /// Owning user
        #[arg(short, long)]
        user: String,
    },
    /// List pending mutations in drain order
    List {
        /// Only mutations for this table
        #[arg(short, long)]
        table: Option<String>,
    },
    /// Print the number of pending mutations
    Size,
    /// Remove one pending mutation
    Remove {
        /// Mutation ID
        id: String,
    },
    /// Remove every pending mutation
    Clear,
    /// Drain the queue against the remote backend
    Sync,
    /// List dead-lettered mutations
    DeadLetters,
    /// Move a dead letter back into the queue
    Requeue {
        /// Mutation ID
        id: String,
    },
    /// Delete every dead letter
    PurgeDeadLetters,
    /// Watch connectivity and sync on reconnect
    Watch {
        /// Seconds between reachability probes
        #[arg(long, default_value = "15")]
        probe_interval: u64,
        /// Milliseconds to wait after reconnecting before syncing
        #[arg(long, default_value = "1000")]
        reconnect_delay: u64,
    },
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

#[cfg(feature = "rest")]
fn remote_backend(cli: &Cli, id_field: &str) -> anyhow::Result<Arc<dyn RemoteBackend>> {
    use lifesync::sync::{RestBackend, RestConfig};

    let (Some(base_url), Some(api_key)) = (cli.remote_url.clone(), cli.api_key.clone()) else {
        bail!("--remote-url and --api-key (or LIFESYNC_REMOTE_URL / LIFESYNC_API_KEY) are required");
    };

    let backend = RestBackend::new(RestConfig {
        base_url,
        api_key,
        access_token: cli.access_token.clone(),
        id_field: id_field.to_string(),
        timeout_secs: 15,
    })?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "rest"))]
fn remote_backend(_cli: &Cli, _id_field: &str) -> anyhow::Result<Arc<dyn RemoteBackend>> {
    bail!("built without the `rest` feature; no remote backend available")
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{} synced, {} failed, {} dead-lettered, {} not dequeued",
        summary.synced, summary.failed, summary.dead_lettered, summary.dequeue_failed
    );
    for failure in &summary.failures {
        if failure.applied {
            println!(
                "  {} {} {} applied but still queued: {}",
                failure.mutation_id, failure.operation, failure.table, failure.error
            );
        } else {
            println!(
                "  {} {} {} (attempt {}): {}",
                failure.mutation_id,
                failure.operation,
                failure.table,
                failure.attempts,
                failure.error
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    // Expand ~ in path
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let storage_mode: StorageMode = cli.storage_mode.parse()?;

    let config = QueueConfig {
        db_path,
        storage_mode,
        max_attempts: (cli.max_attempts > 0).then_some(cli.max_attempts),
        ..Default::default()
    };

    let store = QueueStore::open(config.clone())
        .with_context(|| format!("opening queue at {}", config.db_path))?;

    match &cli.command {
        Commands::Enqueue {
            table,
            operation,
            data,
            user,
        } => {
            let table: Table = table.parse()?;
            let operation: Operation = operation.parse()?;
            let data: serde_json::Value =
                serde_json::from_str(data).context("payload is not valid JSON")?;

            let id = store
                .enqueue(NewMutation {
                    table,
                    operation,
                    data,
                    user_id: user.clone(),
                })
                .context("mutation could not be saved")?;
            println!("Queued {}", id);
        }

        Commands::List { table } => {
            let pending = match table {
                Some(t) => {
                    let table: Table = t.parse()?;
                    store.list_pending_for_table(table)?
                }
                None => store.list_pending()?,
            };
            for mutation in pending {
                println!(
                    "{} {} [{}] {} {}",
                    mutation.id,
                    mutation.timestamp,
                    mutation.table,
                    mutation.operation,
                    mutation.data
                );
            }
        }

        Commands::Size => {
            println!("{}", store.size()?);
        }

        Commands::Remove { id } => {
            if store.remove(id)? {
                println!("Removed {}", id);
            } else {
                println!("{} was not queued", id);
            }
        }

        Commands::Clear => {
            println!("Cleared {} mutations", store.clear()?);
        }

        Commands::Sync => {
            let backend = remote_backend(&cli, &config.id_field)?;
            let engine = SyncEngine::new(store, backend);
            let summary = engine.sync_pending_mutations().await?;
            print_summary(&summary);
        }

        Commands::DeadLetters => {
            for dead in store.list_dead_letters()? {
                println!(
                    "{} [{}] {} attempts={} error={}",
                    dead.mutation.id,
                    dead.mutation.table,
                    dead.mutation.operation,
                    dead.attempts,
                    dead.last_error.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Requeue { id } => {
            if !store.requeue_dead_letter(id)? {
                bail!("no dead letter with id {}", id);
            }
            println!("Requeued {}", id);
        }

        Commands::PurgeDeadLetters => {
            println!("Purged {} dead letters", store.purge_dead_letters()?);
        }

        Commands::Watch {
            probe_interval,
            reconnect_delay,
        } => {
            let backend = remote_backend(&cli, &config.id_field)?;
            let initially_online = backend.health_check().await.is_ok();
            let engine = Arc::new(SyncEngine::new(store, backend.clone()));

            let monitor = ConnectivityMonitor::start(
                engine,
                MonitorConfig {
                    reconnect_delay_ms: *reconnect_delay,
                    ..Default::default()
                },
                initially_online,
            );
            let mut events = monitor.subscribe();
            spawn_probe(
                monitor.clone(),
                backend,
                Duration::from_secs((*probe_interval).max(1)),
            );

            println!(
                "Watching ({}), {} pending. Ctrl-C to stop.",
                if initially_online { "online" } else { "offline" },
                monitor.state().pending_mutations
            );

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => println!("{} {}", event.timestamp.to_rfc3339(), event.message()),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Skipped {} events", n);
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        monitor.stop().await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
