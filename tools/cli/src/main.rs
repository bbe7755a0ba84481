//! Outbox CLI - Command line interface for inspecting and driving an
//! operation queue database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use outbox_common::{Operation, OperationId, ResourceKey};
use outbox_storage::SqliteStore;
use outbox_sync::{
    HttpEndpoint, MemoryEndpoint, MergePatchProjector, OutboxClient, Projector, RemoteEndpoint,
    SyncConfig,
};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Outbox - Offline mutation queue")]
#[command(version)]
struct Cli {
    /// Queue database.
    #[arg(long, default_value = "outbox.db", global = true)]
    db: PathBuf,

    /// JSON sync configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Durably enqueue a mutation.
    Enqueue {
        /// Resource the mutation applies to.
        #[arg(short, long)]
        key: String,

        /// Mutation kind.
        #[arg(long)]
        kind: String,

        /// Mutation payload as JSON.
        #[arg(short, long)]
        payload: String,
    },

    /// List every stored operation.
    List,

    /// Print the optimistic view.
    View {
        /// Only this resource.
        #[arg(short, long)]
        key: Option<String>,
    },

    /// List failed operations.
    Failed,

    /// Delete a failed operation.
    Discard {
        /// Operation id.
        id: String,
    },

    /// Enqueue a fresh copy of a failed operation.
    Resubmit {
        /// Operation id.
        id: String,
    },

    /// Replay the queue until it drains.
    Sync {
        /// Base URL of the remote endpoint.
        #[arg(long, required_unless_present = "simulate", conflicts_with = "simulate")]
        endpoint: Option<Url>,

        /// Replay against an in-process remote instead.
        #[arg(long)]
        simulate: bool,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    let outbox = open_outbox(&cli.db, config)?;

    match cli.command {
        Commands::Enqueue { key, kind, payload } => cmd_enqueue(&outbox, &key, &kind, &payload),

        Commands::List => cmd_list(&outbox),

        Commands::View { key } => cmd_view(&outbox, key.as_deref()),

        Commands::Failed => cmd_failed(&outbox),

        Commands::Discard { id } => cmd_discard(&outbox, &id),

        Commands::Resubmit { id } => cmd_resubmit(&outbox, &id),

        Commands::Sync {
            endpoint,
            simulate: _,
            timeout,
        } => cmd_sync(&outbox, endpoint, Duration::from_secs(timeout)).await,
    }
}

/// Load the sync configuration, or the defaults without a file.
async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };

    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

fn projector() -> Arc<dyn Projector> {
    Arc::new(MergePatchProjector)
}

fn open_outbox(db: &Path, config: SyncConfig) -> Result<OutboxClient> {
    let store = SqliteStore::open(db)
        .with_context(|| format!("Failed to open queue database {}", db.display()))?;
    OutboxClient::open(Arc::new(store), projector(), config).context("Failed to load queue")
}

fn parse_id(id: &str) -> Result<OperationId> {
    id.parse().context("Invalid operation id")
}

fn print_operation(op: &Operation) {
    println!(
        "  {}  #{:<4} {:<10} {:<20} {} (attempt {})",
        op.id, op.seq, op.status, op.resource_key, op.kind, op.attempt
    );
    if let Some(err) = &op.last_error {
        println!("      last error: {}", err);
    }
}

/// Enqueue a mutation.
fn cmd_enqueue(outbox: &OutboxClient, key: &str, kind: &str, payload: &str) -> Result<()> {
    let key = ResourceKey::new(key).context("Invalid resource key")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let handle = outbox
        .enqueue_mutation(kind, payload, key)
        .context("Failed to enqueue")?;

    println!("{}", handle.id());
    Ok(())
}

/// List every stored operation.
fn cmd_list(outbox: &OutboxClient) -> Result<()> {
    let ops = outbox.operations();
    if ops.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("{} operations:", ops.len());
        for op in &ops {
            print_operation(op);
        }
    }
    Ok(())
}

/// Print the optimistic view.
fn cmd_view(outbox: &OutboxClient, key: Option<&str>) -> Result<()> {
    let json = match key {
        Some(key) => {
            let key = ResourceKey::new(key).context("Invalid resource key")?;
            serde_json::to_string_pretty(&outbox.get(&key))?
        }
        None => serde_json::to_string_pretty(&*outbox.view())?,
    };
    println!("{}", json);
    Ok(())
}

/// List failed operations.
fn cmd_failed(outbox: &OutboxClient) -> Result<()> {
    let failed = outbox.failed();
    if failed.is_empty() {
        println!("No failed operations.");
    } else {
        println!("{} failed operations:", failed.len());
        for op in &failed {
            print_operation(op);
        }
    }
    Ok(())
}

/// Delete a failed operation.
fn cmd_discard(outbox: &OutboxClient, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    outbox.discard(&id).context("Failed to discard")?;
    println!("Discarded {}", id);
    Ok(())
}

/// Re-enqueue a failed operation.
fn cmd_resubmit(outbox: &OutboxClient, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let handle = outbox.resubmit(&id).context("Failed to resubmit")?;
    println!("Resubmitted {} as {}", id, handle.id());
    Ok(())
}

/// Replay the queue until it drains or the timeout elapses.
async fn cmd_sync(outbox: &OutboxClient, endpoint: Option<Url>, limit: Duration) -> Result<()> {
    let before = outbox.operations().len();
    let failed_before = outbox.failed().len();

    let (remote, polling): (Arc<dyn RemoteEndpoint>, _) = match endpoint {
        Some(url) => {
            info!("Syncing against {}", url);
            let http = Arc::new(
                HttpEndpoint::with_timeout(url, Some(outbox.config().send_timeout))
                    .context("Failed to create HTTP endpoint")?,
            );
            let polling = outbox
                .reachability()
                .spawn_polling(http.clone(), outbox.config().offline_probe_interval);
            (http, Some(polling))
        }
        None => {
            info!("Syncing against a simulated remote");
            (Arc::new(MemoryEndpoint::new(projector())), None)
        }
    };

    let worker = outbox.start_sync(remote);
    let drained = tokio::time::timeout(limit, worker.wait_idle()).await.is_ok();
    if !drained {
        warn!("Queue did not drain within {:?}", limit);
    }
    worker.shutdown().await.context("Sync worker failed")?;
    if let Some(polling) = polling {
        polling.abort();
    }

    let remaining = outbox.operations();
    let failed = outbox.failed();
    let committed = before.saturating_sub(remaining.len());
    println!("Committed: {}", committed);
    println!("Failed:    {}", failed.len().saturating_sub(failed_before));
    println!("Pending:   {}", remaining.len() - failed.len());
    for op in &failed {
        print_operation(op);
    }

    Ok(())
}
