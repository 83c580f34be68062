//! # wiredpart-sync
//!
//! Command-line front end for the folder sync engine.
//!
//! ## Commands
//! ```text
//! wiredpart-sync init --folder ~/Dropbox/WiredPart [--channel shop]
//! wiredpart-sync sync [--publish-only | --pull-only]
//! wiredpart-sync status [--json]
//! wiredpart-sync peers [--json]
//! wiredpart-sync watch                  # scheduled rounds until Ctrl-C
//! wiredpart-sync put parts P-1 '{"name":"Breaker","qty":4}'
//! wiredpart-sync rm parts P-1
//! ```
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - `RUST_LOG=wiredpart_sync=trace` - Trace the engine only
//! - Default: INFO, with DEBUG for the wiredpart crates
//!
//! Logs go to stderr; command output goes to stdout.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wiredpart_core::{Fields, SyncHealth};
use wiredpart_db::{Database, DbConfig};
use wiredpart_sync::{
    PeerSummary, RoundMode, RoundReport, SyncAgent, SyncConfig, SyncEngine, SyncEventEmitter,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "wiredpart-sync", version, about = "Sync WiredPart devices through a shared folder")]
struct Cli {
    /// Path to sync.toml (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the local database (defaults to the platform data directory).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enable sync against a shared folder and save the config.
    Init(InitArgs),
    /// Run one sync round now.
    Sync(SyncArgs),
    /// Show this device's sync health.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List every device that has published to the folder.
    Peers {
        #[arg(long)]
        json: bool,
    },
    /// Run scheduled rounds until interrupted.
    Watch,
    /// Create or edit a local record.
    Put {
        table: String,
        record_id: String,
        /// Record fields as a JSON object.
        fields: String,
    },
    /// Delete a local record (leaves a tombstone).
    Rm { table: String, record_id: String },
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Root of the shared folder.
    #[arg(long)]
    folder: PathBuf,

    /// Channel (subdirectory) shared by this group of devices.
    #[arg(long, default_value = "default")]
    channel: String,

    /// Minutes between scheduled rounds.
    #[arg(long)]
    interval: Option<u64>,

    /// Human-readable device name.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Only publish local changes.
    #[arg(long, conflicts_with = "pull_only")]
    publish_only: bool,

    /// Only merge peers' changes.
    #[arg(long)]
    pull_only: bool,
}

impl SyncArgs {
    fn mode(&self) -> RoundMode {
        if self.publish_only {
            RoundMode::PublishOnly
        } else if self.pull_only {
            RoundMode::PullOnly
        } else {
            RoundMode::Full
        }
    }
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wiredpart=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> CliResult<()> {
    if let Command::Init(args) = &cli.command {
        return init(cli.config.clone(), args);
    }

    let config = SyncConfig::load(cli.config.clone())?;
    let db = open_database(cli.db.clone()).await?;

    let result = match cli.command {
        Command::Init(_) => Ok(()),
        Command::Sync(args) => {
            let engine = SyncEngine::with_database(config, &db);
            let report = engine.run_round(args.mode()).await?;
            print_report(&report);
            Ok(())
        }
        Command::Status { json } => {
            let engine = SyncEngine::with_database(config, &db);
            let health = engine.health().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                print_health(&health, engine.is_configured().await);
            }
            Ok(())
        }
        Command::Peers { json } => {
            let engine = SyncEngine::with_database(config, &db);
            let peers = engine.peers().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else {
                print_peers(&peers);
            }
            Ok(())
        }
        Command::Watch => watch(config, &db).await,
        Command::Put {
            table,
            record_id,
            fields,
        } => {
            let fields: Fields = serde_json::from_str(&fields)?;
            let device = local_device_id(&config, &db).await?;
            let record = db
                .records()
                .upsert_local(&table, &record_id, fields, &device, Utc::now())
                .await?;
            println!("{} {} @ {}", record.table_name, record.record_id, record.version_time());
            Ok(())
        }
        Command::Rm { table, record_id } => {
            let device = local_device_id(&config, &db).await?;
            let record = db
                .records()
                .delete_local(&table, &record_id, &device, Utc::now())
                .await?;
            println!("{} {} deleted @ {}", record.table_name, record.record_id, record.version_time());
            Ok(())
        }
    };

    db.close().await;
    result
}

// =============================================================================
// Commands
// =============================================================================

fn init(config_path: Option<PathBuf>, args: &InitArgs) -> CliResult<()> {
    let mut config = SyncConfig::load_or_default(config_path.clone());
    config.sync.enabled = true;
    config.sync.folder_path = Some(args.folder.clone());
    config.sync.channel = args.channel.clone();
    if let Some(minutes) = args.interval {
        config.sync.interval_minutes = minutes;
    }
    if let Some(name) = &args.name {
        config.device.name = name.clone();
    }
    config.validate()?;

    if !args.folder.is_dir() {
        warn!(folder = %args.folder.display(), "Shared folder does not exist yet; rounds will report offline");
    }

    let path = config.save(config_path)?;
    println!("Sync enabled: {}", path.display());
    if let Some(channel) = config.channel_path() {
        println!("Channel:      {}", channel.display());
    }
    Ok(())
}

async fn watch(config: SyncConfig, db: &Database) -> CliResult<()> {
    let engine = Arc::new(SyncEngine::with_database(config, db));
    if !engine.is_configured().await {
        warn!("Sync is not configured or the folder is unreachable; waiting anyway");
    }

    let handle = SyncAgent::with_emitter(engine, Arc::new(ConsoleEmitter)).spawn();
    info!("Watching; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown().await?;
    Ok(())
}

/// Prints agent events as they happen.
struct ConsoleEmitter;

impl SyncEventEmitter for ConsoleEmitter {
    fn emit_round(&self, report: &RoundReport) {
        print_report(report);
    }

    fn emit_health(&self, health: &SyncHealth) {
        println!("status: {}", health.state.label());
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        if retryable {
            println!("round skipped: {message}");
        } else {
            error!(%message, "Sync round failed");
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn open_database(path: Option<PathBuf>) -> CliResult<Database> {
    let path = match path.or_else(SyncConfig::default_database_path) {
        Some(path) => path,
        None => return Err("could not determine a database path; pass --db".into()),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::new(DbConfig::new(path)).await?)
}

async fn local_device_id(config: &SyncConfig, db: &Database) -> CliResult<String> {
    match config.device_id_override() {
        Some(id) => Ok(id.to_string()),
        None => Ok(db.sync_state().device_id().await?),
    }
}

fn print_report(report: &RoundReport) {
    println!(
        "{} round on {} finished in {}ms",
        report.mode,
        report.device_id,
        (report.finished_at - report.started_at).num_milliseconds()
    );
    match &report.published {
        Some(published) => println!("  published  {} record(s) -> {}", published.records, published.path),
        None => println!("  published  nothing"),
    }
    println!(
        "  read       {} change set(s) from {} peer(s)",
        report.change_sets_read, report.peers_read
    );
    for (table, count) in &report.written_by_table {
        println!("  wrote      {count} {table}");
    }
    if report.conflicts > 0 {
        println!("  conflicts  {}", report.conflicts);
    }
    for skipped in &report.skipped {
        println!("  skipped    {}: {}", skipped.file, skipped.reason);
    }
    if report.gc_deleted > 0 {
        println!("  pruned     {} change set(s)", report.gc_deleted);
    }
}

fn print_health(health: &SyncHealth, reachable: bool) {
    println!("State:          {}", health.state.label());
    match health.last_sync_at {
        Some(at) => println!("Last sync:      {}", at.to_rfc3339()),
        None => println!("Last sync:      never"),
    }
    println!("Stale:          {}", if health.is_stale { "yes" } else { "no" });
    println!("Pending local:  {}", health.pending_local_changes);
    println!("Last conflicts: {}", health.last_round_conflicts);
    if let Some(err) = &health.last_error {
        println!("Last error:     {} ({})", err.message, err.occurred_at.to_rfc3339());
    }
    if !reachable {
        println!("Folder:         not configured or unreachable");
    }
}

fn print_peers(peers: &[PeerSummary]) {
    if peers.is_empty() {
        println!("No change sets in the folder yet");
        return;
    }
    println!("{:<38} {:>8} {:>6} {:>10}  LATEST", "DEVICE", "SEQ", "FILES", "BYTES");
    for peer in peers {
        let latest = peer
            .latest_created_at
            .or(peer.latest_modified)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<38} {:>8} {:>6} {:>10}  {}",
            peer.device_id, peer.latest_sequence, peer.file_count, peer.total_bytes, latest
        );
    }
}
