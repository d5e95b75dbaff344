//! Fieldsync CLI - offline-first client for field data collection.
//!
//! Wires the local store, reconciliation engine and backup manager
//! together: one engine instance per invocation, explicit teardown of
//! background tasks on exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fieldsync_backup::{spawn_backup_task, BackupConfig, BackupManager};
use fieldsync_codec::CompressionLevel;
use fieldsync_common::{Collection, OperationKind, RecordId};
use fieldsync_store::SqliteStore;
use fieldsync_sync::{ConnectivityMonitor, HttpAuthority, SyncConfig, SyncEngine};

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Fieldsync - offline-first field data collection")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Remote authority endpoint (overrides config and
    /// FIELDSYNC_ENDPOINT).
    #[arg(long)]
    endpoint: Option<String>,

    /// Data directory holding the local store and config.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate against the remote authority.
    Login {
        /// Username to log in as.
        #[arg(short, long)]
        username: String,
    },

    /// Clear the session.
    Logout,

    /// Show session, queue and store state.
    Status,

    /// Add a record to a collection.
    Add {
        /// Collection name: children, screenings or referrals.
        collection: String,

        /// Record payload as a JSON object.
        payload: String,
    },

    /// List the records of a collection.
    List {
        /// Collection name: children, screenings or referrals.
        collection: String,
    },

    /// Replay the pending-operation queue.
    Sync,

    /// Pull full collection state from the remote authority.
    Refresh,

    /// Backup operations.
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Run the periodic sync and backup tasks until interrupted.
    Serve {
        /// Seconds between replay passes (overrides config).
        #[arg(long)]
        sync_interval: Option<u64>,

        /// Seconds between scheduled backups (overrides config).
        #[arg(long)]
        backup_interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a backup of the whole store.
    Create,

    /// List stored backups, newest first.
    List,

    /// Restore the store from a backup.
    Restore {
        /// Backup id (creation timestamp) to restore.
        id: i64,
    },

    /// Export a backup to a portable file.
    Export {
        /// Backup id to export.
        id: i64,

        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import a previously exported backup file.
    Import {
        /// Path of the exported backup.
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => config::default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let endpoint = cli
        .endpoint
        .clone()
        .or_else(|| std::env::var("FIELDSYNC_ENDPOINT").ok());
    let config = Config::load(&data_dir)?.with_endpoint(endpoint);

    let store = Arc::new(
        SqliteStore::open(data_dir.join("fieldsync.db")).context("Failed to open local store")?,
    );

    match cli.command {
        Commands::Login { username } => cmd_login(&store, &config, &username).await,
        Commands::Logout => cmd_logout(&store, &config).await,
        Commands::Status => cmd_status(&store).await,
        Commands::Add {
            collection,
            payload,
        } => cmd_add(&store, &config, &collection, &payload).await,
        Commands::List { collection } => cmd_list(&store, &collection).await,
        Commands::Sync => cmd_sync(&store, &config).await,
        Commands::Refresh => cmd_refresh(&store, &config).await,
        Commands::Backup { command } => cmd_backup(&store, &config, command).await,
        Commands::Serve {
            sync_interval,
            backup_interval,
        } => cmd_serve(&store, &config, sync_interval, backup_interval).await,
    }
}

/// Construct the engine against the configured remote endpoint.
fn build_engine(
    store: &Arc<SqliteStore>,
    config: &Config,
) -> Result<Arc<SyncEngine<HttpAuthority>>> {
    let endpoint = config
        .endpoint
        .clone()
        .context("No remote endpoint configured (use --endpoint or FIELDSYNC_ENDPOINT)")?;
    let remote = Arc::new(HttpAuthority::new(endpoint)?);
    // Optimistic start; a failed call flips the monitor to unreachable.
    let monitor = Arc::new(ConnectivityMonitor::new(true));
    Ok(Arc::new(SyncEngine::new(
        Arc::clone(store),
        remote,
        monitor,
    )))
}

fn build_backup_manager(store: &Arc<SqliteStore>, config: &Config) -> Result<BackupManager> {
    Ok(BackupManager::new(Arc::clone(store))
        .with_codec(config.codec)
        .with_level(CompressionLevel::new(config.compression_level)?)
        .with_retention(config.backup_retention))
}

fn parse_collection(name: &str) -> Result<Collection> {
    name.parse()
        .with_context(|| format!("Unknown collection '{name}' (use: children, screenings, referrals)"))
}

async fn cmd_login(store: &Arc<SqliteStore>, config: &Config, username: &str) -> Result<()> {
    let engine = build_engine(store, config)?;
    let password =
        rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let session = engine
        .login(username, &password)
        .await
        .context("Login failed")?;
    println!("Logged in as {} (id {})", session.user.username, session.user.id);
    Ok(())
}

async fn cmd_logout(store: &Arc<SqliteStore>, config: &Config) -> Result<()> {
    let engine = build_engine(store, config)?;
    engine.logout().await.context("Logout failed")?;
    println!("Logged out.");
    Ok(())
}

async fn cmd_status(store: &Arc<SqliteStore>) -> Result<()> {
    match store.session().await? {
        Some(session) => {
            println!("Session: {} (id {})", session.user.username, session.user.id);
            match session.last_full_sync {
                Some(at) => println!("  Last full sync: {at}"),
                None => println!("  Last full sync: never"),
            }
        }
        None => println!("Session: none"),
    }

    let queued = store.all_queued().await?;
    println!("Pending operations: {}", queued.len());
    for op in &queued {
        println!(
            "  #{} {} {} {} (by {})",
            op.seq,
            op.kind.as_str(),
            op.collection,
            op.record_id,
            op.user
        );
    }
    for collection in Collection::ALL {
        let records = store.get_all(collection).await?;
        let unsynced = records
            .iter()
            .filter(|r| r.sync_status != fieldsync_common::SyncStatus::Synced)
            .count();
        println!("  {collection}: {} records ({unsynced} unsynced)", records.len());
    }
    Ok(())
}

async fn cmd_add(
    store: &Arc<SqliteStore>,
    config: &Config,
    collection: &str,
    payload: &str,
) -> Result<()> {
    let collection = parse_collection(collection)?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }

    let engine = build_engine(store, config)?;
    let result = engine
        .mutate(collection, OperationKind::Create, payload, None)
        .await
        .context("Failed to add record")?;

    let record = result.record.context("No record returned")?;
    println!("Added to {collection}: {} [{}]", record.id, result.status.as_str());
    Ok(())
}

async fn cmd_list(store: &Arc<SqliteStore>, collection: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    let records = store.get_all(collection).await?;

    if records.is_empty() {
        println!("No records in {collection}.");
        return Ok(());
    }
    println!("{collection} ({} records):", records.len());
    for record in records {
        let marker = match record.id {
            RecordId::Server(_) => "",
            RecordId::Local(_) => " (local)",
        };
        println!(
            "  {}{marker} [{}] {}",
            record.id,
            record.sync_status.as_str(),
            serde_json::to_string(&record.payload)?
        );
    }
    Ok(())
}

async fn cmd_sync(store: &Arc<SqliteStore>, config: &Config) -> Result<()> {
    let engine = build_engine(store, config)?;
    let report = engine.sync_pending().await.context("Sync failed")?;
    if report.already_running {
        println!("A replay pass is already running.");
    } else {
        println!(
            "Sync finished: {} confirmed, {} failed, {} still queued",
            report.confirmed,
            report.failed,
            store.queue_len().await?
        );
    }
    Ok(())
}

async fn cmd_refresh(store: &Arc<SqliteStore>, config: &Config) -> Result<()> {
    let engine = build_engine(store, config)?;
    let refreshed = engine.refresh_all().await.context("Refresh failed")?;
    println!("Refreshed {refreshed} records.");
    Ok(())
}

async fn cmd_backup(
    store: &Arc<SqliteStore>,
    config: &Config,
    command: BackupCommands,
) -> Result<()> {
    let manager = build_backup_manager(store, config)?;

    match command {
        BackupCommands::Create => {
            let metadata = manager.create_backup().await.context("Backup failed")?;
            println!(
                "Backup {} created ({} bytes compressed, checksum {:#010x})",
                metadata.id, metadata.compressed_size, metadata.checksum
            );
        }
        BackupCommands::List => {
            let backups = manager.list_backups().await?;
            if backups.is_empty() {
                println!("No backups.");
            } else {
                println!("Backups (newest first):");
                for metadata in backups {
                    println!(
                        "  {}  {}  {} bytes",
                        metadata.id, metadata.created_at, metadata.compressed_size
                    );
                }
            }
        }
        BackupCommands::Restore { id } => {
            let metadata = manager.restore_backup(id).await.context("Restore failed")?;
            println!("Restored backup {} from {}", metadata.id, metadata.created_at);
        }
        BackupCommands::Export { id, output } => {
            let exported = manager.export_backup(id).await.context("Export failed")?;
            tokio::fs::write(&output, &exported)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Exported backup {id} to {} ({} bytes)", output.display(), exported.len());
        }
        BackupCommands::Import { input } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let metadata = manager.import_backup(&bytes).await.context("Import failed")?;
            println!("Imported backup {} from {}", metadata.id, metadata.created_at);
        }
    }
    Ok(())
}

async fn cmd_serve(
    store: &Arc<SqliteStore>,
    config: &Config,
    sync_interval: Option<u64>,
    backup_interval: Option<u64>,
) -> Result<()> {
    let engine = build_engine(store, config)?;
    let manager = Arc::new(build_backup_manager(store, config)?);

    let sync_interval = Duration::from_secs(sync_interval.unwrap_or(config.sync_interval_secs));
    let backup_interval =
        Duration::from_secs(backup_interval.unwrap_or(config.backup_interval_secs));

    let sync_handle = engine.start(SyncConfig::default().with_sync_interval(sync_interval));
    let backup_handle = spawn_backup_task(
        manager,
        BackupConfig::default().with_backup_interval(backup_interval),
    );
    info!(?sync_interval, ?backup_interval, "background tasks running");
    println!("Running; press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("Shutting down...");

    sync_handle.shutdown().await;
    backup_handle.shutdown().await;
    info!("background tasks stopped");
    Ok(())
}
