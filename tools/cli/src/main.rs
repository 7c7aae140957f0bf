//! SyncedDB CLI - Command line interface for an offline-first record store.
//!
//! Records live in a local SQLite file and are synchronized with a remote
//! server over HTTP, or against fabricated responses in dry-run mode.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use synceddb_common::RecordKey;
use synceddb_remote::HttpTransport;
use synceddb_storage::{SqliteStore, StoreConfig};
use synceddb_sync::{
    Connectivity, Record, SyncConfig, SyncOutcome, SyncTimestamp, SyncedStore,
};

#[derive(Parser)]
#[command(name = "synceddb")]
#[command(about = "SyncedDB - Offline-first record store with server sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Local database file.
    #[arg(long, default_value = "synceddb.db")]
    db: PathBuf,

    /// Table holding the records.
    #[arg(long, default_value = "records")]
    table: String,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the remote.
    #[arg(long)]
    url: Option<String>,

    /// Primary-key field of the records.
    #[arg(long)]
    key_name: Option<String>,

    /// Bearer token sent with every remote request.
    #[arg(long, env = "SYNCEDDB_TOKEN")]
    token: Option<String>,

    /// Work offline: only the local store is touched.
    #[arg(long)]
    offline: bool,

    /// Fabricate remote responses instead of calling the server.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record from a JSON object.
    Create {
        /// Record data, e.g. '{"name": "milk"}'.
        data: String,
    },

    /// Read a record by key.
    Read {
        key: String,

        /// Refresh from the remote even if a local copy exists.
        #[arg(short, long)]
        force: bool,
    },

    /// Update a record from a JSON object carrying its key.
    Update {
        /// Record data, e.g. '{"id": "1", "name": "oat milk"}'.
        data: String,
    },

    /// Delete a record by key.
    Delete { key: String },

    /// List all records.
    List {
        /// Refresh from the remote even if records exist locally.
        #[arg(short, long)]
        force: bool,
    },

    /// Send every unsynced record to the remote.
    Sync {
        /// Ask for changes since this epoch-millisecond timestamp.
        #[arg(long)]
        since: Option<i64>,
    },

    /// List records with unacknowledged changes.
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging on stderr, stdout carries the records.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli)?;

    match cli.command {
        Commands::Create { data } => cmd_create(&engine, &data).await,
        Commands::Read { key, force } => cmd_read(&engine, &key, force).await,
        Commands::Update { data } => cmd_update(&engine, &data).await,
        Commands::Delete { key } => cmd_delete(&engine, &key).await,
        Commands::List { force } => cmd_list(&engine, force).await,
        Commands::Sync { since } => cmd_sync(&engine, since).await,
        Commands::Pending => cmd_pending(&engine).await,
    }
}

/// Resolve the configuration from the file and flag overrides.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Some(url) = &cli.url {
        config = config.with_url(url);
    }
    if let Some(key_name) = &cli.key_name {
        config = config.with_key_name(key_name);
    }
    if cli.dry_run {
        config = config.with_dry_run(true);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Open the local store and wire up the engine.
fn open_engine(cli: &Cli) -> Result<SyncedStore<Value>> {
    let config = load_config(cli)?;

    let store = SqliteStore::open(&cli.db, &cli.table, StoreConfig::new(&config.key_name))
        .with_context(|| format!("Failed to open local store {}", cli.db.display()))?;

    let connectivity = if cli.offline {
        Connectivity::offline()
    } else {
        Connectivity::online()
    };

    // Offline runs never reach the remote, so no URL is needed.
    let config = if cli.offline && config.url.is_none() {
        config.with_dry_run(true)
    } else {
        config
    };

    let mut builder = SyncedStore::builder(Arc::new(store)).connectivity(connectivity);

    if !config.dry_run {
        let url = config
            .url
            .as_deref()
            .context("No remote URL: pass --url, set \"url\" in the config, or use --dry-run")?;
        let mut transport = HttpTransport::new(url).context("Failed to create HTTP transport")?;
        if let Some(token) = &cli.token {
            transport = transport.with_bearer_token(token);
        }
        builder = builder.transport(Arc::new(transport));
    }

    builder
        .config(config)
        .build()
        .context("Failed to start sync engine")
}

/// Parse a JSON object argument.
fn parse_object(data: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(data).context("Record data is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Record data must be a JSON object");
    }
    Ok(value)
}

fn parse_key(key: &str) -> Result<RecordKey> {
    RecordKey::new(key).context("Invalid key")
}

fn print_record(record: &Record<Value>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn print_records(records: &[Record<Value>]) -> Result<()> {
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    for record in records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

/// Create a record.
async fn cmd_create(engine: &SyncedStore<Value>, data: &str) -> Result<()> {
    let data = parse_object(data)?;
    let record = engine
        .create(data)
        .await
        .context("Failed to create record")?;

    match record {
        Some(record) => {
            if !record.is_synced() {
                info!("Record stored locally, it will be sent on the next sync");
            }
            print_record(&record)
        }
        None => anyhow::bail!("The remote rejected the record as not found"),
    }
}

/// Read a record.
async fn cmd_read(engine: &SyncedStore<Value>, key: &str, force: bool) -> Result<()> {
    let key = parse_key(key)?;
    match engine
        .read(&key, force)
        .await
        .context("Failed to read record")?
    {
        Some(record) => print_record(&record),
        None => anyhow::bail!("Record not found: {}", key),
    }
}

/// Update a record.
async fn cmd_update(engine: &SyncedStore<Value>, data: &str) -> Result<()> {
    let data = parse_object(data)?;
    match engine
        .update(data)
        .await
        .context("Failed to update record")?
    {
        Some(record) => print_record(&record),
        None => {
            println!("Record no longer exists on the remote, removed locally.");
            Ok(())
        }
    }
}

/// Delete a record.
async fn cmd_delete(engine: &SyncedStore<Value>, key: &str) -> Result<()> {
    let key = parse_key(key)?;
    engine
        .delete(&key)
        .await
        .context("Failed to delete record")?;

    match engine.store().get(&key).await? {
        Some(_) => println!("Marked {} as deleted, pending sync.", key),
        None => println!("Deleted {}.", key),
    }
    Ok(())
}

/// List all records.
async fn cmd_list(engine: &SyncedStore<Value>, force: bool) -> Result<()> {
    let records = engine
        .read_all(force)
        .await
        .context("Failed to list records")?;
    print_records(&records)
}

/// Run a batched sync.
async fn cmd_sync(engine: &SyncedStore<Value>, since: Option<i64>) -> Result<()> {
    let outcome = match since {
        Some(millis) => engine.sync_since(SyncTimestamp::from_millis(millis)).await,
        None => engine.sync().await,
    }
    .context("Sync failed")?;

    match outcome {
        SyncOutcome::Offline => println!("Offline, nothing sent."),
        SyncOutcome::NothingToSync => println!("Everything is in sync."),
        SyncOutcome::Failed(failure) => anyhow::bail!("Sync failed: {}", failure.reason),
        SyncOutcome::Synced(report) => {
            println!(
                "Synced: {} changed, {} deleted (server time {})",
                report.changed.len(),
                report.deleted.len(),
                report.timestamp
            );
        }
    }
    Ok(())
}

/// List unsynced records.
async fn cmd_pending(engine: &SyncedStore<Value>) -> Result<()> {
    let records = engine
        .pending()
        .await
        .context("Failed to list pending records")?;
    print_records(&records)
}
