//! dpool Inspect - Offline pool repository tool
//!
//! Lists, shows, checks and reconciles the replicas of a pool directory
//! while the pool itself is not running. There is no namespace connection;
//! repairs that need one are reported as failures.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dpool_common::{FileAttributes, NamespaceError, ReplicaId, RepositoryConfig};
use dpool_repository::{EntryLookup, EntrySnapshot, MetadataStore, NamespaceHandle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Parser, Debug)]
#[command(name = "dpool-inspect")]
#[command(about = "dpool pool repository inspection tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dpool/pool.toml")]
    config: String,

    /// Pool base directory (overrides the configuration file)
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List replicas with storage info
    Index,
    /// Show the bookkeeping of one replica
    Show {
        /// Replica id
        id: ReplicaId,
    },
    /// Probe the control directory and report volume space
    Check,
    /// Load every replica, repairing what can be repaired offline
    Reconcile,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    repository: RepositoryConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Namespace stand-in for a tool running without namespace access
struct OfflineNamespace;

impl OfflineNamespace {
    fn unavailable() -> NamespaceError {
        NamespaceError::Unavailable("namespace not reachable from dpool-inspect".into())
    }
}

impl NamespaceHandle for OfflineNamespace {
    fn get_attributes(&self, _id: &ReplicaId) -> Result<FileAttributes, NamespaceError> {
        Err(Self::unavailable())
    }

    fn set_size(&self, _id: &ReplicaId, _size: u64) -> Result<(), NamespaceError> {
        Err(Self::unavailable())
    }

    fn add_cache_location(&self, _id: &ReplicaId) -> Result<(), NamespaceError> {
        Err(Self::unavailable())
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&config_str).with_context(|| format!("failed to parse {}", path.display()))
}

/// Apply CLI overrides to the file configuration
fn merge(config: Config, args: &Args) -> (RepositoryConfig, String) {
    let mut repository = config.repository;
    if let Some(base_dir) = &args.base_dir {
        repository.base_dir.clone_from(base_dir);
    }
    // A short-lived tool has no use for background expiration
    repository.sticky.enabled = false;

    let log_level = if args.log_level == DEFAULT_LOG_LEVEL {
        config.logging.level
    } else {
        args.log_level.clone()
    };
    (repository, log_level)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(Path::new(&args.config))?;
    let (repository, log_level) = merge(config, &args);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Opening pool at {}", repository.base_dir.display());
    let store = MetadataStore::open(repository, Arc::new(OfflineNamespace))
        .context("failed to open pool repository")?;

    match args.command {
        Commands::Index => {
            for id in store.index()? {
                println!("{id}");
            }
        }
        Commands::Show { id } => match store.get(&id)? {
            EntryLookup::Found(entry) => print_snapshot(&entry.snapshot()),
            EntryLookup::NotFound => bail!("replica {id} not found"),
            EntryLookup::Unloadable(reason) => bail!("replica {id} cannot be loaded: {reason}"),
        },
        Commands::Check => {
            let ok = store.is_ok();
            let total = store.total_space()?;
            let free = store.free_space()?;
            let indexed = store.index()?;
            let data = store.layout().list()?;
            let unindexed: Vec<_> = data.difference(&indexed).collect();

            println!("Pool:            {}", store.layout().base_dir().display());
            println!("Writable:        {}", if ok { "yes" } else { "NO" });
            println!("Total space:     {total} bytes");
            println!("Free space:      {free} bytes");
            println!("Indexed:         {}", indexed.len());
            println!("Data files:      {}", data.len());
            println!("Without index:   {}", unindexed.len());
            for id in unindexed {
                println!("  {id}");
            }
            if !ok {
                bail!("control directory is not writable");
            }
        }
        Commands::Reconcile => {
            let report = reconcile(&store)?;
            println!("Loaded:          {}", report.loaded);
            println!("Removed:         {}", report.removed);
            println!("Unloadable:      {}", report.unloadable.len());
            for (id, reason) in &report.unloadable {
                println!("  {id}: {reason}");
            }
            println!("Failed:          {}", report.failed.len());
            for (id, reason) in &report.failed {
                println!("  {id}: {reason}");
            }
            println!("Repairs:         {}", store.stats().repairs);
        }
    }

    store.shutdown();
    Ok(())
}

#[derive(Debug, Default)]
struct ReconcileReport {
    loaded: usize,
    removed: usize,
    unloadable: Vec<(ReplicaId, String)>,
    failed: Vec<(ReplicaId, String)>,
}

/// Load every indexed replica and tally the outcome
fn reconcile(store: &MetadataStore) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    for id in store.index()? {
        match store.get(&id) {
            Ok(EntryLookup::Found(_)) => report.loaded += 1,
            Ok(EntryLookup::NotFound) => report.removed += 1,
            Ok(EntryLookup::Unloadable(reason)) => report.unloadable.push((id, reason)),
            Err(e) => {
                warn!("Failed to reconcile {}: {}", id, e);
                report.failed.push((id, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn print_snapshot(snapshot: &EntrySnapshot) {
    println!("Replica:         {}", snapshot.id);
    println!("State:           {}", snapshot.state);
    println!("Size:            {} bytes", snapshot.size);
    println!("Created:         {} (unix ms)", snapshot.creation_time);
    println!("Last access:     {} (unix ms)", snapshot.last_access_time);
    println!("Link count:      {}", snapshot.link_count);
    println!("Error flag:      {}", snapshot.error);

    if let Some(attrs) = &snapshot.attributes {
        println!("Storage class:   {}", attrs.storage_class);
        println!("Retention:       {}", attrs.retention_policy);
        println!("Access latency:  {}", attrs.access_latency);
        println!(
            "Checksum:        {}",
            attrs.checksum.as_deref().unwrap_or("-")
        );
        println!("Locations:       {}", attrs.locations.len());
        for location in &attrs.locations {
            println!("  {location}");
        }
    }

    println!("Sticky:          {}", snapshot.sticky.len());
    for record in &snapshot.sticky {
        println!("  {} until {}", record.owner, record.expire);
    }
}
