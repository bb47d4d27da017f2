use anyhow::{bail, Context, Result};
use capsync_core::sync_contracts::QueueEntry;
use capsync_resolver::{ConflictResolver, ResolutionStrategy};
use capsync_storage::migrate::{pending_revisions, rollback_to, run_migrations, schema_version};
use capsync_storage::{open_connection, revisions, StoreConfig, SyncStore};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capsync-admin")]
#[command(about = "Operator tooling for a capsync database", long_about = None)]
struct Cli {
    /// Database file
    #[arg(long, env = "CAPSYNC_DB")]
    db: PathBuf,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schema version and queue totals
    Status,
    /// Apply pending schema revisions
    Migrate,
    /// Revert schema revisions down to a version
    Rollback {
        #[arg(long)]
        to: u32,
    },
    /// List queue entries oldest first
    Queue {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List unresolved conflicts
    Conflicts {
        #[arg(long)]
        entity_type: Option<String>,
    },
    /// List entries past their retry budget
    Stuck {
        #[arg(long)]
        entity_type: Option<String>,
    },
    /// Give a stuck entry a fresh retry budget
    Requeue { entry_id: i64 },
    /// Resolve one conflict
    Resolve {
        entry_id: i64,
        #[arg(long, value_enum)]
        strategy: Strategy,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    AcceptServer,
    ForceLocal,
    Converged,
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CAPSYNC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let config = StoreConfig::from_env();

    match cli.command {
        Commands::Status => status(&cli.db, &config)?,
        Commands::Migrate => {
            let conn = open_connection(&cli.db, &config)
                .with_context(|| format!("failed to open {}", cli.db.display()))?;
            let report = run_migrations(&conn, &revisions::all()).context("migration failed")?;
            println!(
                "schema {} -> {} ({} revisions applied)",
                report.from_version,
                report.to_version,
                report.applied_count()
            );
        }
        Commands::Rollback { to } => {
            let conn = open_connection(&cli.db, &config)
                .with_context(|| format!("failed to open {}", cli.db.display()))?;
            let report = rollback_to(&conn, &revisions::all(), to).context("rollback failed")?;
            info!(event = "rollback_finished", from = report.from_version, to = report.to_version);
            println!("schema {} -> {}", report.from_version, report.to_version);
        }
        Commands::Queue { limit } => {
            let store = open_store(&cli.db, config)?;
            print_entries(&store.list_entries(limit)?);
        }
        Commands::Conflicts { entity_type } => {
            let store = open_store(&cli.db, config)?;
            print_entries(&store.conflicts(entity_type.as_deref())?);
        }
        Commands::Stuck { entity_type } => {
            let store = open_store(&cli.db, config)?;
            print_entries(&store.stuck_entries(entity_type.as_deref())?);
        }
        Commands::Requeue { entry_id } => {
            let store = open_store(&cli.db, config)?;
            let entry = store
                .requeue_stuck(entry_id)
                .with_context(|| format!("failed to requeue entry {entry_id}"))?;
            println!("requeued {} {} ({})", entry.entity_type, entry.entity_id, entry.operation);
        }
        Commands::Resolve { entry_id, strategy } => {
            let store = open_store(&cli.db, config)?;
            let Some(entry) = store.entry(entry_id)? else {
                bail!("entry {entry_id} not found");
            };
            let resolver = ConflictResolver::default();
            let outcome = match strategy {
                Strategy::AcceptServer => {
                    resolver.resolve(&store, &entry, ResolutionStrategy::AcceptServer)
                }
                Strategy::ForceLocal => resolver.resolve(&store, &entry, ResolutionStrategy::ForceLocal),
                Strategy::Converged => resolver.resolve_converged(&store, &entry),
            }
            .with_context(|| format!("failed to resolve entry {entry_id}"))?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}

/// Reports without migrating, so an operator can inspect a database before upgrading it.
fn status(db: &Path, config: &StoreConfig) -> Result<()> {
    let conn = open_connection(db, config)
        .with_context(|| format!("failed to open {}", db.display()))?;
    let version = schema_version(&conn)?;
    let pending = pending_revisions(&conn, &revisions::all()).context("schema check failed")?;
    println!("schema version: {version} (current {})", revisions::CURRENT_SCHEMA_VERSION);
    if !pending.is_empty() {
        println!("pending revisions: {pending:?}");
        return Ok(());
    }
    drop(conn);

    let store = open_store(db, config.clone())?;
    println!("pending entries: {}", store.count_pending(None)?);
    println!("conflicts: {}", store.count_conflicts(None)?);
    println!("stuck: {}", store.stuck_entries(None)?.len());
    Ok(())
}

fn open_store(db: &Path, config: StoreConfig) -> Result<SyncStore> {
    SyncStore::open_with_config(db, config).with_context(|| format!("failed to open {}", db.display()))
}

fn print_entries(entries: &[QueueEntry]) {
    if entries.is_empty() {
        println!("(none)");
        return;
    }
    for entry in entries {
        let lease = match &entry.lease {
            Some(lease) => format!(" leased until {}", lease.expires_at.to_rfc3339()),
            None => String::new(),
        };
        let error = entry
            .last_error
            .as_deref()
            .map(|err| format!(" last_error={err:?}"))
            .unwrap_or_default();
        println!(
            "#{} {} {} {} created={} retries={}/{} v{}{}{}",
            entry.id,
            entry.entity_type,
            entry.entity_id,
            entry.operation,
            entry.created_at.to_rfc3339(),
            entry.retry_count,
            entry.max_retries,
            entry.payload_version,
            lease,
            error,
        );
    }
}
