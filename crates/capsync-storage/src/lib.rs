pub mod documents;
pub mod migrate;
pub mod queue;
pub mod revisions;
pub mod schema;

use capsync_core::sync_contracts::{ContractError, DEFAULT_LEASE_TTL_MS, DEFAULT_MAX_RETRIES};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use documents::{DocumentTable, LocalMutation, LocalRecord};
pub use migrate::{MigrationError, MigrationReport};
pub use queue::Enqueued;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("queue entry {0} not found")]
    EntryNotFound(i64),
    #[error("lease on queue entry {0} is no longer held by the caller")]
    LeaseLost(i64),
    #[error("{entity_type} {entity_id} not found")]
    RecordNotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("schema object missing: {0}")]
    SchemaObjectMissing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub lease_ttl_ms: i64,
    pub default_max_retries: u32,
    pub document_tables: Vec<DocumentTable>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            document_tables: vec![DocumentTable::captures(), DocumentTable::transcripts()],
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `CAPSYNC_LEASE_TTL_MS`, `CAPSYNC_MAX_RETRIES` and
    /// `CAPSYNC_BUSY_TIMEOUT_MS`. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = parse_setting(&lookup, "CAPSYNC_LEASE_TTL_MS") {
            config.lease_ttl_ms = value;
        }
        if let Some(value) = parse_setting(&lookup, "CAPSYNC_MAX_RETRIES") {
            config.default_max_retries = value;
        }
        if let Some(value) = parse_setting(&lookup, "CAPSYNC_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = value;
        }
        config
    }

    pub fn document_table(&self, entity_type: &str) -> Result<&DocumentTable, StorageError> {
        self.document_tables
            .iter()
            .find(|table| table.entity_type == entity_type)
            .ok_or_else(|| StorageError::UnknownEntityType(entity_type.to_string()))
    }
}

fn parse_setting<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(event = "config_value_ignored", key, value = %raw);
            None
        }
    }
}

/// Opens and configures a connection without migrating it. Business code goes
/// through [`SyncStore::open`]; this is for tooling that inspects or migrates
/// the schema itself.
pub fn open_connection(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    configure_connection(&conn, config)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!(event = "connection_opened", journal_mode = %mode);
    Ok(conn)
}

fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<(), StorageError> {
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(())
}

/// Handle to one migrated database connection. Construction runs every pending
/// revision first, so no caller can read a table before the schema is current.
pub struct SyncStore {
    conn: Connection,
    config: StoreConfig,
    migration: MigrationReport,
}

impl SyncStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StorageError> {
        let conn = open_connection(path, &config)?;
        Self::from_connection(conn, config)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    pub fn open_in_memory_with_config(config: StoreConfig) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn, &config)?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self, StorageError> {
        let migration = migrate::run_migrations(&conn, &revisions::all())?;
        Ok(Self {
            conn,
            config,
            migration,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// What the migration barrier did when this handle was opened.
    pub fn last_migration(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(migrate::schema_version(&self.conn)?)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        schema::table_exists(&self.conn, table)
    }

    /// Runs `body` inside one `BEGIN IMMEDIATE` transaction; commits on `Ok`,
    /// rolls back on `Err`.
    pub fn with_transaction<T, E>(
        &self,
        body: impl FnOnce(&SyncTx<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let scoped = SyncTx {
            tx,
            config: &self.config,
        };
        let value = body(&scoped)?;
        scoped.tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }
}

/// A write transaction on a [`SyncStore`]. Queue and document operations are
/// methods here so that a business write and its enqueue share one commit.
pub struct SyncTx<'a> {
    tx: Transaction<'a>,
    config: &'a StoreConfig,
}

impl SyncTx<'_> {
    pub fn config(&self) -> &StoreConfig {
        self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }
}
