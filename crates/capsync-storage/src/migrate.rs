use crate::schema::{apply_steps, Revision};
use crate::StorageError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

const HISTORY_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_revisions (
  version INTEGER PRIMARY KEY,
  description TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  applied_at INTEGER NOT NULL
)";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid revision set: {0}")]
    InvalidRevisionSet(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("revision {version} ({description}) failed: {source}")]
    RevisionFailed {
        version: u32,
        description: String,
        #[source]
        source: Box<StorageError>,
    },
    #[error("revision {version} has no revert")]
    MissingRevert { version: u32 },
    #[error("revision {version} was edited after release (stored {stored}, shipped {shipped})")]
    RevisionEdited {
        version: u32,
        stored: String,
        shipped: String,
    },
    #[error("revision {version} left a dangling foreign key in {table} (rowid {rowid:?})")]
    ForeignKeyViolation {
        table: String,
        rowid: Option<i64>,
        version: u32,
    },
    #[error("cannot roll back to version {target} from version {current}")]
    InvalidTarget { target: u32, current: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    /// Versions touched, in the order they ran (descending for a rollback).
    pub applied: Vec<u32>,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

pub fn schema_version(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
}

fn latest_version(revisions: &[Revision]) -> u32 {
    revisions.last().map(|revision| revision.version).unwrap_or(0)
}

pub fn validate_revisions(revisions: &[Revision]) -> Result<(), MigrationError> {
    for (index, revision) in revisions.iter().enumerate() {
        let expected = index as u32 + 1;
        if revision.version != expected {
            return Err(MigrationError::InvalidRevisionSet(format!(
                "expected version {expected} at position {index}, found {}",
                revision.version
            )));
        }
    }
    Ok(())
}

/// Stored version, checked against the newest revision this binary knows.
fn checked_version(conn: &Connection, revisions: &[Revision]) -> Result<u32, MigrationError> {
    let found = schema_version(conn)?;
    let supported = i64::from(latest_version(revisions));
    if found > supported || found < 0 {
        return Err(MigrationError::UnsupportedSchemaVersion { found, supported });
    }
    Ok(found as u32)
}

pub fn pending_revisions(
    conn: &Connection,
    revisions: &[Revision],
) -> Result<Vec<u32>, MigrationError> {
    validate_revisions(revisions)?;
    let current = checked_version(conn, revisions)?;
    Ok(revisions
        .iter()
        .filter(|revision| revision.version > current)
        .map(|revision| revision.version)
        .collect())
}

/// Brings the database up to the newest revision. Each revision commits with its
/// version bump, so an interrupted run resumes at the first unapplied revision.
pub fn run_migrations(
    conn: &Connection,
    revisions: &[Revision],
) -> Result<MigrationReport, MigrationError> {
    validate_revisions(revisions)?;
    conn.execute_batch(HISTORY_TABLE_SQL)?;
    let from_version = checked_version(conn, revisions)?;
    verify_history(conn, revisions, from_version)?;

    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        applied: Vec::new(),
    };
    for revision in revisions.iter().filter(|revision| revision.version > from_version) {
        if apply_revision(conn, revision)? {
            report.applied.push(revision.version);
        }
        report.to_version = revision.version;
    }

    if report.applied.is_empty() {
        info!(event = "schema_current", version = report.to_version);
    }
    Ok(report)
}

/// Walks the schema down to `target`, one revert per version. Every revision in
/// range must carry a revert; this is checked before anything changes.
pub fn rollback_to(
    conn: &Connection,
    revisions: &[Revision],
    target: u32,
) -> Result<MigrationReport, MigrationError> {
    validate_revisions(revisions)?;
    conn.execute_batch(HISTORY_TABLE_SQL)?;
    let current = checked_version(conn, revisions)?;
    if target > current {
        return Err(MigrationError::InvalidTarget { target, current });
    }

    let in_range = revisions
        .iter()
        .rev()
        .filter(|revision| revision.version > target && revision.version <= current)
        .collect::<Vec<_>>();
    if let Some(revision) = in_range.iter().find(|revision| !revision.is_reversible()) {
        return Err(MigrationError::MissingRevert {
            version: revision.version,
        });
    }

    let mut report = MigrationReport {
        from_version: current,
        to_version: current,
        applied: Vec::new(),
    };
    for revision in in_range {
        revert_revision(conn, revision)?;
        report.applied.push(revision.version);
        report.to_version = revision.version - 1;
    }
    Ok(report)
}

fn verify_history(
    conn: &Connection,
    revisions: &[Revision],
    current: u32,
) -> Result<(), MigrationError> {
    for revision in revisions.iter().filter(|revision| revision.version <= current) {
        let stored: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM schema_revisions WHERE version = ?1",
                params![revision.version],
                |row| row.get(0),
            )
            .optional()?;
        // Databases migrated before history was kept have no row to compare.
        let Some(stored) = stored else { continue };
        let shipped = revision.fingerprint();
        if stored != shipped {
            return Err(MigrationError::RevisionEdited {
                version: revision.version,
                stored,
                shipped,
            });
        }
    }
    Ok(())
}

fn apply_revision(conn: &Connection, revision: &Revision) -> Result<bool, MigrationError> {
    let started = Instant::now();
    let applied = with_foreign_keys_off(conn, |conn| {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        // Another connection may have finished this revision while we waited for the lock.
        if schema_version(&tx)? >= i64::from(revision.version) {
            return Ok(false);
        }

        apply_steps(&tx, &revision.steps).map_err(|source| MigrationError::RevisionFailed {
            version: revision.version,
            description: revision.description.to_string(),
            source: Box::new(source),
        })?;
        check_foreign_keys(&tx, revision.version)?;
        set_schema_version(&tx, revision.version)?;
        tx.execute(
            "
            INSERT OR REPLACE INTO schema_revisions (version, description, fingerprint, applied_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                revision.version,
                revision.description,
                revision.fingerprint(),
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        Ok(true)
    })?;

    if applied {
        info!(
            event = "revision_applied",
            version = revision.version,
            description = revision.description,
            steps = revision.steps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
    } else {
        warn!(event = "revision_skipped", version = revision.version, reason = "applied concurrently");
    }
    Ok(applied)
}

fn revert_revision(conn: &Connection, revision: &Revision) -> Result<(), MigrationError> {
    let Some(steps) = revision.revert.as_ref() else {
        return Err(MigrationError::MissingRevert {
            version: revision.version,
        });
    };

    with_foreign_keys_off(conn, |conn| {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        if schema_version(&tx)? != i64::from(revision.version) {
            let current = schema_version(&tx)?.max(0) as u32;
            return Err(MigrationError::InvalidTarget {
                target: revision.version - 1,
                current,
            });
        }

        apply_steps(&tx, steps).map_err(|source| MigrationError::RevisionFailed {
            version: revision.version,
            description: format!("revert of {}", revision.description),
            source: Box::new(source),
        })?;
        check_foreign_keys(&tx, revision.version)?;
        set_schema_version(&tx, revision.version - 1)?;
        tx.execute(
            "DELETE FROM schema_revisions WHERE version = ?1",
            params![revision.version],
        )?;
        tx.commit()?;
        Ok(())
    })?;

    info!(
        event = "revision_reverted",
        version = revision.version,
        description = revision.description,
    );
    Ok(())
}

/// SQLite ignores `PRAGMA foreign_keys` inside a transaction, so it is toggled
/// around the revision and restored whatever the outcome.
fn with_foreign_keys_off<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let enabled: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if enabled != 0 {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    }
    let result = body(conn);
    if enabled != 0 {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    result
}

fn check_foreign_keys(conn: &Connection, version: u32) -> Result<(), MigrationError> {
    let violation = conn
        .query_row("PRAGMA foreign_key_check", [], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
        })
        .optional()?;
    match violation {
        Some((table, rowid)) => Err(MigrationError::ForeignKeyViolation {
            table,
            rowid,
            version,
        }),
        None => Ok(()),
    }
}
