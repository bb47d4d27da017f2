use crate::documents::purge_tombstone;
use crate::{StorageError, SyncStore, SyncTx};
use capsync_core::sync_contracts::{
    coalesce, AckOutcome, Coalesced, ConflictRecord, Lease, QueueEntry, SyncOperation, SyncState,
};
use capsync_core::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info, warn};

const ENTRY_COLUMNS: &str = "
    id, entity_type, entity_id, operation, payload, created_at, retry_count, last_error,
    max_retries, payload_version, dispatched_at, lease_token, lease_expires_at, leased_version
";

/// What `enqueue` did with the incoming mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Inserted(i64),
    /// Folded into the record's existing active entry.
    Coalesced(i64),
    /// A never-dispatched create met its delete; the entry with this id is gone.
    Collapsed(i64),
}

impl Enqueued {
    /// Id of the entry now queued for the record, if any.
    pub fn entry_id(&self) -> Option<i64> {
        match self {
            Enqueued::Inserted(id) | Enqueued::Coalesced(id) => Some(*id),
            Enqueued::Collapsed(_) => None,
        }
    }
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let operation = row
        .get::<_, String>(3)?
        .parse::<SyncOperation>()
        .map_err(|err| conversion_error(3, err))?;
    let payload: Value =
        serde_json::from_str(&row.get::<_, String>(4)?).map_err(|err| conversion_error(4, err))?;
    let lease_token: Option<String> = row.get(11)?;
    let lease_expires_at: Option<i64> = row.get(12)?;
    let leased_version: Option<i64> = row.get(13)?;
    let lease = match (lease_token, lease_expires_at, leased_version) {
        (Some(token), Some(expires_at), Some(leased_version)) => Some(Lease {
            token,
            expires_at: from_millis(expires_at),
            leased_version,
        }),
        _ => None,
    };

    Ok(QueueEntry {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        operation,
        payload,
        created_at: from_millis(row.get(5)?),
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        max_retries: row.get(8)?,
        payload_version: row.get(9)?,
        dispatched_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        lease,
    })
}

fn payload_json(payload: &Value) -> Result<String, StorageError> {
    serde_json::to_string(payload).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<QueueEntry>, StorageError> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params, map_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn load_entry(conn: &Connection, entry_id: i64) -> Result<Option<QueueEntry>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
            [entry_id],
            map_entry,
        )
        .optional()?)
}

fn load_active_entry(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<QueueEntry>, StorageError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2 AND operation != 'conflict'"
            ),
            params![entity_type, entity_id],
            map_entry,
        )
        .optional()?)
}

fn entries_for(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<QueueEntry>, StorageError> {
    query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at ASC, id ASC"
        ),
        params![entity_type, entity_id],
    )
}

/// SQLite reads a negative LIMIT as unbounded, so oversized limits saturate instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn list_entries(conn: &Connection, limit: usize) -> Result<Vec<QueueEntry>, StorageError> {
    query_entries(
        conn,
        &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue ORDER BY created_at ASC, id ASC LIMIT ?1"),
        params![sql_limit(limit)],
    )
}

fn conflicts(conn: &Connection, entity_type: Option<&str>) -> Result<Vec<QueueEntry>, StorageError> {
    query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE operation = 'conflict' AND (?1 IS NULL OR entity_type = ?1)
             ORDER BY created_at ASC, id ASC"
        ),
        params![entity_type],
    )
}

fn stuck_entries(
    conn: &Connection,
    entity_type: Option<&str>,
) -> Result<Vec<QueueEntry>, StorageError> {
    query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE operation != 'conflict' AND retry_count > max_retries
               AND (?1 IS NULL OR entity_type = ?1)
             ORDER BY created_at ASC, id ASC"
        ),
        params![entity_type],
    )
}

fn count_where(conn: &Connection, predicate: &str, entity_type: Option<&str>) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM sync_queue WHERE {predicate} AND (?1 IS NULL OR entity_type = ?1)"
        ),
        params![entity_type],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn is_pending(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2 LIMIT 1",
            params![entity_type, entity_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ensure_lease(entry: &QueueEntry, lease_token: &str) -> Result<(), StorageError> {
    if entry.holds_lease(lease_token) {
        return Ok(());
    }
    debug!(event = "lease_lost", entry_id = entry.id, leased = entry.lease.is_some());
    Err(StorageError::LeaseLost(entry.id))
}

/// Conflict outranks stuck, which outranks pending; no entry means synced.
fn sync_state(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<SyncState, StorageError> {
    let entries = entries_for(conn, entity_type, entity_id)?;
    let state = if entries.iter().any(QueueEntry::is_conflict) {
        SyncState::Conflict
    } else if entries.iter().any(QueueEntry::is_stuck) {
        SyncState::Stuck
    } else if entries.is_empty() {
        SyncState::Synced
    } else {
        SyncState::Pending
    };
    Ok(state)
}

impl SyncTx<'_> {
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: SyncOperation,
        payload: &Value,
    ) -> Result<Enqueued, StorageError> {
        self.enqueue_at(entity_type, entity_id, operation, payload, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: SyncOperation,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, StorageError> {
        if !operation.is_active() {
            return Err(StorageError::InvalidOperation(
                "conflicts are recorded with mark_conflict, not enqueued".to_string(),
            ));
        }
        let conn = self.connection();
        let payload = payload_json(payload)?;

        let Some(existing) = load_active_entry(conn, entity_type, entity_id)? else {
            conn.execute(
                "
                INSERT INTO sync_queue (
                  entity_type, entity_id, operation, payload, created_at, retry_count, max_retries,
                  payload_version
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 1)
                ",
                params![
                    entity_type,
                    entity_id,
                    operation.as_str(),
                    payload,
                    to_millis(now),
                    self.config().default_max_retries
                ],
            )?;
            let entry_id = conn.last_insert_rowid();
            debug!(event = "entry_enqueued", entry_id, entity_type, entity_id, operation = %operation);
            return Ok(Enqueued::Inserted(entry_id));
        };

        match coalesce(existing.operation, operation, existing.dispatched_at.is_some()) {
            Coalesced::Replace(result) => {
                conn.execute(
                    "
                    UPDATE sync_queue
                    SET operation = ?2,
                        payload = ?3,
                        payload_version = payload_version + 1,
                        retry_count = 0,
                        last_error = NULL
                    WHERE id = ?1
                    ",
                    params![existing.id, result.as_str(), payload],
                )?;
                debug!(
                    event = "entry_coalesced",
                    entry_id = existing.id,
                    entity_type,
                    entity_id,
                    from = %existing.operation,
                    incoming = %operation,
                    result = %result,
                );
                Ok(Enqueued::Coalesced(existing.id))
            }
            Coalesced::Drop => {
                conn.execute("DELETE FROM sync_queue WHERE id = ?1", [existing.id])?;
                debug!(event = "entry_collapsed", entry_id = existing.id, entity_type, entity_id);
                Ok(Enqueued::Collapsed(existing.id))
            }
        }
    }

    pub fn dequeue_batch(
        &self,
        limit: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.dequeue_batch_at(limit, entity_type, Utc::now())
    }

    /// Leases up to `limit` eligible entries, oldest first. Conflicts, stuck
    /// entries and entries under a live lease are skipped.
    pub fn dequeue_batch_at(
        &self,
        limit: usize,
        entity_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.connection();
        let now_ms = to_millis(now);
        let mut entries = query_entries(
            conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE operation != 'conflict'
                   AND retry_count <= max_retries
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                   AND (?2 IS NULL OR entity_type = ?2)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3"
            ),
            params![now_ms, entity_type, sql_limit(limit)],
        )?;

        for entry in &mut entries {
            let lease = Lease::grant(now, self.config().lease_ttl_ms, entry.payload_version);
            conn.execute(
                "
                UPDATE sync_queue
                SET lease_token = ?2,
                    lease_expires_at = ?3,
                    leased_version = ?4,
                    dispatched_at = COALESCE(dispatched_at, ?5)
                WHERE id = ?1
                ",
                params![
                    entry.id,
                    lease.token,
                    to_millis(lease.expires_at),
                    lease.leased_version,
                    now_ms
                ],
            )?;
            entry.dispatched_at = Some(entry.dispatched_at.unwrap_or(now));
            entry.lease = Some(lease);
        }

        if !entries.is_empty() {
            debug!(event = "batch_leased", count = entries.len(), entity_type = entity_type.unwrap_or("*"));
        }
        Ok(entries)
    }

    /// Confirms the server accepted the payload pushed under `lease_token`.
    /// Only the current lease holder can remove the entry.
    pub fn acknowledge(&self, entry_id: i64, lease_token: &str) -> Result<AckOutcome, StorageError> {
        let conn = self.connection();
        let Some(entry) = load_entry(conn, entry_id)? else {
            debug!(event = "ack_missing", entry_id);
            return Ok(AckOutcome::Missing);
        };
        if entry.is_conflict() {
            return Err(StorageError::InvalidOperation(format!(
                "entry {entry_id} is a conflict and cannot be acknowledged"
            )));
        }

        if !entry.holds_lease(lease_token) {
            // The stale push still reached the server, so a queued create is now an update.
            conn.execute(
                "
                UPDATE sync_queue
                SET operation = CASE WHEN operation = 'create' THEN 'update' ELSE operation END
                WHERE id = ?1
                ",
                [entry_id],
            )?;
            info!(
                event = "ack_stale_lease",
                entry_id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                leased = entry.lease.is_some(),
            );
            return Ok(AckOutcome::StaleLease);
        }

        let superseded = entry
            .lease
            .as_ref()
            .is_some_and(|lease| lease.leased_version != entry.payload_version);
        if superseded {
            conn.execute(
                "
                UPDATE sync_queue
                SET operation = CASE WHEN operation = 'create' THEN 'update' ELSE operation END,
                    lease_token = NULL,
                    lease_expires_at = NULL,
                    leased_version = NULL
                WHERE id = ?1
                ",
                [entry_id],
            )?;
            info!(
                event = "ack_superseded",
                entry_id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                payload_version = entry.payload_version,
            );
            return Ok(AckOutcome::Superseded);
        }

        conn.execute("DELETE FROM sync_queue WHERE id = ?1", [entry_id])?;
        if entry.operation == SyncOperation::Delete {
            if let Ok(table) = self.config().document_table(&entry.entity_type) {
                purge_tombstone(conn, table, &entry.entity_id)?;
            }
        }
        debug!(
            event = "entry_acknowledged",
            entry_id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            operation = %entry.operation,
        );
        Ok(AckOutcome::Removed)
    }

    /// Records a transient push failure under `lease_token`. Returns `None`
    /// when the entry is gone.
    pub fn record_failure(
        &self,
        entry_id: i64,
        lease_token: &str,
        error: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        let conn = self.connection();
        let Some(current) = load_entry(conn, entry_id)? else {
            return Ok(None);
        };
        if current.is_conflict() {
            return Err(StorageError::InvalidOperation(format!(
                "entry {entry_id} is a conflict; failures are not tracked on conflicts"
            )));
        }
        ensure_lease(&current, lease_token)?;
        conn.execute(
            "
            UPDATE sync_queue
            SET retry_count = retry_count + 1,
                last_error = ?2,
                lease_token = NULL,
                lease_expires_at = NULL,
                leased_version = NULL
            WHERE id = ?1
            ",
            params![entry_id, error],
        )?;

        let entry = load_entry(conn, entry_id)?.ok_or(StorageError::EntryNotFound(entry_id))?;
        if entry.is_stuck() {
            warn!(
                event = "entry_stuck",
                entry_id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                retry_count = entry.retry_count,
                max_retries = entry.max_retries,
                error,
            );
        } else {
            debug!(event = "entry_failed", entry_id, retry_count = entry.retry_count, error);
        }
        Ok(Some(entry))
    }

    pub fn mark_conflict(
        &self,
        entry_id: i64,
        lease_token: &str,
        server_payload: Value,
        reason: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        self.mark_conflict_at(entry_id, lease_token, server_payload, reason, Utc::now())
    }

    /// Turns a rejected entry into the record's conflict. An older unresolved
    /// conflict for the same record is replaced.
    pub fn mark_conflict_at(
        &self,
        entry_id: i64,
        lease_token: &str,
        server_payload: Value,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StorageError> {
        let conn = self.connection();
        let Some(entry) = load_entry(conn, entry_id)? else {
            return Ok(None);
        };
        if entry.is_conflict() {
            return Err(StorageError::InvalidOperation(format!(
                "entry {entry_id} is already a conflict"
            )));
        }
        ensure_lease(&entry, lease_token)?;

        let record = ConflictRecord::new(
            entry.payload.clone(),
            server_payload,
            reason,
            entry.operation,
            now,
        );
        let folded = conn.execute(
            "DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2 AND operation = 'conflict'",
            params![entry.entity_type, entry.entity_id],
        )?;
        conn.execute(
            "
            UPDATE sync_queue
            SET operation = 'conflict',
                payload = ?2,
                retry_count = 0,
                last_error = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                leased_version = NULL
            WHERE id = ?1
            ",
            params![entry_id, payload_json(&record.to_payload()?)?],
        )?;

        info!(
            event = "conflict_marked",
            entry_id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            rejected = %entry.operation,
            reason,
            replaced_conflicts = folded,
        );
        load_entry(conn, entry_id)
    }

    /// Drops a lease without touching anything else, for a push that never
    /// went out. Returns false when `lease_token` no longer holds the entry.
    pub fn release(&self, entry_id: i64, lease_token: &str) -> Result<bool, StorageError> {
        let changed = self.connection().execute(
            "
            UPDATE sync_queue
            SET lease_token = NULL, lease_expires_at = NULL, leased_version = NULL
            WHERE id = ?1 AND lease_token = ?2
            ",
            params![entry_id, lease_token],
        )?;
        Ok(changed > 0)
    }

    pub fn requeue_stuck(&self, entry_id: i64) -> Result<QueueEntry, StorageError> {
        let conn = self.connection();
        let entry = load_entry(conn, entry_id)?.ok_or(StorageError::EntryNotFound(entry_id))?;
        if !entry.is_stuck() {
            return Err(StorageError::InvalidOperation(format!(
                "entry {entry_id} is not stuck (retry_count {}, max_retries {})",
                entry.retry_count, entry.max_retries
            )));
        }
        conn.execute(
            "UPDATE sync_queue SET retry_count = 0, last_error = NULL WHERE id = ?1",
            [entry_id],
        )?;
        info!(
            event = "entry_requeued",
            entry_id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            retry_count = entry.retry_count,
        );
        load_entry(conn, entry_id)?.ok_or(StorageError::EntryNotFound(entry_id))
    }

    pub fn set_max_retries(&self, entry_id: i64, max_retries: u32) -> Result<bool, StorageError> {
        let changed = self.connection().execute(
            "UPDATE sync_queue SET max_retries = ?2 WHERE id = ?1",
            params![entry_id, max_retries],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_entry(&self, entry_id: i64) -> Result<bool, StorageError> {
        let changed = self
            .connection()
            .execute("DELETE FROM sync_queue WHERE id = ?1", [entry_id])?;
        Ok(changed > 0)
    }

    /// Removes the record's active entry, if it has one.
    pub fn remove_active_entry(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        let changed = self.connection().execute(
            "DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2 AND operation != 'conflict'",
            params![entity_type, entity_id],
        )?;
        Ok(changed > 0)
    }

    pub fn entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, StorageError> {
        load_entry(self.connection(), entry_id)
    }

    pub fn active_entry(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        load_active_entry(self.connection(), entity_type, entity_id)
    }

    pub fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<QueueEntry>, StorageError> {
        entries_for(self.connection(), entity_type, entity_id)
    }

    pub fn sync_state(&self, entity_type: &str, entity_id: &str) -> Result<SyncState, StorageError> {
        sync_state(self.connection(), entity_type, entity_id)
    }
}

impl SyncStore {
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: SyncOperation,
        payload: &Value,
    ) -> Result<Enqueued, StorageError> {
        self.with_transaction(|tx| tx.enqueue(entity_type, entity_id, operation, payload))
    }

    pub fn dequeue_batch(
        &self,
        limit: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.dequeue_batch_at(limit, entity_type, Utc::now())
    }

    pub fn dequeue_batch_at(
        &self,
        limit: usize,
        entity_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.with_transaction(|tx| tx.dequeue_batch_at(limit, entity_type, now))
    }

    pub fn acknowledge(&self, entry_id: i64, lease_token: &str) -> Result<AckOutcome, StorageError> {
        self.with_transaction(|tx| tx.acknowledge(entry_id, lease_token))
    }

    pub fn record_failure(
        &self,
        entry_id: i64,
        lease_token: &str,
        error: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        self.with_transaction(|tx| tx.record_failure(entry_id, lease_token, error))
    }

    pub fn mark_conflict(
        &self,
        entry_id: i64,
        lease_token: &str,
        server_payload: Value,
        reason: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        self.with_transaction(|tx| tx.mark_conflict(entry_id, lease_token, server_payload, reason))
    }

    pub fn release(&self, entry_id: i64, lease_token: &str) -> Result<bool, StorageError> {
        self.with_transaction(|tx| tx.release(entry_id, lease_token))
    }

    pub fn requeue_stuck(&self, entry_id: i64) -> Result<QueueEntry, StorageError> {
        self.with_transaction(|tx| tx.requeue_stuck(entry_id))
    }

    pub fn entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, StorageError> {
        load_entry(self.connection(), entry_id)
    }

    pub fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<QueueEntry>, StorageError> {
        entries_for(self.connection(), entity_type, entity_id)
    }

    pub fn list_entries(&self, limit: usize) -> Result<Vec<QueueEntry>, StorageError> {
        list_entries(self.connection(), limit)
    }

    /// True while the record has any queue entry, conflicts included.
    pub fn is_pending(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        is_pending(self.connection(), entity_type, entity_id)
    }

    /// Active (non-conflict) entries, optionally for one entity type.
    pub fn count_pending(&self, entity_type: Option<&str>) -> Result<u64, StorageError> {
        count_where(self.connection(), "operation != 'conflict'", entity_type)
    }

    pub fn count_conflicts(&self, entity_type: Option<&str>) -> Result<u64, StorageError> {
        count_where(self.connection(), "operation = 'conflict'", entity_type)
    }

    pub fn conflicts(&self, entity_type: Option<&str>) -> Result<Vec<QueueEntry>, StorageError> {
        conflicts(self.connection(), entity_type)
    }

    pub fn stuck_entries(&self, entity_type: Option<&str>) -> Result<Vec<QueueEntry>, StorageError> {
        stuck_entries(self.connection(), entity_type)
    }

    pub fn sync_state(&self, entity_type: &str, entity_id: &str) -> Result<SyncState, StorageError> {
        sync_state(self.connection(), entity_type, entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn store() -> SyncStore {
        SyncStore::open_in_memory().expect("open store")
    }

    fn fail_once(store: &SyncStore, id: i64, at: DateTime<Utc>) -> QueueEntry {
        let leased = store.dequeue_batch_at(10, None, at).expect("dequeue");
        let entry = leased.iter().find(|entry| entry.id == id).expect("leased entry");
        store
            .record_failure(id, entry.lease_token().expect("leased"), "timeout")
            .expect("record failure")
            .expect("entry")
    }

    fn enqueue_at(store: &SyncStore, id: &str, op: SyncOperation, payload: Value, minute: u32) -> Enqueued {
        store
            .with_transaction(|tx| tx.enqueue_at("note", id, op, &payload, ts(minute)))
            .expect("enqueue")
    }

    #[test]
    fn repeated_updates_keep_one_entry_with_latest_payload() {
        let store = store();
        let first = enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 1}), 0);
        let second = enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 2}), 1);
        let third = enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 3}), 2);

        assert_eq!(first.entry_id(), second.entry_id());
        assert_eq!(second, third);
        let entries = store.entries_for("note", "n1").expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!({"v": 3}));
        assert_eq!(entries[0].payload_version, 3);
        assert_eq!(entries[0].created_at, ts(0));
    }

    #[test]
    fn create_then_delete_before_dispatch_leaves_nothing() {
        let store = store();
        enqueue_at(&store, "n1", SyncOperation::Create, json!({"v": 1}), 0);
        let outcome = enqueue_at(&store, "n1", SyncOperation::Delete, Value::Null, 1);
        assert!(matches!(outcome, Enqueued::Collapsed(_)));
        assert_eq!(outcome.entry_id(), None);
        assert_eq!(store.count_pending(None).expect("count"), 0);
        assert_eq!(store.sync_state("note", "n1").expect("state"), SyncState::Synced);
    }

    #[test]
    fn create_then_delete_after_dispatch_becomes_delete() {
        let store = store();
        enqueue_at(&store, "n1", SyncOperation::Create, json!({"v": 1}), 0);
        store.dequeue_batch_at(10, None, ts(1)).expect("dequeue");
        enqueue_at(&store, "n1", SyncOperation::Delete, Value::Null, 2);

        let entries = store.entries_for("note", "n1").expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, SyncOperation::Delete);
    }

    #[test]
    fn conflict_cannot_be_enqueued_directly() {
        let store = store();
        let err = store
            .enqueue("note", "n1", SyncOperation::Conflict, &json!({}))
            .expect_err("conflict rejected");
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[test]
    fn dequeue_orders_by_creation_and_respects_filter_and_limit() {
        let store = store();
        enqueue_at(&store, "b", SyncOperation::Create, json!({}), 1);
        enqueue_at(&store, "a", SyncOperation::Create, json!({}), 0);
        store
            .with_transaction(|tx| tx.enqueue_at("tag", "t", SyncOperation::Create, &json!({}), ts(2)))
            .expect("enqueue tag");

        let notes = store.dequeue_batch_at(1, Some("note"), ts(3)).expect("dequeue");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].entity_id, "a");
        let lease = notes[0].lease.as_ref().expect("leased");
        assert_eq!(lease.expires_at, ts(3) + Duration::milliseconds(store.config().lease_ttl_ms));

        let rest = store.dequeue_batch_at(10, None, ts(3)).expect("dequeue rest");
        let ids = rest.iter().map(|entry| entry.entity_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "t"]);
        assert!(store.dequeue_batch_at(10, None, ts(3)).expect("empty").is_empty());
    }

    #[test]
    fn expired_lease_makes_entry_eligible_again() {
        let config = StoreConfig {
            lease_ttl_ms: 60_000,
            ..StoreConfig::default()
        };
        let store = SyncStore::open_in_memory_with_config(config).expect("open store");
        enqueue_at(&store, "n1", SyncOperation::Update, json!({}), 0);

        let first = store.dequeue_batch_at(10, None, ts(1)).expect("first lease");
        assert_eq!(first.len(), 1);
        assert!(store.dequeue_batch_at(10, None, ts(1) + Duration::seconds(59)).expect("live").is_empty());
        let second = store.dequeue_batch_at(10, None, ts(2)).expect("after expiry");
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].lease, second[0].lease);
        assert_eq!(second[0].dispatched_at, Some(ts(1)));
    }

    #[test]
    fn ack_after_concurrent_edit_is_superseded() {
        let store = store();
        enqueue_at(&store, "n1", SyncOperation::Create, json!({"v": 1}), 0);
        let leased = store.dequeue_batch_at(10, None, ts(1)).expect("dequeue");
        enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 2}), 2);

        let token = leased[0].lease_token().expect("leased");
        assert_eq!(store.acknowledge(leased[0].id, token).expect("ack"), AckOutcome::Superseded);
        let entry = store.entry(leased[0].id).expect("load").expect("still queued");
        assert_eq!(entry.operation, SyncOperation::Update);
        assert_eq!(entry.payload, json!({"v": 2}));
        assert!(entry.lease.is_none());

        let again = store.dequeue_batch_at(10, None, ts(3)).expect("dequeue again");
        let token = again[0].lease_token().expect("leased");
        assert_eq!(store.acknowledge(again[0].id, token).expect("ack"), AckOutcome::Removed);
        assert_eq!(store.acknowledge(again[0].id, token).expect("ack"), AckOutcome::Missing);
        assert!(!store.is_pending("note", "n1").expect("pending"));
    }

    #[test]
    fn failures_past_budget_make_entry_stuck_until_requeued() {
        let config = StoreConfig {
            default_max_retries: 1,
            ..StoreConfig::default()
        };
        let store = SyncStore::open_in_memory_with_config(config).expect("open store");
        let id = enqueue_at(&store, "n1", SyncOperation::Update, json!({}), 0)
            .entry_id()
            .expect("entry id");

        fail_once(&store, id, ts(1));
        let entry = fail_once(&store, id, ts(2));
        assert!(entry.is_stuck());
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert_eq!(store.sync_state("note", "n1").expect("state"), SyncState::Stuck);
        assert!(store.dequeue_batch_at(10, None, ts(5)).expect("dequeue").is_empty());
        assert_eq!(store.stuck_entries(None).expect("stuck").len(), 1);
        assert_eq!(store.count_pending(None).expect("count"), 1);

        let requeued = store.requeue_stuck(id).expect("requeue");
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(store.dequeue_batch_at(10, None, ts(5)).expect("dequeue").len(), 1);
        assert!(matches!(
            store.requeue_stuck(id),
            Err(StorageError::InvalidOperation(_))
        ));
        assert_eq!(store.record_failure(999, "any", "gone").expect("missing"), None);
    }

    #[test]
    fn conflicts_are_excluded_and_replace_older_conflicts() {
        let store = store();
        let first = enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 1}), 0)
            .entry_id()
            .expect("entry id");
        let leased = store.dequeue_batch_at(10, None, ts(0)).expect("dequeue");
        let token = leased[0].lease_token().expect("leased");
        store
            .mark_conflict(first, token, json!({"v": "server"}), "stale")
            .expect("mark")
            .expect("entry");

        let second = enqueue_at(&store, "n1", SyncOperation::Update, json!({"v": 2}), 1)
            .entry_id()
            .expect("entry id");
        assert_ne!(first, second);
        assert_eq!(store.sync_state("note", "n1").expect("state"), SyncState::Conflict);

        let leased = store.dequeue_batch_at(10, None, ts(2)).expect("dequeue");
        assert_eq!(leased.iter().map(|entry| entry.id).collect::<Vec<_>>(), vec![second]);

        let token = leased[0].lease_token().expect("leased");
        let conflict = store
            .mark_conflict(second, token, json!({"v": "server2"}), "stale again")
            .expect("mark")
            .expect("entry");
        assert!(store.entry(first).expect("load").is_none());
        assert_eq!(store.count_conflicts(None).expect("count"), 1);
        assert_eq!(store.count_pending(None).expect("count"), 0);
        assert!(store.is_pending("note", "n1").expect("pending"));

        let record = conflict.conflict_record().expect("record");
        assert_eq!(record.local_payload, json!({"v": 2}));
        assert_eq!(record.rejected_operation, SyncOperation::Update);
        assert!(conflict.lease.is_none());
        assert!(matches!(
            store.acknowledge(second, token),
            Err(StorageError::InvalidOperation(_))
        ));
    }

    #[test]
    fn release_returns_entry_to_the_queue() {
        let store = store();
        enqueue_at(&store, "n1", SyncOperation::Update, json!({}), 0);
        let leased = store.dequeue_batch_at(10, None, ts(1)).expect("dequeue");
        let token = leased[0].lease_token().expect("leased");
        assert!(!store.release(leased[0].id, "someone else").expect("foreign release"));
        assert!(store.release(leased[0].id, token).expect("release"));
        assert!(!store.release(leased[0].id, token).expect("second release"));
        assert_eq!(store.dequeue_batch_at(10, None, ts(1)).expect("dequeue").len(), 1);
    }

    #[test]
    fn outcomes_under_a_replaced_lease_leave_the_entry_alone() {
        let config = StoreConfig {
            lease_ttl_ms: 60_000,
            ..StoreConfig::default()
        };
        let store = SyncStore::open_in_memory_with_config(config).expect("open store");
        let id = enqueue_at(&store, "n1", SyncOperation::Create, json!({"v": 1}), 0)
            .entry_id()
            .expect("entry id");
        let first = store.dequeue_batch_at(10, None, ts(1)).expect("first lease");
        let old_token = first[0].lease_token().expect("leased").to_string();
        let second = store.dequeue_batch_at(10, None, ts(3)).expect("after expiry");
        let token = second[0].lease_token().expect("leased").to_string();

        assert!(matches!(
            store.record_failure(id, &old_token, "timeout"),
            Err(StorageError::LeaseLost(lost)) if lost == id
        ));
        assert!(matches!(
            store.mark_conflict(id, &old_token, json!({}), "late"),
            Err(StorageError::LeaseLost(_))
        ));
        assert!(!store.release(id, &old_token).expect("release"));
        assert_eq!(store.acknowledge(id, &old_token).expect("ack"), AckOutcome::StaleLease);

        let entry = store.entry(id).expect("load").expect("still queued");
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.operation, SyncOperation::Update);
        assert!(entry.holds_lease(&token));
        assert_eq!(store.acknowledge(id, &token).expect("ack"), AckOutcome::Removed);
    }

    #[test]
    fn oversized_limits_saturate_instead_of_wrapping() {
        let store = store();
        enqueue_at(&store, "a", SyncOperation::Create, json!({}), 0);
        enqueue_at(&store, "b", SyncOperation::Create, json!({}), 1);

        assert_eq!(sql_limit(usize::MAX), i64::MAX);
        assert_eq!(store.list_entries(usize::MAX).expect("list").len(), 2);
        assert_eq!(store.list_entries(1).expect("list").len(), 1);
        assert_eq!(store.dequeue_batch_at(usize::MAX, None, ts(2)).expect("dequeue").len(), 2);
    }
}
