use crate::queue::Enqueued;
use crate::schema::quote_ident;
use crate::{StorageError, SyncStore, SyncTx};
use capsync_core::sync_contracts::SyncOperation;
use capsync_core::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

/// A syncable business table and the entity type its rows are queued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTable {
    pub entity_type: String,
    pub table: String,
}

impl DocumentTable {
    pub fn new(entity_type: &str, table: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            table: table.to_string(),
        }
    }

    pub fn captures() -> Self {
        Self::new("capture", "captures")
    }

    pub fn transcripts() -> Self {
        Self::new("transcript", "transcripts")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    Create(Value),
    Update(Value),
    Delete,
}

impl LocalMutation {
    pub fn operation(&self) -> SyncOperation {
        match self {
            LocalMutation::Create(_) => SyncOperation::Create,
            LocalMutation::Update(_) => SyncOperation::Update,
            LocalMutation::Delete => SyncOperation::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub entity_id: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LocalRecord {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn content_json(content: &Value) -> Result<String, StorageError> {
    serde_json::to_string(content).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn load_record(
    conn: &Connection,
    table: &DocumentTable,
    entity_id: &str,
) -> Result<Option<LocalRecord>, StorageError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, content, created_at, updated_at, deleted_at FROM {} WHERE id = ?1",
                quote_ident(&table.table)
            ),
            [entity_id],
            |row| {
                let content: String = row.get(1)?;
                let content: Value = serde_json::from_str(&content).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                Ok(LocalRecord {
                    entity_id: row.get(0)?,
                    content,
                    created_at: from_millis(row.get(2)?),
                    updated_at: from_millis(row.get(3)?),
                    deleted_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Hard-deletes a row whose delete the server has acknowledged.
pub(crate) fn purge_tombstone(
    conn: &Connection,
    table: &DocumentTable,
    entity_id: &str,
) -> Result<bool, StorageError> {
    let purged = conn.execute(
        &format!(
            "DELETE FROM {} WHERE id = ?1 AND deleted_at IS NOT NULL",
            quote_ident(&table.table)
        ),
        [entity_id],
    )?;
    if purged > 0 {
        debug!(event = "tombstone_purged", entity_type = %table.entity_type, entity_id);
    }
    Ok(purged > 0)
}

impl SyncTx<'_> {
    /// Writes the business row and queues the matching mutation in this
    /// transaction. Deletes tombstone the row until the server acknowledges.
    pub fn apply_local_mutation(
        &self,
        entity_type: &str,
        entity_id: &str,
        mutation: LocalMutation,
    ) -> Result<Enqueued, StorageError> {
        let table = self.config().document_table(entity_type)?.clone();
        let conn = self.connection();
        let now = Utc::now();
        let now_ms = to_millis(now);
        let existing = load_record(conn, &table, entity_id)?;
        let not_found = || StorageError::RecordNotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        };

        let operation = mutation.operation();
        let payload = match mutation {
            LocalMutation::Create(content) => {
                match existing {
                    Some(record) if !record.is_tombstoned() => {
                        return Err(StorageError::InvalidOperation(format!(
                            "{entity_type} {entity_id} already exists"
                        )));
                    }
                    Some(_) => {
                        conn.execute(
                            &format!(
                                "UPDATE {} SET content = ?2, updated_at = ?3, deleted_at = NULL WHERE id = ?1",
                                quote_ident(&table.table)
                            ),
                            params![entity_id, content_json(&content)?, now_ms],
                        )?;
                    }
                    None => {
                        conn.execute(
                            &format!(
                                "INSERT INTO {} (id, content, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                                quote_ident(&table.table)
                            ),
                            params![entity_id, content_json(&content)?, now_ms],
                        )?;
                    }
                }
                content
            }
            LocalMutation::Update(content) => {
                if !existing.as_ref().is_some_and(|record| !record.is_tombstoned()) {
                    return Err(not_found());
                }
                conn.execute(
                    &format!(
                        "UPDATE {} SET content = ?2, updated_at = ?3 WHERE id = ?1",
                        quote_ident(&table.table)
                    ),
                    params![entity_id, content_json(&content)?, now_ms],
                )?;
                content
            }
            LocalMutation::Delete => {
                if !existing.as_ref().is_some_and(|record| !record.is_tombstoned()) {
                    return Err(not_found());
                }
                conn.execute(
                    &format!(
                        "UPDATE {} SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
                        quote_ident(&table.table)
                    ),
                    params![entity_id, now_ms],
                )?;
                Value::Null
            }
        };

        let enqueued = self.enqueue_at(entity_type, entity_id, operation, &payload, now)?;
        if let Enqueued::Collapsed(_) = enqueued {
            // The server never heard of this record, so there is nothing to wait for.
            purge_tombstone(conn, &table, entity_id)?;
        }
        Ok(enqueued)
    }

    pub fn load_record(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<LocalRecord>, StorageError> {
        let table = self.config().document_table(entity_type)?;
        load_record(self.connection(), table, entity_id)
    }

    /// Replaces a live row's content without queueing anything; used when the
    /// server's copy wins.
    pub fn overwrite_record(
        &self,
        entity_type: &str,
        entity_id: &str,
        content: &Value,
    ) -> Result<(), StorageError> {
        let table = self.config().document_table(entity_type)?;
        let changed = self.connection().execute(
            &format!(
                "UPDATE {} SET content = ?2, updated_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
                quote_ident(&table.table)
            ),
            params![entity_id, content_json(content)?, to_millis(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StorageError::RecordNotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }
        Ok(())
    }

    /// Hard-deletes the row; its queue entries go with it.
    pub fn purge_record(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        let table = self.config().document_table(entity_type)?;
        let purged = self.connection().execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(&table.table)),
            [entity_id],
        )?;
        if purged > 0 {
            debug!(event = "record_purged", entity_type, entity_id);
        }
        Ok(purged > 0)
    }
}

impl SyncStore {
    pub fn apply_local_mutation(
        &self,
        entity_type: &str,
        entity_id: &str,
        mutation: LocalMutation,
    ) -> Result<Enqueued, StorageError> {
        self.with_transaction(|tx| tx.apply_local_mutation(entity_type, entity_id, mutation))
    }

    pub fn load_record(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<LocalRecord>, StorageError> {
        let table = self.config().document_table(entity_type)?;
        load_record(self.connection(), table, entity_id)
    }

    pub fn purge_record(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        self.with_transaction(|tx| tx.purge_record(entity_type, entity_id))
    }
}
