//! The shipped revision history. Released revisions are never edited; a change
//! to the schema is always a new revision at the end of [`all`].

use crate::schema::{ColumnDef, IndexDef, Revision, SchemaStep, TableDef, SYNC_QUEUE_TABLE};
use crate::StorageError;
use capsync_core::sync_contracts::{coalesce, Coalesced, SyncOperation, DEFAULT_MAX_RETRIES};
use rusqlite::{params, Connection};
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: u32 = 6;

pub fn all() -> Vec<Revision> {
    vec![
        Revision::new(
            1,
            "captures table",
            vec![
                SchemaStep::create_table(TableDef::new(
                    "captures",
                    vec![
                        ColumnDef::new("id", "TEXT").primary_key(),
                        ColumnDef::new("body", "TEXT").not_null(),
                        ColumnDef::new("is_synced", "INTEGER").not_null().default_sql("0"),
                        ColumnDef::new("created_at", "INTEGER").not_null(),
                        ColumnDef::new("updated_at", "INTEGER").not_null(),
                    ],
                )),
                SchemaStep::create_index(IndexDef::new(
                    "idx_captures_updated",
                    "captures",
                    &["updated_at"],
                )),
                SchemaStep::create_index(
                    IndexDef::new("idx_captures_unsynced", "captures", &["is_synced"])
                        .partial("is_synced = 0"),
                ),
            ],
        )
        .with_revert(vec![SchemaStep::drop_table("captures")]),
        Revision::new(
            2,
            "sync queue with capture cascade",
            vec![
                SchemaStep::create_table(sync_queue_v2()),
                SchemaStep::create_index(IndexDef::new(
                    "idx_sync_queue_entity",
                    SYNC_QUEUE_TABLE,
                    &["entity_type", "entity_id"],
                )),
                SchemaStep::create_index(IndexDef::new(
                    "idx_sync_queue_created",
                    SYNC_QUEUE_TABLE,
                    &["created_at", "id"],
                )),
                SchemaStep::sync_cascade("captures", "capture"),
            ],
        )
        .with_revert(vec![
            SchemaStep::drop_sync_cascade("captures"),
            SchemaStep::drop_table(SYNC_QUEUE_TABLE),
        ]),
        Revision::new(
            3,
            "capture tombstones and transcripts",
            vec![
                SchemaStep::add_column("captures", ColumnDef::new("deleted_at", "INTEGER")),
                SchemaStep::create_table(TableDef::new(
                    "transcripts",
                    vec![
                        ColumnDef::new("id", "TEXT").primary_key(),
                        ColumnDef::new("content", "TEXT").not_null(),
                        ColumnDef::new("created_at", "INTEGER").not_null(),
                        ColumnDef::new("updated_at", "INTEGER").not_null(),
                        ColumnDef::new("deleted_at", "INTEGER"),
                    ],
                )),
                SchemaStep::create_index(IndexDef::new(
                    "idx_transcripts_updated",
                    "transcripts",
                    &["updated_at"],
                )),
                SchemaStep::sync_cascade("transcripts", "transcript"),
            ],
        )
        .with_revert(vec![
            SchemaStep::drop_sync_cascade("transcripts"),
            SchemaStep::drop_table("transcripts"),
            SchemaStep::drop_column("captures", "deleted_at"),
        ]),
        Revision::new(
            4,
            "queue leases and one active entry per record",
            vec![
                SchemaStep::add_column(
                    SYNC_QUEUE_TABLE,
                    ColumnDef::new("payload_version", "INTEGER")
                        .not_null()
                        .default_sql("1"),
                ),
                SchemaStep::add_column(SYNC_QUEUE_TABLE, ColumnDef::new("dispatched_at", "INTEGER")),
                SchemaStep::add_column(SYNC_QUEUE_TABLE, ColumnDef::new("lease_token", "TEXT")),
                SchemaStep::add_column(
                    SYNC_QUEUE_TABLE,
                    ColumnDef::new("lease_expires_at", "INTEGER"),
                ),
                SchemaStep::add_column(SYNC_QUEUE_TABLE, ColumnDef::new("leased_version", "INTEGER")),
                SchemaStep::Backfill {
                    name: "fold duplicate queue entries",
                    run: fold_duplicate_entries,
                },
                SchemaStep::create_index(
                    IndexDef::new(
                        "ux_sync_queue_active",
                        SYNC_QUEUE_TABLE,
                        &["entity_type", "entity_id"],
                    )
                    .unique()
                    .partial("operation != 'conflict'"),
                ),
                SchemaStep::create_index(
                    IndexDef::new(
                        "ux_sync_queue_conflict",
                        SYNC_QUEUE_TABLE,
                        &["entity_type", "entity_id"],
                    )
                    .unique()
                    .partial("operation = 'conflict'"),
                ),
            ],
        )
        .with_revert(vec![
            SchemaStep::drop_index("ux_sync_queue_active"),
            SchemaStep::drop_index("ux_sync_queue_conflict"),
            SchemaStep::RebuildTable {
                table: sync_queue_v2(),
                copy: Vec::new(),
            },
        ]),
        Revision::new(
            5,
            "move capture sync flag into the queue",
            vec![
                SchemaStep::Backfill {
                    name: "enqueue unsynced captures",
                    run: enqueue_unsynced_captures,
                },
                SchemaStep::drop_column("captures", "is_synced"),
            ],
        )
        .with_revert(vec![
            SchemaStep::add_column(
                "captures",
                ColumnDef::new("is_synced", "INTEGER").not_null().default_sql("1"),
            ),
            SchemaStep::Backfill {
                name: "restore capture sync flag",
                run: restore_sync_flag,
            },
            SchemaStep::create_index(
                IndexDef::new("idx_captures_unsynced", "captures", &["is_synced"])
                    .partial("is_synced = 0"),
            ),
        ]),
        Revision::new(
            6,
            "captures body becomes content",
            vec![SchemaStep::rename_column("captures", "body", "content")],
        )
        .with_revert(vec![SchemaStep::rename_column("captures", "content", "body")]),
    ]
}

/// Queue shape as first released; revision 4's revert rebuilds back to it.
fn sync_queue_v2() -> TableDef {
    TableDef::new(
        SYNC_QUEUE_TABLE,
        vec![
            ColumnDef::new("id", "INTEGER").autoincrement(),
            ColumnDef::new("entity_type", "TEXT").not_null(),
            ColumnDef::new("entity_id", "TEXT").not_null(),
            ColumnDef::new("operation", "TEXT")
                .not_null()
                .check("operation IN ('create', 'update', 'delete', 'conflict')"),
            ColumnDef::new("payload", "TEXT").not_null(),
            ColumnDef::new("created_at", "INTEGER").not_null(),
            ColumnDef::new("retry_count", "INTEGER").not_null().default_sql("0"),
            ColumnDef::new("last_error", "TEXT"),
            ColumnDef::new("max_retries", "INTEGER")
                .not_null()
                .default_sql(&DEFAULT_MAX_RETRIES.to_string()),
        ],
    )
}

/// Older builds could queue several active entries for one record. Fold each
/// group into its oldest entry using the coalescing rules, and keep only the
/// newest conflict per record.
fn fold_duplicate_entries(conn: &Connection) -> Result<(), StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT id, entity_type, entity_id, operation, payload
        FROM sync_queue
        WHERE operation != 'conflict'
        ORDER BY entity_type, entity_id, created_at, id
        ",
    )?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut folded = 0usize;
    let mut index = 0;
    while index < rows.len() {
        let (keeper, entity_type, entity_id, operation, payload) = &rows[index];
        let mut end = index + 1;
        while end < rows.len() && rows[end].1 == *entity_type && rows[end].2 == *entity_id {
            end += 1;
        }
        if end - index > 1 {
            // Legacy entries carry no dispatch marker; assume the server saw them.
            let mut state = Some(operation.parse::<SyncOperation>()?);
            let mut latest_payload = payload.clone();
            for (_, _, _, next_op, next_payload) in &rows[index + 1..end] {
                let incoming = next_op.parse::<SyncOperation>()?;
                state = match state {
                    Some(current) => match coalesce(current, incoming, true) {
                        Coalesced::Replace(op) => Some(op),
                        Coalesced::Drop => None,
                    },
                    None => Some(incoming),
                };
                latest_payload = next_payload.clone();
            }

            for (duplicate, ..) in &rows[index + 1..end] {
                conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![duplicate])?;
            }
            match state {
                Some(op) => {
                    conn.execute(
                        "UPDATE sync_queue SET operation = ?2, payload = ?3, retry_count = 0, last_error = NULL WHERE id = ?1",
                        params![keeper, op.as_str(), latest_payload],
                    )?;
                }
                None => {
                    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![keeper])?;
                }
            }
            folded += end - index - 1;
        }
        index = end;
    }

    let stale_conflicts = conn.execute(
        "
        DELETE FROM sync_queue
        WHERE operation = 'conflict'
          AND id NOT IN (
            SELECT MAX(id) FROM sync_queue WHERE operation = 'conflict'
            GROUP BY entity_type, entity_id
          )
        ",
        [],
    )?;

    if folded > 0 || stale_conflicts > 0 {
        info!(event = "queue_duplicates_folded", folded, stale_conflicts);
    }
    Ok(())
}

/// Captures flagged unsynced become queue entries so the queue alone decides
/// what is pending. Tombstoned captures become deletes.
fn enqueue_unsynced_captures(conn: &Connection) -> Result<(), StorageError> {
    if !crate::schema::column_exists(conn, "captures", "is_synced")? {
        return Ok(());
    }
    let enqueued = conn.execute(
        "
        INSERT INTO sync_queue (entity_type, entity_id, operation, payload, created_at)
        SELECT
          'capture',
          c.id,
          CASE WHEN c.deleted_at IS NULL THEN 'update' ELSE 'delete' END,
          CASE
            WHEN c.deleted_at IS NOT NULL THEN 'null'
            WHEN json_valid(c.body) THEN c.body
            ELSE json_quote(c.body)
          END,
          c.updated_at
        FROM captures c
        WHERE c.is_synced = 0
          AND NOT EXISTS (
            SELECT 1 FROM sync_queue q
            WHERE q.entity_type = 'capture' AND q.entity_id = c.id AND q.operation != 'conflict'
          )
        ORDER BY c.updated_at, c.id
        ",
        [],
    )?;
    info!(event = "legacy_sync_flags_enqueued", enqueued);
    Ok(())
}

fn restore_sync_flag(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "
        UPDATE captures SET is_synced = 0
        WHERE id IN (SELECT entity_id FROM sync_queue WHERE entity_type = 'capture')
        ",
        [],
    )?;
    Ok(())
}
