use capsync_storage::migrate::{pending_revisions, rollback_to, run_migrations, schema_version};
use capsync_storage::revisions::{self, CURRENT_SCHEMA_VERSION};
use capsync_storage::schema::{column_exists, ColumnDef, Revision, SchemaStep};
use capsync_storage::{open_connection, MigrationError, StorageError, StoreConfig, SyncStore};
use rusqlite::Connection;
use tempfile::NamedTempFile;

fn schema_dump(conn: &Connection) -> Vec<(String, String, Option<String>)> {
    let mut statement = conn
        .prepare(
            "SELECT type, name, sql FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%'
             ORDER BY type, name",
        )
        .expect("prepare dump");
    statement
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .expect("query dump")
        .collect::<Result<Vec<_>, _>>()
        .expect("collect dump")
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).expect("count query")
}

#[test]
fn second_run_applies_nothing_and_leaves_schema_unchanged() {
    let conn = Connection::open_in_memory().expect("open db");
    let first = run_migrations(&conn, &revisions::all()).expect("first run");
    assert_eq!(first.applied_count(), CURRENT_SCHEMA_VERSION as usize);
    let before = schema_dump(&conn);

    let second = run_migrations(&conn, &revisions::all()).expect("second run");
    assert_eq!(second.applied_count(), 0);
    assert_eq!(second.from_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(schema_dump(&conn), before);
}

#[test]
fn interrupted_upgrade_resumes_to_the_same_schema() {
    let reference = Connection::open_in_memory().expect("open reference");
    run_migrations(&reference, &revisions::all()).expect("uninterrupted run");

    for crash_after in 0..CURRENT_SCHEMA_VERSION as usize {
        let conn = Connection::open_in_memory().expect("open db");
        let mut partial = revisions::all();
        partial.truncate(crash_after);
        partial.push(Revision::new(
            crash_after as u32 + 1,
            "crashes midway",
            vec![
                SchemaStep::create_table(capsync_storage::schema::TableDef::new(
                    "half_done",
                    vec![ColumnDef::new("id", "INTEGER").primary_key()],
                )),
                SchemaStep::Sql {
                    name: "fail",
                    sql: "SELECT * FROM table_that_does_not_exist",
                },
            ],
        ));
        let err = run_migrations(&conn, &partial).expect_err("crashing revision fails");
        assert!(matches!(err, MigrationError::RevisionFailed { .. }));
        assert_eq!(schema_version(&conn).expect("version"), crash_after as i64);
        assert!(schema_dump(&conn).iter().all(|(_, name, _)| name != "half_done"));

        let resumed = run_migrations(&conn, &revisions::all()).expect("resume");
        assert_eq!(resumed.from_version, crash_after as u32);
        assert_eq!(schema_dump(&conn), schema_dump(&reference), "crash after {crash_after}");
        assert_eq!(
            schema_version(&conn).expect("version"),
            i64::from(CURRENT_SCHEMA_VERSION)
        );
    }
}

#[test]
fn pending_lists_only_unapplied_revisions() {
    let conn = Connection::open_in_memory().expect("open db");
    run_migrations(&conn, &revisions::all()[..2]).expect("migrate to v2");
    assert_eq!(
        pending_revisions(&conn, &revisions::all()).expect("pending"),
        vec![3, 4, 5, 6]
    );
}

#[test]
fn legacy_sync_flag_moves_into_the_queue() {
    let conn = Connection::open_in_memory().expect("open db");
    run_migrations(&conn, &revisions::all()[..4]).expect("migrate to v4");
    conn.execute_batch(
        "
        INSERT INTO captures (id, body, is_synced, created_at, updated_at, deleted_at) VALUES
          ('synced', '{\"text\":\"a\"}', 1, 1, 1, NULL),
          ('dirty', '{\"text\":\"b\"}', 0, 2, 2, NULL),
          ('plain', 'not json', 0, 3, 3, NULL),
          ('gone', '{\"text\":\"c\"}', 0, 4, 5, 5),
          ('queued', '{\"text\":\"d\"}', 0, 6, 6, NULL);
        INSERT INTO sync_queue (entity_type, entity_id, operation, payload, created_at)
        VALUES ('capture', 'queued', 'create', '{\"text\":\"d\"}', 6);
        ",
    )
    .expect("seed legacy data");

    run_migrations(&conn, &revisions::all()).expect("migrate to current");

    assert!(!column_exists(&conn, "captures", "is_synced").expect("column check"));
    assert!(column_exists(&conn, "captures", "content").expect("column check"));
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'idx_captures_unsynced'"),
        0
    );
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'idx_captures_updated'"),
        1
    );

    let mut statement = conn
        .prepare("SELECT entity_id, operation, payload FROM sync_queue ORDER BY created_at, id")
        .expect("prepare");
    let entries = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    assert_eq!(
        entries,
        vec![
            ("dirty".to_string(), "update".to_string(), "{\"text\":\"b\"}".to_string()),
            ("plain".to_string(), "update".to_string(), "\"not json\"".to_string()),
            ("gone".to_string(), "delete".to_string(), "null".to_string()),
            ("queued".to_string(), "create".to_string(), "{\"text\":\"d\"}".to_string()),
        ]
    );

    conn.execute("DELETE FROM captures WHERE id = 'dirty'", [])
        .expect("delete capture");
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM sync_queue WHERE entity_id = 'dirty'"),
        0
    );
}

#[test]
fn rollback_and_reupgrade_keep_rows() {
    let file = NamedTempFile::new().expect("temp file");
    {
        let store = SyncStore::open(file.path()).expect("open store");
        store
            .apply_local_mutation(
                "capture",
                "c1",
                capsync_storage::LocalMutation::Create(serde_json::json!({"text": "keep me"})),
            )
            .expect("create capture");
    }

    let conn = open_connection(file.path(), &StoreConfig::default()).expect("open raw");
    let report = rollback_to(&conn, &revisions::all(), 3).expect("rollback");
    assert_eq!(report.applied, vec![6, 5, 4]);
    assert_eq!(schema_version(&conn).expect("version"), 3);
    assert!(column_exists(&conn, "captures", "body").expect("column check"));
    assert!(!column_exists(&conn, "sync_queue", "lease_token").expect("column check"));
    let flag: i64 = conn
        .query_row("SELECT is_synced FROM captures WHERE id = 'c1'", [], |row| row.get(0))
        .expect("flag");
    assert_eq!(flag, 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM schema_revisions"), 3);
    drop(conn);

    let store = SyncStore::open(file.path()).expect("reopen store");
    assert_eq!(store.last_migration().applied, vec![4, 5, 6]);
    let record = store
        .load_record("capture", "c1")
        .expect("load")
        .expect("record survives");
    assert_eq!(record.content, serde_json::json!({"text": "keep me"}));
    assert_eq!(store.count_pending(Some("capture")).expect("count"), 1);
}

#[test]
fn rollback_without_revert_changes_nothing() {
    let mut set = revisions::all();
    set.push(Revision::new(
        CURRENT_SCHEMA_VERSION + 1,
        "irreversible",
        vec![SchemaStep::add_column("captures", ColumnDef::new("pinned", "INTEGER"))],
    ));
    let conn = Connection::open_in_memory().expect("open db");
    run_migrations(&conn, &set).expect("migrate");

    let err = rollback_to(&conn, &set, CURRENT_SCHEMA_VERSION - 1).expect_err("missing revert");
    assert!(matches!(
        err,
        MigrationError::MissingRevert { version } if version == CURRENT_SCHEMA_VERSION + 1
    ));
    assert_eq!(
        schema_version(&conn).expect("version"),
        i64::from(CURRENT_SCHEMA_VERSION + 1)
    );
}

#[test]
fn edited_release_is_detected() {
    let conn = Connection::open_in_memory().expect("open db");
    run_migrations(&conn, &revisions::all()).expect("migrate");

    let mut edited = revisions::all();
    edited[5] = Revision::new(
        6,
        "captures body becomes content",
        vec![
            SchemaStep::rename_column("captures", "body", "content"),
            SchemaStep::add_column("captures", ColumnDef::new("pinned", "INTEGER")),
        ],
    );
    let err = run_migrations(&conn, &edited).expect_err("edited revision");
    assert!(matches!(err, MigrationError::RevisionEdited { version: 6, .. }));
}

#[test]
fn store_refuses_a_database_from_a_newer_build() {
    let file = NamedTempFile::new().expect("temp file");
    {
        let conn = open_connection(file.path(), &StoreConfig::default()).expect("open raw");
        run_migrations(&conn, &revisions::all()).expect("migrate");
        conn.execute_batch(&format!(
            "PRAGMA user_version = {}",
            CURRENT_SCHEMA_VERSION + 1
        ))
        .expect("bump version");
    }
    match SyncStore::open(file.path()) {
        Err(StorageError::Migration(MigrationError::UnsupportedSchemaVersion { found, supported })) => {
            assert_eq!(found, i64::from(CURRENT_SCHEMA_VERSION + 1));
            assert_eq!(supported, i64::from(CURRENT_SCHEMA_VERSION));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("newer database must be refused"),
    }
}
