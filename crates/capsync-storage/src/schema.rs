//! Declarative schema revisions.
//!
//! A revision is a list of [`SchemaStep`]s. Every step is safe to re-run: column
//! additions skip columns that already exist, creations use `IF NOT EXISTS`, and
//! column drops/renames that already happened are no-ops. Column drops and
//! renames go through one shadow-table rebuild ([`rebuild_table`]) instead of
//! hand-written copy scripts.

use crate::StorageError;
use capsync_core::sync_contracts::sha256_hex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const SYNC_QUEUE_TABLE: &str = "sync_queue";
const SHADOW_PREFIX: &str = "_capsync_shadow_";

/// Data migration run inside the revision's transaction.
pub type BackfillFn = fn(&Connection) -> Result<(), StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub default_sql: Option<String>,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub check: Option<String>,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            not_null: false,
            default_sql: None,
            primary_key: false,
            autoincrement: false,
            check: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_sql(mut self, expr: &str) -> Self {
        self.default_sql = Some(expr.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.primary_key = true;
        self.autoincrement = true;
        self
    }

    pub fn check(mut self, expr: &str) -> Self {
        self.check = Some(expr.to_string());
        self
    }

    fn render(&self, inline_pk: bool) -> String {
        let mut sql = quote_ident(&self.name);
        if !self.sql_type.is_empty() {
            sql.push(' ');
            sql.push_str(&self.sql_type);
        }
        if inline_pk && self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.autoincrement {
                sql.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default_sql) = &self.default_sql {
            sql.push_str(" DEFAULT ");
            sql.push_str(default_sql);
        }
        if let Some(check) = &self.check {
            sql.push_str(&format!(" CHECK ({check})"));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Table constraints rendered verbatim after the columns.
    pub constraints: Vec<String>,
}

impl TableDef {
    pub fn new(name: &str, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            constraints: Vec::new(),
        }
    }

    pub fn constraint(mut self, sql: &str) -> Self {
        self.constraints.push(sql.to_string());
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    fn render_create(&self, name: &str) -> String {
        let pk_columns = self
            .columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>();
        let inline_pk = pk_columns.len() == 1;

        let mut parts = self
            .columns
            .iter()
            .map(|column| column.render(inline_pk))
            .collect::<Vec<_>>();
        if pk_columns.len() > 1 {
            parts.push(format!("PRIMARY KEY ({})", pk_columns.join(", ")));
        }
        parts.extend(self.constraints.iter().cloned());

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quote_ident(name),
            parts.join(",\n  ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub predicate: Option<String>,
}

impl IndexDef {
    pub fn new(name: &str, table: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|column| column.to_string()).collect(),
            unique: false,
            predicate: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn partial(mut self, predicate: &str) -> Self {
        self.predicate = Some(predicate.to_string());
        self
    }

    fn render(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({columns})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
        );
        if let Some(predicate) = &self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        sql
    }
}

pub enum SchemaStep {
    CreateTable(TableDef),
    DropTable {
        table: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    /// Rebuild `table` into an explicitly declared shape. `copy` maps target
    /// columns to SQL expressions over the old table; when empty, columns that
    /// exist on both sides are copied by name.
    RebuildTable {
        table: TableDef,
        copy: Vec<(String, String)>,
    },
    CreateIndex(IndexDef),
    DropIndex {
        name: String,
    },
    /// Delete trigger that removes a record's queue entries when the record row
    /// is deleted. One per syncable table.
    SyncCascade {
        table: String,
        entity_type: String,
        id_column: String,
    },
    DropSyncCascade {
        table: String,
    },
    Backfill {
        name: &'static str,
        run: BackfillFn,
    },
    Sql {
        name: &'static str,
        sql: &'static str,
    },
}

impl SchemaStep {
    pub fn create_table(table: TableDef) -> Self {
        Self::CreateTable(table)
    }

    pub fn drop_table(table: &str) -> Self {
        Self::DropTable {
            table: table.to_string(),
        }
    }

    pub fn add_column(table: &str, column: ColumnDef) -> Self {
        Self::AddColumn {
            table: table.to_string(),
            column,
        }
    }

    pub fn drop_column(table: &str, column: &str) -> Self {
        Self::DropColumn {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    pub fn rename_column(table: &str, from: &str, to: &str) -> Self {
        Self::RenameColumn {
            table: table.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn create_index(index: IndexDef) -> Self {
        Self::CreateIndex(index)
    }

    pub fn drop_index(name: &str) -> Self {
        Self::DropIndex {
            name: name.to_string(),
        }
    }

    pub fn sync_cascade(table: &str, entity_type: &str) -> Self {
        Self::SyncCascade {
            table: table.to_string(),
            entity_type: entity_type.to_string(),
            id_column: "id".to_string(),
        }
    }

    pub fn drop_sync_cascade(table: &str) -> Self {
        Self::DropSyncCascade {
            table: table.to_string(),
        }
    }

    /// Stable text used for revision fingerprints.
    pub fn describe(&self) -> String {
        match self {
            SchemaStep::CreateTable(table) => table.render_create(&table.name),
            SchemaStep::DropTable { table } => format!("DROP TABLE {table}"),
            SchemaStep::AddColumn { table, column } => {
                format!("ADD COLUMN {table}.{}", column.render(false))
            }
            SchemaStep::DropColumn { table, column } => format!("DROP COLUMN {table}.{column}"),
            SchemaStep::RenameColumn { table, from, to } => {
                format!("RENAME COLUMN {table}.{from} TO {to}")
            }
            SchemaStep::RebuildTable { table, copy } => {
                let copy = copy
                    .iter()
                    .map(|(target, expr)| format!("{target}={expr}"))
                    .collect::<Vec<_>>()
                    .join(";");
                format!("REBUILD {} COPY {copy}", table.render_create(&table.name))
            }
            SchemaStep::CreateIndex(index) => index.render(),
            SchemaStep::DropIndex { name } => format!("DROP INDEX {name}"),
            SchemaStep::SyncCascade {
                table,
                entity_type,
                id_column,
            } => cascade_trigger_sql(table, entity_type, id_column),
            SchemaStep::DropSyncCascade { table } => format!("DROP CASCADE {table}"),
            SchemaStep::Backfill { name, .. } => format!("BACKFILL {name}"),
            SchemaStep::Sql { name, sql } => format!("SQL {name}: {sql}"),
        }
    }

    pub(crate) fn apply(&self, conn: &Connection) -> Result<(), StorageError> {
        match self {
            SchemaStep::CreateTable(table) => {
                conn.execute_batch(&table.render_create(&table.name))?;
            }
            SchemaStep::DropTable { table } => {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
            }
            SchemaStep::AddColumn { table, column } => {
                if column_exists(conn, table, &column.name)? {
                    debug!(event = "add_column_skipped", table = %table, column = %column.name);
                } else {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_ident(table),
                        column.render(false)
                    ))?;
                }
            }
            SchemaStep::DropColumn { table, column } => {
                if !column_exists(conn, table, column)? {
                    debug!(event = "drop_column_skipped", table = %table, column = %column);
                    return Ok(());
                }
                let introspected = introspect_table(conn, table)?;
                let target = introspected.without_column(column)?;
                rebuild_table(conn, &target, &[], &BTreeMap::new())?;
            }
            SchemaStep::RenameColumn { table, from, to } => {
                let has_from = column_exists(conn, table, from)?;
                let has_to = column_exists(conn, table, to)?;
                match (has_from, has_to) {
                    (false, true) => {
                        debug!(event = "rename_column_skipped", table = %table, column = %to);
                    }
                    (true, false) => {
                        let introspected = introspect_table(conn, table)?;
                        let target = introspected.with_renamed_column(from, to);
                        let mut renames = BTreeMap::new();
                        renames.insert(from.clone(), to.clone());
                        rebuild_table(conn, &target, &[], &renames)?;
                    }
                    (true, true) => {
                        return Err(StorageError::InvalidOperation(format!(
                            "cannot rename {table}.{from} to {to}: both columns exist"
                        )));
                    }
                    (false, false) => {
                        return Err(StorageError::SchemaObjectMissing(format!("{table}.{from}")));
                    }
                }
            }
            SchemaStep::RebuildTable { table, copy } => {
                rebuild_table(conn, table, copy, &BTreeMap::new())?;
            }
            SchemaStep::CreateIndex(index) => {
                conn.execute_batch(&index.render())?;
            }
            SchemaStep::DropIndex { name } => {
                conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)))?;
            }
            SchemaStep::SyncCascade {
                table,
                entity_type,
                id_column,
            } => {
                conn.execute_batch(&cascade_trigger_sql(table, entity_type, id_column))?;
            }
            SchemaStep::DropSyncCascade { table } => {
                conn.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {}",
                    quote_ident(&cascade_trigger_name(table))
                ))?;
            }
            SchemaStep::Backfill { run, .. } => run(conn)?,
            SchemaStep::Sql { sql, .. } => conn.execute_batch(sql)?,
        }
        Ok(())
    }
}

/// One released schema change. Never edit a revision after it ships; add a new
/// one instead.
pub struct Revision {
    pub version: u32,
    pub description: &'static str,
    pub steps: Vec<SchemaStep>,
    pub revert: Option<Vec<SchemaStep>>,
}

impl Revision {
    pub fn new(version: u32, description: &'static str, steps: Vec<SchemaStep>) -> Self {
        Self {
            version,
            description,
            steps,
            revert: None,
        }
    }

    pub fn with_revert(mut self, steps: Vec<SchemaStep>) -> Self {
        self.revert = Some(steps);
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.revert.is_some()
    }

    /// SHA-256 over the forward steps. Reverts are excluded so that adding an
    /// inverse to a shipped revision does not count as editing it.
    pub fn fingerprint(&self) -> String {
        let mut rendered = format!("{}|{}", self.version, self.description);
        for step in &self.steps {
            rendered.push('\n');
            rendered.push_str(&step.describe());
        }
        sha256_hex(rendered.as_bytes())
    }
}

pub(crate) fn apply_steps(conn: &Connection, steps: &[SchemaStep]) -> Result<(), StorageError> {
    for step in steps {
        step.apply(conn)?;
    }
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn cascade_trigger_name(table: &str) -> String {
    format!("{table}_sync_cascade")
}

fn cascade_trigger_sql(table: &str, entity_type: &str, id_column: &str) -> String {
    format!(
        "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER DELETE ON {table}\nBEGIN\n  DELETE FROM {queue} WHERE entity_type = {entity_type} AND entity_id = OLD.{id};\nEND",
        trigger = quote_ident(&cascade_trigger_name(table)),
        table = quote_ident(table),
        queue = quote_ident(SYNC_QUEUE_TABLE),
        entity_type = sql_literal(entity_type),
        id = quote_ident(id_column),
    )
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

pub fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = statement.query_map([], |row| row.get::<_, String>(1))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StorageError> {
    Ok(column_names(conn, table)?
        .iter()
        .any(|name| name.eq_ignore_ascii_case(column)))
}

#[derive(Debug, Clone)]
struct ForeignKey {
    from: Vec<String>,
    table: String,
    to: Vec<Option<String>>,
    on_update: String,
    on_delete: String,
}

impl ForeignKey {
    fn render(&self) -> String {
        let from = self
            .from
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let to = self.to.iter().flatten().map(|column| quote_ident(column)).collect::<Vec<_>>();
        let mut sql = format!("FOREIGN KEY ({from}) REFERENCES {}", quote_ident(&self.table));
        if to.len() == self.from.len() {
            sql.push_str(&format!(" ({})", to.join(", ")));
        }
        if self.on_update != "NO ACTION" {
            sql.push_str(&format!(" ON UPDATE {}", self.on_update));
        }
        if self.on_delete != "NO ACTION" {
            sql.push_str(&format!(" ON DELETE {}", self.on_delete));
        }
        sql
    }
}

/// Live shape of a table as far as SQLite's pragmas report it. Table-level
/// CHECK constraints are not reported and so do not survive an introspected
/// rebuild; tables that carry them should use [`SchemaStep::RebuildTable`].
struct IntrospectedTable {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
    unique_sets: Vec<Vec<String>>,
}

impl IntrospectedTable {
    fn without_column(mut self, column: &str) -> Result<TableDef, StorageError> {
        if self
            .primary_key
            .iter()
            .any(|name| name.eq_ignore_ascii_case(column))
        {
            return Err(StorageError::InvalidOperation(format!(
                "cannot drop primary key column {}.{column}",
                self.name
            )));
        }
        self.columns
            .retain(|def| !def.name.eq_ignore_ascii_case(column));
        self.foreign_keys.retain(|fk| {
            !fk.from
                .iter()
                .any(|name| name.eq_ignore_ascii_case(column))
        });
        self.unique_sets
            .retain(|set| !set.iter().any(|name| name.eq_ignore_ascii_case(column)));
        Ok(self.into_table_def())
    }

    fn with_renamed_column(mut self, from: &str, to: &str) -> TableDef {
        let rename = |name: &mut String| {
            if name.eq_ignore_ascii_case(from) {
                *name = to.to_string();
            }
        };
        for column in &mut self.columns {
            rename(&mut column.name);
        }
        self.primary_key.iter_mut().for_each(rename);
        for fk in &mut self.foreign_keys {
            fk.from.iter_mut().for_each(rename);
        }
        for set in &mut self.unique_sets {
            set.iter_mut().for_each(rename);
        }
        self.into_table_def()
    }

    fn into_table_def(self) -> TableDef {
        let mut constraints = Vec::new();
        if self.primary_key.len() > 1 {
            constraints.push(format!(
                "PRIMARY KEY ({})",
                self.primary_key
                    .iter()
                    .map(|column| quote_ident(column))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        constraints.extend(self
            .unique_sets
            .iter()
            .map(|set| {
                format!(
                    "UNIQUE ({})",
                    set.iter()
                        .map(|column| quote_ident(column))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }));
        constraints.extend(self.foreign_keys.iter().map(ForeignKey::render));
        TableDef {
            name: self.name,
            columns: self.columns,
            constraints,
        }
    }
}

fn introspect_table(conn: &Connection, table: &str) -> Result<IntrospectedTable, StorageError> {
    let create_sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    let Some(create_sql) = create_sql else {
        return Err(StorageError::SchemaObjectMissing(table.to_string()));
    };
    let autoincrement = create_sql.to_ascii_uppercase().contains("AUTOINCREMENT");

    let mut statement = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;
    let mut columns = Vec::new();
    for row in rows {
        let (name, sql_type, not_null, default_sql, pk) = row?;
        columns.push((
            pk,
            ColumnDef {
                name,
                sql_type: sql_type.unwrap_or_default(),
                not_null: not_null != 0,
                default_sql,
                primary_key: pk > 0,
                autoincrement: false,
                check: None,
            },
        ));
    }
    let mut key_order = columns
        .iter()
        .filter(|(pk, _)| *pk > 0)
        .map(|(pk, column)| (*pk, column.name.clone()))
        .collect::<Vec<_>>();
    key_order.sort();
    let primary_key = key_order.into_iter().map(|(_, name)| name).collect::<Vec<_>>();
    let composite = primary_key.len() > 1;
    let columns = columns
        .into_iter()
        .map(|(_, mut column)| {
            if column.primary_key && composite {
                column.primary_key = false;
            } else if column.primary_key && autoincrement {
                column.autoincrement = true;
            }
            column
        })
        .collect::<Vec<_>>();

    let mut statement =
        conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;
    let mut grouped: BTreeMap<i64, ForeignKey> = BTreeMap::new();
    for row in rows {
        let (id, parent, from, to, on_update, on_delete) = row?;
        let fk = grouped.entry(id).or_insert_with(|| ForeignKey {
            from: Vec::new(),
            table: parent,
            to: Vec::new(),
            on_update,
            on_delete,
        });
        fk.from.push(from);
        fk.to.push(to);
    }

    let mut statement = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
    let unique_indexes = statement
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, origin)| origin == "u")
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    let mut unique_sets = Vec::new();
    for index in unique_indexes {
        let mut statement = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index)))?;
        let set = statement
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<Result<Vec<_>, _>>()?;
        unique_sets.push(set);
    }

    Ok(IntrospectedTable {
        name: table.to_string(),
        columns,
        primary_key,
        foreign_keys: grouped.into_values().collect(),
        unique_sets,
    })
}

/// Rebuild `target.name` into the declared shape via a shadow table: create the
/// shadow, copy rows, drop the original, rename the shadow into place, then
/// recreate the indexes and triggers that still apply. Must run inside a
/// transaction with foreign-key enforcement off.
pub(crate) fn rebuild_table(
    conn: &Connection,
    target: &TableDef,
    copy: &[(String, String)],
    renames: &BTreeMap<String, String>,
) -> Result<(), StorageError> {
    let table = target.name.as_str();
    let old_columns = column_names(conn, table)?;
    if old_columns.is_empty() {
        return Err(StorageError::SchemaObjectMissing(table.to_string()));
    }

    let target_columns = target.column_names();
    let copy_pairs = if copy.is_empty() {
        target_columns
            .iter()
            .filter_map(|column| {
                let source = renames
                    .iter()
                    .find(|(_, to)| to.eq_ignore_ascii_case(column))
                    .map(|(from, _)| from.clone())
                    .unwrap_or_else(|| column.clone());
                old_columns
                    .iter()
                    .any(|old| old.eq_ignore_ascii_case(&source))
                    .then(|| (column.clone(), quote_ident(&source)))
            })
            .collect::<Vec<_>>()
    } else {
        copy.to_vec()
    };

    let dropped = old_columns
        .iter()
        .filter(|old| {
            let mapped = renames
                .iter()
                .find(|(from, _)| from.eq_ignore_ascii_case(old))
                .map(|(_, to)| to.as_str())
                .unwrap_or(old.as_str());
            !target_columns
                .iter()
                .any(|column| column.eq_ignore_ascii_case(mapped))
        })
        .map(|old| old.to_ascii_lowercase())
        .collect::<BTreeSet<_>>();

    let mut statement = conn.prepare(
        "
        SELECT type, name, sql
        FROM sqlite_master
        WHERE tbl_name = ?1 AND type IN ('index', 'trigger') AND sql IS NOT NULL
        ORDER BY type, name
        ",
    )?;
    let dependents = statement
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let shadow = format!("{SHADOW_PREFIX}{table}");
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&shadow)))?;
    conn.execute_batch(&target.render_create(&shadow))?;
    if !copy_pairs.is_empty() {
        let targets = copy_pairs
            .iter()
            .map(|(column, _)| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let sources = copy_pairs
            .iter()
            .map(|(_, expr)| expr.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "INSERT INTO {} ({targets}) SELECT {sources} FROM {}",
            quote_ident(&shadow),
            quote_ident(table)
        ))?;
    }

    // Other tables' triggers may still name this table; the legacy rename
    // leaves them untouched instead of failing on the dropped original.
    conn.execute_batch("PRAGMA legacy_alter_table = ON")?;
    let swapped = conn.execute_batch(&format!(
        "DROP TABLE {table};\nALTER TABLE {shadow} RENAME TO {table};",
        table = quote_ident(table),
        shadow = quote_ident(&shadow)
    ));
    conn.execute_batch("PRAGMA legacy_alter_table = OFF")?;
    swapped?;

    for (kind, name, sql) in dependents {
        let scope = if kind == "trigger" {
            ColumnScope::Qualified(table)
        } else {
            ColumnScope::Any
        };
        if mentions_column(&sql, &dropped, &scope) {
            warn!(event = "rebuild_dependent_dropped", table = %table, kind = %kind, name = %name);
            continue;
        }
        conn.execute_batch(&rewrite_columns(&sql, renames, &scope))?;
    }

    debug!(event = "table_rebuilt", table = %table, dropped = dropped.len(), renamed = renames.len());
    Ok(())
}

enum Token<'a> {
    Ident { raw: &'a str, name: String },
    Other(&'a str),
}

/// Splits SQL into identifiers (bare or quoted) and everything else, leaving
/// string literals intact.
fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;
    let mut other_start = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        let quoted_close = match byte {
            b'"' => Some(b'"'),
            b'`' => Some(b'`'),
            b'[' => Some(b']'),
            _ => None,
        };

        if byte == b'\'' {
            index += 1;
            while index < bytes.len() {
                if bytes[index] == b'\'' {
                    if bytes.get(index + 1) == Some(&b'\'') {
                        index += 2;
                        continue;
                    }
                    break;
                }
                index += 1;
            }
            index = (index + 1).min(bytes.len());
        } else if let Some(close) = quoted_close {
            let start = index;
            index += 1;
            while index < bytes.len() && bytes[index] != close {
                index += 1;
            }
            let end = (index + 1).min(bytes.len());
            if other_start < start {
                tokens.push(Token::Other(&sql[other_start..start]));
            }
            let inner_end = index.min(bytes.len());
            tokens.push(Token::Ident {
                raw: &sql[start..end],
                name: sql[start + 1..inner_end].to_string(),
            });
            index = end;
            other_start = end;
        } else if byte.is_ascii_alphabetic() || byte == b'_' {
            let start = index;
            while index < bytes.len() && (bytes[index].is_ascii_alphanumeric() || bytes[index] == b'_')
            {
                index += 1;
            }
            if other_start < start {
                tokens.push(Token::Other(&sql[other_start..start]));
            }
            tokens.push(Token::Ident {
                raw: &sql[start..index],
                name: sql[start..index].to_string(),
            });
            other_start = index;
        } else {
            index += 1;
        }
    }
    if other_start < bytes.len() {
        tokens.push(Token::Other(&sql[other_start..]));
    }
    tokens
}

/// Which identifiers in a dependent object's SQL can name the rebuilt table's
/// columns. Index SQL only ever does; trigger bodies reach other tables too, so
/// only `NEW.col`, `OLD.col` and `table.col` count there.
enum ColumnScope<'a> {
    Any,
    Qualified(&'a str),
}

fn column_positions(tokens: &[Token<'_>], scope: &ColumnScope<'_>) -> Vec<bool> {
    tokens
        .iter()
        .enumerate()
        .map(|(index, token)| {
            if !matches!(token, Token::Ident { .. }) {
                return false;
            }
            match scope {
                ColumnScope::Any => true,
                ColumnScope::Qualified(table) => {
                    if index < 2 {
                        return false;
                    }
                    let dotted = matches!(&tokens[index - 1], Token::Other(text) if text.trim() == ".");
                    let qualifier = match &tokens[index - 2] {
                        Token::Ident { name, .. } => {
                            name.eq_ignore_ascii_case("new")
                                || name.eq_ignore_ascii_case("old")
                                || name.eq_ignore_ascii_case(table)
                        }
                        Token::Other(_) => false,
                    };
                    dotted && qualifier
                }
            }
        })
        .collect()
}

fn mentions_column(sql: &str, names: &BTreeSet<String>, scope: &ColumnScope<'_>) -> bool {
    if names.is_empty() {
        return false;
    }
    let tokens = tokenize(sql);
    let positions = column_positions(&tokens, scope);
    tokens.iter().zip(positions).any(|(token, is_column)| match token {
        Token::Ident { name, .. } => is_column && names.contains(&name.to_ascii_lowercase()),
        Token::Other(_) => false,
    })
}

fn rewrite_columns(sql: &str, renames: &BTreeMap<String, String>, scope: &ColumnScope<'_>) -> String {
    if renames.is_empty() {
        return sql.to_string();
    }
    let tokens = tokenize(sql);
    let positions = column_positions(&tokens, scope);
    tokens
        .into_iter()
        .zip(positions)
        .map(|(token, is_column)| match token {
            Token::Ident { raw, name } if is_column => renames
                .iter()
                .find(|(from, _)| from.eq_ignore_ascii_case(&name))
                .map(|(_, to)| quote_ident(to))
                .unwrap_or_else(|| raw.to_string()),
            Token::Ident { raw, .. } => raw.to_string(),
            Token::Other(text) => text.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes_table() -> TableDef {
        TableDef::new(
            "notes",
            vec![
                ColumnDef::new("id", "TEXT").primary_key(),
                ColumnDef::new("body", "TEXT").not_null(),
                ColumnDef::new("legacy_flag", "INTEGER")
                    .not_null()
                    .default_sql("0"),
                ColumnDef::new("updated_at", "INTEGER"),
            ],
        )
    }

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("open db");
        apply_steps(
            &conn,
            &[
                SchemaStep::create_table(notes_table()),
                SchemaStep::create_index(IndexDef::new("idx_notes_updated", "notes", &["updated_at"])),
                SchemaStep::create_index(
                    IndexDef::new("idx_notes_flag", "notes", &["legacy_flag"]).partial("legacy_flag = 0"),
                ),
                SchemaStep::Sql {
                    name: "notes audit trigger",
                    sql: "CREATE TABLE IF NOT EXISTS notes_audit (note_id TEXT, body TEXT);
                          CREATE TRIGGER IF NOT EXISTS notes_audit_ins AFTER INSERT ON notes
                          BEGIN INSERT INTO notes_audit (note_id, body) VALUES (NEW.id, NEW.body); END;",
                },
            ],
        )
        .expect("create notes");
        conn.execute(
            "INSERT INTO notes (id, body, legacy_flag, updated_at) VALUES ('n1', 'it''s body', 0, 10)",
            [],
        )
        .expect("seed row");
        conn
    }

    fn index_names(conn: &Connection) -> Vec<String> {
        let mut statement = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'notes' AND sql IS NOT NULL ORDER BY name")
            .expect("prepare");
        statement
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<Vec<String>, _>>()
            .expect("collect")
    }

    #[test]
    fn add_column_tolerates_existing_column() {
        let conn = seeded();
        let step = SchemaStep::add_column("notes", ColumnDef::new("title", "TEXT"));
        step.apply(&conn).expect("first add");
        step.apply(&conn).expect("second add is a no-op");
        assert!(column_exists(&conn, "notes", "title").expect("column check"));
    }

    #[test]
    fn drop_column_rebuild_keeps_rows_and_unrelated_dependents() {
        let conn = seeded();
        SchemaStep::drop_column("notes", "legacy_flag")
            .apply(&conn)
            .expect("drop column");

        assert_eq!(
            column_names(&conn, "notes").expect("columns"),
            vec!["id", "body", "updated_at"]
        );
        let body: String = conn
            .query_row("SELECT body FROM notes WHERE id = 'n1'", [], |row| row.get(0))
            .expect("row survives");
        assert_eq!(body, "it's body");
        assert_eq!(index_names(&conn), vec!["idx_notes_updated"]);

        conn.execute("INSERT INTO notes (id, body) VALUES ('n2', 'second')", [])
            .expect("insert after rebuild");
        let audited: i64 = conn
            .query_row("SELECT COUNT(*) FROM notes_audit WHERE note_id = 'n2'", [], |row| row.get(0))
            .expect("trigger survives");
        assert_eq!(audited, 1);
        assert!(!table_exists(&conn, "_capsync_shadow_notes").expect("shadow gone"));

        SchemaStep::drop_column("notes", "legacy_flag")
            .apply(&conn)
            .expect("repeat drop is a no-op");
    }

    #[test]
    fn rename_column_rewrites_trigger_references() {
        let conn = seeded();
        SchemaStep::rename_column("notes", "body", "content")
            .apply(&conn)
            .expect("rename");
        SchemaStep::rename_column("notes", "body", "content")
            .apply(&conn)
            .expect("repeat rename is a no-op");

        assert!(column_exists(&conn, "notes", "content").expect("check"));
        assert!(!column_exists(&conn, "notes", "body").expect("check"));
        conn.execute("INSERT INTO notes (id, content) VALUES ('n3', 'renamed')", [])
            .expect("insert after rename");
        let audited: String = conn
            .query_row("SELECT body FROM notes_audit WHERE note_id = 'n3'", [], |row| row.get(0))
            .expect("audit row");
        assert_eq!(audited, "renamed");
    }

    #[test]
    fn rename_missing_column_is_an_error() {
        let conn = seeded();
        let err = SchemaStep::rename_column("notes", "nope", "still_nope")
            .apply(&conn)
            .expect_err("missing column");
        assert!(matches!(err, StorageError::SchemaObjectMissing(_)));
    }

    #[test]
    fn dropping_primary_key_is_refused() {
        let conn = seeded();
        let err = SchemaStep::drop_column("notes", "id")
            .apply(&conn)
            .expect_err("pk drop refused");
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[test]
    fn introspected_rebuild_preserves_autoincrement_and_foreign_keys() {
        let conn = Connection::open_in_memory().expect("open db");
        conn.execute_batch(
            "CREATE TABLE parents (id TEXT PRIMARY KEY);
             CREATE TABLE children (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               parent_id TEXT NOT NULL,
               junk TEXT,
               slot INTEGER,
               UNIQUE (parent_id, slot),
               FOREIGN KEY (parent_id) REFERENCES parents (id) ON DELETE CASCADE
             );",
        )
        .expect("schema");
        SchemaStep::drop_column("children", "junk")
            .apply(&conn)
            .expect("drop junk");

        let sql: String = conn
            .query_row("SELECT sql FROM sqlite_master WHERE name = 'children'", [], |row| row.get(0))
            .expect("sql");
        assert!(sql.contains("AUTOINCREMENT"));
        assert!(sql.contains("ON DELETE CASCADE"));
        assert!(sql.contains("UNIQUE (\"parent_id\", \"slot\")"));
    }

    #[test]
    fn fingerprint_changes_with_steps_not_with_revert() {
        let base = Revision::new(1, "notes", vec![SchemaStep::create_table(notes_table())]);
        let with_revert = Revision::new(1, "notes", vec![SchemaStep::create_table(notes_table())])
            .with_revert(vec![SchemaStep::drop_table("notes")]);
        let edited = Revision::new(
            1,
            "notes",
            vec![
                SchemaStep::create_table(notes_table()),
                SchemaStep::add_column("notes", ColumnDef::new("title", "TEXT")),
            ],
        );
        assert_eq!(base.fingerprint(), with_revert.fingerprint());
        assert_ne!(base.fingerprint(), edited.fingerprint());
    }

    #[test]
    fn identifier_rewrite_skips_string_literals() {
        let mut renames = BTreeMap::new();
        renames.insert("body".to_string(), "content".to_string());
        let rewritten = rewrite_columns(
            "CREATE INDEX idx ON notes (body) WHERE [body] != 'body'",
            &renames,
            &ColumnScope::Any,
        );
        assert_eq!(
            rewritten,
            "CREATE INDEX idx ON notes (\"content\") WHERE \"content\" != 'body'"
        );
    }

    #[test]
    fn trigger_rewrite_only_touches_qualified_columns() {
        let mut renames = BTreeMap::new();
        renames.insert("body".to_string(), "content".to_string());
        let rewritten = rewrite_columns(
            "INSERT INTO audit (body) VALUES (NEW.body)",
            &renames,
            &ColumnScope::Qualified("notes"),
        );
        assert_eq!(rewritten, "INSERT INTO audit (body) VALUES (NEW.\"content\")");
    }
}
