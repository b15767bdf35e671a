//! SQLite-backed implementation of the table store and function registry.
//!
//! Every logical table lives in `kv_items`, keyed by `(table_name, partition_value,
//! sort_value)`; an absent sort key is stored as the empty string, which sorts before
//! every real (non-empty) sort key.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sitecost_migrate_core::{
    now_rfc3339, FunctionRegistry, Item, ItemKey, KeySchema, ScanPage, SecondaryIndex,
    StoreError, TableDefinition, TableDescription, TableStore,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const BILLING_MODE: &str = "PAY_PER_REQUEST";
const ACTIVE_STATUS: &str = "ACTIVE";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_tables (
  table_name TEXT PRIMARY KEY,
  key_schema_json TEXT NOT NULL,
  secondary_indexes_json TEXT NOT NULL,
  billing_mode TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_items (
  table_name TEXT NOT NULL,
  partition_value TEXT NOT NULL CHECK (length(partition_value) > 0),
  sort_value TEXT NOT NULL,
  item_json TEXT NOT NULL,
  PRIMARY KEY (table_name, partition_value, sort_value),
  FOREIGN KEY (table_name) REFERENCES kv_tables(table_name) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS compute_functions (
  function_name TEXT PRIMARY KEY,
  registered_at TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed table store and configure required runtime pragmas.
    /// Missing parent directories are created.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for database {}", path.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.conn
                .execute_batch(MIGRATION_002_SQL)
                .context("failed to apply migration 002 (compute_functions)")?;
            record_schema_version(&self.conn, 2)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "kv_tables")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration 001 (kv_tables, kv_items)")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if !table_exists(&self.conn, "kv_items")? {
            return Err(anyhow!("database schema is invalid: kv_tables exists without kv_items"));
        }

        // Tables created before migrations were tracked.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "compute_functions")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn load_definition(&self, table: &str) -> Result<Option<(TableDefinition, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT key_schema_json, secondary_indexes_json, created_at
                 FROM kv_tables WHERE table_name = ?1",
                params![table],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load table definition for {table}"))?;

        let Some((key_schema_json, indexes_json, created_at)) = row else {
            return Ok(None);
        };
        let key_schema: KeySchema = serde_json::from_str(&key_schema_json)
            .with_context(|| format!("invalid key schema stored for {table}"))?;
        let secondary_indexes: Vec<SecondaryIndex> = serde_json::from_str(&indexes_json)
            .with_context(|| format!("invalid secondary indexes stored for {table}"))?;

        Ok(Some((
            TableDefinition { table_name: table.to_string(), key_schema, secondary_indexes },
            created_at,
        )))
    }

    fn require_definition(&self, table: &str) -> Result<(TableDefinition, String)> {
        self.load_definition(table)?
            .ok_or_else(|| anyhow::Error::from(StoreError::TableNotFound(table.to_string())))
    }

    fn create_table_inner(&self, definition: &TableDefinition) -> Result<()> {
        if self.load_definition(&definition.table_name)?.is_some() {
            return Err(StoreError::TableExists(definition.table_name.clone()).into());
        }
        let key_schema_json = serde_json::to_string(&definition.key_schema)?;
        let indexes_json = serde_json::to_string(&definition.secondary_indexes)?;
        let created_at = now_rfc3339().context("failed to stamp table creation time")?;
        self.conn
            .execute(
                "INSERT INTO kv_tables(table_name, key_schema_json, secondary_indexes_json, billing_mode, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    definition.table_name,
                    key_schema_json,
                    indexes_json,
                    BILLING_MODE,
                    ACTIVE_STATUS,
                    created_at
                ],
            )
            .with_context(|| format!("failed to create table {}", definition.table_name))?;
        Ok(())
    }

    fn describe_table_inner(&self, table: &str) -> Result<TableDescription> {
        let (definition, created_at) = self.require_definition(table)?;
        let (billing_mode, status): (String, String) = self
            .conn
            .query_row(
                "SELECT billing_mode, status FROM kv_tables WHERE table_name = ?1",
                params![table],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("failed to read table status for {table}"))?;
        let item_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM kv_items WHERE table_name = ?1",
                params![table],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count items in {table}"))?;

        Ok(TableDescription {
            table_name: definition.table_name,
            key_schema: definition.key_schema,
            secondary_indexes: definition.secondary_indexes,
            billing_mode,
            item_count: u64::try_from(item_count).unwrap_or_default(),
            status,
            creation_time: created_at,
        })
    }

    fn list_tables_inner(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_name FROM kv_tables ORDER BY table_name ASC")
            .context("failed to prepare table listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn scan_page_inner(
        &self,
        table: &str,
        exclusive_start_key: Option<&ItemKey>,
        limit: usize,
    ) -> Result<ScanPage> {
        self.require_definition(table)?;
        let limit = limit.max(1);
        let fetch = i64::try_from(limit + 1).context("scan page limit is too large")?;

        let (start_partition, start_sort) = match exclusive_start_key {
            Some(key) => (Some(key.partition.as_str()), key.sort.as_deref().unwrap_or_default()),
            None => (None, ""),
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT partition_value, sort_value, item_json FROM kv_items
                 WHERE table_name = ?1
                   AND (?2 IS NULL OR partition_value > ?2 OR (partition_value = ?2 AND sort_value > ?3))
                 ORDER BY partition_value ASC, sort_value ASC
                 LIMIT ?4",
            )
            .context("failed to prepare scan query")?;
        let rows = stmt.query_map(params![table, start_partition, start_sort, fetch], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (partition, sort, item_json) = row?;
            entries.push((item_key(partition, sort), decode_item(table, &item_json)?));
        }

        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let last_evaluated_key =
            if has_more { entries.last().map(|(key, _)| key.clone()) } else { None };

        Ok(ScanPage { items: entries.into_iter().map(|(_, item)| item).collect(), last_evaluated_key })
    }

    fn get_item_inner(&self, table: &str, key: &ItemKey) -> Result<Option<Item>> {
        self.require_definition(table)?;
        let item_json = self
            .conn
            .query_row(
                "SELECT item_json FROM kv_items
                 WHERE table_name = ?1 AND partition_value = ?2 AND sort_value = ?3",
                params![table, key.partition, key.sort.as_deref().unwrap_or_default()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read item {key} from {table}"))?;

        item_json.map(|raw| decode_item(table, &raw)).transpose()
    }

    fn query_partition_inner(&self, table: &str, partition: &str) -> Result<Vec<Item>> {
        self.require_definition(table)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_json FROM kv_items
                 WHERE table_name = ?1 AND partition_value = ?2
                 ORDER BY sort_value ASC",
            )
            .context("failed to prepare partition query")?;
        let rows = stmt.query_map(params![table, partition], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(decode_item(table, &row?)?);
        }
        Ok(items)
    }

    fn put_item_if_absent_inner(&self, table: &str, item: &Item) -> Result<()> {
        let (definition, _) = self.require_definition(table)?;
        let key = definition.key_schema.key_of(item)?;
        let item_json = serde_json::to_string(item)
            .with_context(|| format!("failed to encode item {key} for {table}"))?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO kv_items(table_name, partition_value, sort_value, item_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![table, key.partition, key.sort.as_deref().unwrap_or_default(), item_json],
            )
            .with_context(|| format!("failed to write item {key} to {table}"))?;

        if inserted == 0 {
            return Err(StoreError::ConditionFailed { table: table.to_string(), key: key.to_string() }
                .into());
        }
        Ok(())
    }

    fn delete_table_inner(&self, table: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM kv_tables WHERE table_name = ?1", params![table])
            .with_context(|| format!("failed to delete table {table}"))?;
        if deleted == 0 {
            return Err(StoreError::TableNotFound(table.to_string()).into());
        }
        Ok(())
    }

    fn register_function_inner(&self, name: &str) -> Result<()> {
        let registered_at = now_rfc3339().context("failed to stamp function registration")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO compute_functions(function_name, registered_at) VALUES (?1, ?2)",
                params![name, registered_at],
            )
            .with_context(|| format!("failed to register function {name}"))?;
        Ok(())
    }

    fn list_functions_inner(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT function_name FROM compute_functions ORDER BY function_name ASC")
            .context("failed to prepare function listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn delete_function_inner(&self, name: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM compute_functions WHERE function_name = ?1", params![name])
            .with_context(|| format!("failed to delete function {name}"))?;
        if deleted == 0 {
            return Err(StoreError::FunctionNotFound(name.to_string()).into());
        }
        Ok(())
    }
}

impl TableStore for SqliteStore {
    fn create_table(&mut self, definition: &TableDefinition) -> Result<(), StoreError> {
        self.create_table_inner(definition).map_err(into_store_error)
    }

    fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError> {
        self.describe_table_inner(table).map_err(into_store_error)
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.list_tables_inner().map_err(into_store_error)
    }

    fn scan_page(
        &self,
        table: &str,
        exclusive_start_key: Option<&ItemKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        self.scan_page_inner(table, exclusive_start_key, limit).map_err(into_store_error)
    }

    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        self.get_item_inner(table, key).map_err(into_store_error)
    }

    fn query_partition(&self, table: &str, partition: &str) -> Result<Vec<Item>, StoreError> {
        self.query_partition_inner(table, partition).map_err(into_store_error)
    }

    fn put_item_if_absent(&mut self, table: &str, item: &Item) -> Result<(), StoreError> {
        self.put_item_if_absent_inner(table, item).map_err(into_store_error)
    }

    fn delete_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.delete_table_inner(table).map_err(into_store_error)
    }
}

impl FunctionRegistry for SqliteStore {
    fn register_function(&mut self, name: &str) -> Result<(), StoreError> {
        self.register_function_inner(name).map_err(into_store_error)
    }

    fn list_functions(&self) -> Result<Vec<String>, StoreError> {
        self.list_functions_inner().map_err(into_store_error)
    }

    fn delete_function(&mut self, name: &str) -> Result<(), StoreError> {
        self.delete_function_inner(name).map_err(into_store_error)
    }
}

/// Surface typed store conditions unchanged; everything else is a backend failure.
fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_error) => store_error,
        Err(other) => StoreError::Backend(format!("{other:#}")),
    }
}

fn item_key(partition: String, sort: String) -> ItemKey {
    ItemKey { partition, sort: if sort.is_empty() { None } else { Some(sort) } }
}

fn decode_item(table: &str, raw: &str) -> Result<Item> {
    serde_json::from_str(raw).with_context(|| format!("invalid item json stored in {table}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "kv_tables")? {
        return Ok((0, false));
    }

    if !table_exists(conn, "kv_items")? {
        return Err(anyhow!("database schema is invalid: kv_tables exists without kv_items"));
    }

    if table_exists(conn, "compute_functions")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339().context("failed to stamp schema migration")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
