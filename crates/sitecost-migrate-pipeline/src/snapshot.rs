//! Point-in-time table snapshots: capture, backup directories, verified reload and import.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sitecost_migrate_core::{
    scan_all, timestamp_suffix, Item, KeySchema, SecondaryIndex, StoreError, TableDefinition,
    TableDescription, TableStore,
};

use crate::output::{file_sha256, read_json, write_json_once};

pub const BACKUP_SUMMARY_FILE: &str = "backup-summary.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyElement {
    pub attribute_name: String,
    pub key_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    pub attribute_name: String,
    pub attribute_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub index_name: String,
    pub key_schema: Vec<KeyElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub key_schema: Vec<KeyElement>,
    pub attribute_definitions: Vec<AttributeDefinition>,
    pub secondary_indexes: Vec<IndexMetadata>,
    pub billing_mode: String,
    pub item_count: u64,
    pub status: String,
    pub creation_time: String,
}

impl SnapshotMetadata {
    #[must_use]
    pub fn from_description(description: &TableDescription) -> Self {
        let mut attribute_types = BTreeMap::new();
        for (attribute, _) in description.key_schema.elements() {
            attribute_types.insert(attribute, "S");
        }
        for index in &description.secondary_indexes {
            for (attribute, _) in index.key_schema.elements() {
                attribute_types.insert(attribute, "S");
            }
        }

        Self {
            key_schema: key_elements(&description.key_schema),
            attribute_definitions: attribute_types
                .into_iter()
                .map(|(attribute_name, attribute_type)| AttributeDefinition {
                    attribute_name,
                    attribute_type: attribute_type.to_string(),
                })
                .collect(),
            secondary_indexes: description
                .secondary_indexes
                .iter()
                .map(|index| IndexMetadata {
                    index_name: index.index_name.clone(),
                    key_schema: key_elements(&index.key_schema),
                })
                .collect(),
            billing_mode: description.billing_mode.clone(),
            item_count: description.item_count,
            status: description.status.clone(),
            creation_time: description.creation_time.clone(),
        }
    }

    /// Rebuild the table layout recorded in this snapshot.
    ///
    /// # Errors
    /// Returns an error when the key schema has no `HASH` element.
    pub fn table_definition(&self, table_name: &str) -> Result<TableDefinition> {
        let secondary_indexes = self
            .secondary_indexes
            .iter()
            .map(|index| {
                Ok(SecondaryIndex {
                    index_name: index.index_name.clone(),
                    key_schema: key_schema_from_elements(&index.key_schema)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TableDefinition {
            table_name: table_name.to_string(),
            key_schema: key_schema_from_elements(&self.key_schema)?,
            secondary_indexes,
        })
    }
}

fn key_elements(schema: &KeySchema) -> Vec<KeyElement> {
    schema
        .elements()
        .into_iter()
        .map(|(attribute_name, key_type)| KeyElement { attribute_name, key_type: key_type.to_string() })
        .collect()
}

fn key_schema_from_elements(elements: &[KeyElement]) -> Result<KeySchema> {
    let find = |key_type: &str| {
        elements
            .iter()
            .find(|element| element.key_type == key_type)
            .map(|element| element.attribute_name.as_str())
    };
    let partition = find("HASH").ok_or_else(|| anyhow!("key schema has no HASH element"))?;
    Ok(KeySchema::new(partition, find("RANGE")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub table_name: String,
    pub backup_timestamp: String,
    pub metadata: SnapshotMetadata,
    pub record_count: u64,
    pub items: Vec<Item>,
}

/// Read a whole table and its metadata. Pagination stays internal.
///
/// # Errors
/// Returns the store error when the table cannot be described or scanned.
pub fn snapshot_table<S: TableStore + ?Sized>(
    store: &S,
    table: &str,
    page_size: usize,
    backup_timestamp: &str,
) -> Result<TableSnapshot, StoreError> {
    let description = store.describe_table(table)?;
    let items = scan_all(store, table, page_size)?;
    Ok(TableSnapshot {
        table_name: table.to_string(),
        backup_timestamp: backup_timestamp.to_string(),
        metadata: SnapshotMetadata::from_description(&description),
        record_count: items.len() as u64,
        items,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub table_name: String,
    pub success: bool,
    pub record_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub backup_timestamp: String,
    pub directory: String,
    pub total_tables: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub total_records: u64,
    pub results: Vec<BackupResult>,
}

impl BackupSummary {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failed_backups == 0
    }
}

/// Snapshot every table into a fresh `backup-<timestamp>` directory under `out_root`.
///
/// A table that cannot be read is recorded as failed; the remaining tables still run.
///
/// # Errors
/// Returns an error only when the backup directory or the summary cannot be written.
pub fn backup_tables<S: TableStore + ?Sized>(
    store: &S,
    tables: &[String],
    out_root: &Path,
    page_size: usize,
    backup_timestamp: &str,
) -> Result<BackupSummary> {
    let directory = out_root.join(format!("backup-{}", timestamp_suffix(backup_timestamp)));
    std::fs::create_dir_all(out_root)
        .with_context(|| format!("failed to create backup root {}", out_root.display()))?;
    std::fs::create_dir(&directory)
        .with_context(|| format!("backup directory already exists or cannot be created: {}", directory.display()))?;

    let mut results = Vec::with_capacity(tables.len());
    for table in tables {
        let result = match backup_one(store, table, &directory, page_size, backup_timestamp) {
            Ok(result) => {
                tracing::info!(table = %table, records = result.record_count, "table snapshot written");
                result
            }
            Err(err) => {
                tracing::error!(table = %table, error = %format!("{err:#}"), "table snapshot failed");
                BackupResult {
                    table_name: table.clone(),
                    success: false,
                    record_count: 0,
                    file: None,
                    sha256: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        results.push(result);
    }

    let successful_backups = results.iter().filter(|result| result.success).count() as u64;
    let summary = BackupSummary {
        backup_timestamp: backup_timestamp.to_string(),
        directory: directory.display().to_string(),
        total_tables: results.len() as u64,
        successful_backups,
        failed_backups: results.len() as u64 - successful_backups,
        total_records: results.iter().map(|result| result.record_count).sum(),
        results,
    };
    write_json_once(&directory, BACKUP_SUMMARY_FILE, &summary)?;
    Ok(summary)
}

fn backup_one<S: TableStore + ?Sized>(
    store: &S,
    table: &str,
    directory: &Path,
    page_size: usize,
    backup_timestamp: &str,
) -> Result<BackupResult> {
    let snapshot = snapshot_table(store, table, page_size, backup_timestamp)
        .with_context(|| format!("failed to snapshot {table}"))?;
    let file_name = format!("{table}.json");
    let written = write_json_once(directory, &file_name, &snapshot)?;
    Ok(BackupResult {
        table_name: table.to_string(),
        success: true,
        record_count: snapshot.record_count,
        file: Some(file_name),
        sha256: Some(written.sha256),
        error: None,
    })
}

/// # Errors
/// Returns an error when the file cannot be read or is not a table snapshot.
pub fn load_snapshot(path: &Path) -> Result<TableSnapshot> {
    let snapshot: TableSnapshot = read_json(path)?;
    if snapshot.record_count != snapshot.items.len() as u64 {
        return Err(anyhow!(
            "snapshot {} declares {} records but holds {}",
            path.display(),
            snapshot.record_count,
            snapshot.items.len()
        ));
    }
    Ok(snapshot)
}

/// A backup directory opened through its summary, for consuming snapshots offline.
#[derive(Debug, Clone)]
pub struct SnapshotDirectory {
    root: PathBuf,
    summary: BackupSummary,
}

impl SnapshotDirectory {
    /// # Errors
    /// Returns an error when `backup-summary.json` is missing or malformed.
    pub fn open(root: &Path) -> Result<Self> {
        let summary = read_json(&root.join(BACKUP_SUMMARY_FILE))
            .with_context(|| format!("{} is not a backup directory", root.display()))?;
        Ok(Self { root: root.to_path_buf(), summary })
    }

    #[must_use]
    pub fn summary(&self) -> &BackupSummary {
        &self.summary
    }

    /// Load one table's snapshot after checking it against the recorded digest.
    ///
    /// # Errors
    /// Returns an error when the table was not backed up successfully, the file digest
    /// differs from the summary, or the file cannot be parsed.
    pub fn load_table(&self, table: &str) -> Result<TableSnapshot> {
        let result = self
            .summary
            .results
            .iter()
            .find(|result| result.table_name == table)
            .ok_or_else(|| anyhow!("backup has no snapshot for {table}"))?;
        if !result.success {
            return Err(anyhow!(
                "backup of {table} failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        let file = result.file.as_deref().ok_or_else(|| anyhow!("backup of {table} has no file"))?;
        let path = self.root.join(file);

        if let Some(expected) = &result.sha256 {
            let actual = file_sha256(&path)?;
            if &actual != expected {
                return Err(anyhow!(
                    "snapshot digest mismatch for {table}: expected {expected}, got {actual}"
                ));
            }
        }
        load_snapshot(&path)
    }
}

/// Items to import plus the snapshot they came from, if the file was one.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportFile {
    pub snapshot: Option<TableSnapshot>,
    pub items: Vec<Item>,
}

/// Accept either a bare JSON array of items or a table snapshot file.
///
/// # Errors
/// Returns an error when the file is neither shape.
pub fn read_import_file(path: &Path) -> Result<ImportFile> {
    let value: Value = read_json(path)?;
    match value {
        Value::Array(values) => {
            let items = values
                .into_iter()
                .enumerate()
                .map(|(index, value)| match value {
                    Value::Object(item) => Ok(item),
                    other => Err(anyhow!("element {index} of {} is not an object: {other}", path.display())),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ImportFile { snapshot: None, items })
        }
        Value::Object(_) => {
            let snapshot: TableSnapshot = serde_json::from_value(value)
                .with_context(|| format!("{} is not a table snapshot", path.display()))?;
            Ok(ImportFile { items: snapshot.items.clone(), snapshot: Some(snapshot) })
        }
        other => Err(anyhow!("{} must hold an array or a snapshot, found {other}", path.display())),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_items: usize,
    pub skipped_existing_items: usize,
}

/// Insert items with insert-if-absent semantics.
///
/// # Errors
/// Returns an error on the first write failure, or on an existing key when
/// `skip_existing` is false.
pub fn import_items<S: TableStore + ?Sized>(
    store: &mut S,
    table: &str,
    items: &[Item],
    skip_existing: bool,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for item in items {
        match store.put_item_if_absent(table, item) {
            Ok(()) => summary.imported_items += 1,
            Err(StoreError::ConditionFailed { .. }) if skip_existing => {
                summary.skipped_existing_items += 1;
            }
            Err(err) => {
                return Err(anyhow::Error::from(err).context(format!("failed to import into {table}")))
            }
        }
    }
    Ok(summary)
}
