//! Migration pipeline stages and the [`MigrationApi`] facade used by the `scm` binary.
//!
//! Stages are generic over [`sitecost_migrate_core::TableStore`]; the facade opens the
//! SQLite store once per operation.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sitecost_migrate_core::{
    now_rfc3339, scan_all, DecommissionReport, FunctionRegistry, Item, MigrationMode,
    MigrationRunReport, StoreError, TableStore, ValidationReport,
};
use sitecost_migrate_store_sqlite::{SchemaStatus, SqliteStore};

pub mod config;
pub mod decommission;
pub mod driver;
pub mod ledger;
pub mod output;
pub mod snapshot;
pub mod validator;

pub use config::{MigrationConfig, TablePlan};
pub use decommission::decommission;
pub use driver::{run_migration, DriverOptions, MigrationDriver, RecordSource};
pub use ledger::TenantLedger;
pub use output::{write_json_once, WrittenFile};
pub use snapshot::{
    backup_tables, import_items, load_snapshot, read_import_file, snapshot_table, BackupResult,
    BackupSummary, ImportSummary, SnapshotDirectory, TableSnapshot,
};
pub use validator::{run_validation, validate_table};

pub const REPORT_CONTRACT_VERSION: &str = "report.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub report_path: String,
    pub report: MigrationRunReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub report_path: String,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitResult {
    pub created_tables: Vec<String>,
    pub existing_tables: Vec<String>,
    pub registered_functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub table: String,
    pub created_table: bool,
    pub imported_items: usize,
    pub skipped_existing_items: usize,
}

#[derive(Debug, Clone)]
pub struct MigrationApi {
    db_path: PathBuf,
    config: MigrationConfig,
}

impl MigrationApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: MigrationConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn driver_options(&self, mode: MigrationMode, strict: bool) -> DriverOptions {
        DriverOptions { mode, strict, page_size: self.config.scan_page_size }
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// Create every configured table that does not exist yet and register the legacy handlers.
    ///
    /// # Errors
    /// Returns an error when a table or handler cannot be written.
    pub fn init_store(&self) -> Result<InitResult> {
        let mut store = self.open_store()?;
        let mut created_tables = Vec::new();
        let mut existing_tables = Vec::new();
        for definition in self.config.table_definitions() {
            match store.create_table(&definition) {
                Ok(()) => created_tables.push(definition.table_name),
                Err(StoreError::TableExists(name)) => existing_tables.push(name),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to create {}", definition.table_name))
                }
            }
        }
        for function in &self.config.decommission_functions {
            store.register_function(function)?;
        }
        Ok(InitResult {
            created_tables,
            existing_tables,
            registered_functions: store.list_functions()?,
        })
    }

    /// Snapshot the source tables and the membership table under `out_root`.
    ///
    /// # Errors
    /// Returns an error when the backup directory or summary cannot be written.
    pub fn backup(&self, out_root: &Path) -> Result<BackupSummary> {
        let store = self.open_store()?;
        backup_tables(
            &store,
            &self.config.backup_tables(),
            out_root,
            self.config.scan_page_size,
            &now_rfc3339()?,
        )
    }

    /// # Errors
    /// Returns an error when the snapshot directory cannot be opened or the report cannot
    /// be written.
    pub fn migrate(
        &self,
        options: DriverOptions,
        from_snapshot: Option<&Path>,
        report_dir: &Path,
    ) -> Result<MigrationOutcome> {
        let mut store = self.open_store()?;
        let directory = from_snapshot.map(SnapshotDirectory::open).transpose()?;
        let source = match &directory {
            Some(directory) => RecordSource::Snapshot(directory),
            None => RecordSource::Live,
        };
        let (report, written) = run_migration(&mut store, &self.config, options, source, report_dir)?;
        Ok(MigrationOutcome { report_path: written.path.display().to_string(), report })
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or the report cannot be written.
    pub fn validate(&self, report_dir: &Path) -> Result<ValidationOutcome> {
        let store = self.open_store()?;
        let (report, written) = run_validation(&store, &self.config, report_dir)?;
        Ok(ValidationOutcome { report_path: written.path.display().to_string(), report })
    }

    /// # Errors
    /// Returns an error when the store cannot be opened.
    pub fn decommission(&self, mode: MigrationMode) -> Result<DecommissionReport> {
        let mut store = self.open_store()?;
        Ok(decommission(
            &mut store,
            &self.config.decommission_functions,
            &self.config.decommission_tables(),
            mode,
            now_rfc3339()?,
        ))
    }

    /// Load items from a JSON array or a snapshot file into `table`, skipping existing keys.
    /// A missing table is created from the snapshot's metadata when the file is a snapshot.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, the table is unknown and cannot be
    /// created, or a write fails.
    pub fn import(&self, table: &str, in_file: &Path) -> Result<ImportResult> {
        let mut store = self.open_store()?;
        let file = read_import_file(in_file)?;

        let mut created_table = false;
        if let Err(StoreError::TableNotFound(_)) = store.describe_table(table) {
            let snapshot = file.snapshot.as_ref().ok_or_else(|| {
                anyhow!("table {table} does not exist; create it with `store init` or import a snapshot")
            })?;
            store.create_table(&snapshot.metadata.table_definition(table)?)?;
            created_table = true;
        }

        let summary = import_items(&mut store, table, &file.items, true)?;
        Ok(ImportResult {
            table: table.to_string(),
            created_table,
            imported_items: summary.imported_items,
            skipped_existing_items: summary.skipped_existing_items,
        })
    }

    /// # Errors
    /// Returns an error when the table does not exist or cannot be read.
    pub fn scan(&self, table: &str) -> Result<Vec<Item>> {
        let store = self.open_store()?;
        scan_all(&store, table, self.config.scan_page_size)
            .with_context(|| format!("failed to scan {table}"))
    }

    /// # Errors
    /// Propagates [`TenantLedger::create_expense`] failures.
    pub fn add_expense(&self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut store = self.open_store()?;
        TenantLedger::new(&mut store, &self.config).create_expense(company_id, attributes)
    }

    /// # Errors
    /// Propagates [`TenantLedger::create_project`] failures.
    pub fn add_project(&self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut store = self.open_store()?;
        TenantLedger::new(&mut store, &self.config).create_project(company_id, attributes)
    }

    /// # Errors
    /// Propagates [`TenantLedger::create_contractor`] failures.
    pub fn add_contractor(&self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut store = self.open_store()?;
        TenantLedger::new(&mut store, &self.config).create_contractor(company_id, attributes)
    }

    /// # Errors
    /// Propagates [`TenantLedger::create_work`] failures.
    pub fn add_work(&self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut store = self.open_store()?;
        TenantLedger::new(&mut store, &self.config).create_work(company_id, attributes)
    }
}
