//! Report documents written by the migration, validation and decommission runs.
//!
//! Field names are camelCase on the wire; the JSON schemas under
//! `contracts/v1/schemas/` describe the same shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    DryRun,
    Execute,
}

impl MigrationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Execute => "execute",
        }
    }

    #[must_use]
    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }
}

/// Counters for one source table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableMigrationResult {
    pub table: String,
    pub total_records: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Records whose owner had no membership and became a self-named tenant.
    pub fallback_mappings: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableMigrationResult {
    #[must_use]
    pub fn new(table: &str) -> Self {
        Self { table: table.to_string(), ..Self::default() }
    }

    /// A table whose records could not be loaded at all.
    #[must_use]
    pub fn failed(table: &str, error: String) -> Self {
        Self { table: table.to_string(), error: Some(error), ..Self::default() }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub total_records: u64,
    pub total_migrated: u64,
    pub total_skipped: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRunReport {
    pub mode: MigrationMode,
    pub timestamp: String,
    pub results: Vec<TableMigrationResult>,
    pub summary: MigrationSummary,
}

impl MigrationRunReport {
    #[must_use]
    pub fn from_results(mode: MigrationMode, timestamp: String, results: Vec<TableMigrationResult>) -> Self {
        let mut summary = MigrationSummary::default();
        for result in &results {
            summary.total_records += result.total_records;
            summary.total_migrated += result.migrated;
            summary.total_skipped += result.skipped;
            summary.total_errors += result.errors;
        }
        Self { mode, timestamp, results, summary }
    }

    /// `true` when no record errored and every table could be read.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.summary.total_errors == 0 && !self.results.iter().any(TableMigrationResult::is_failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MissingRecord {
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MismatchRecord {
    pub record_id: String,
    pub company_id: String,
    /// Source attributes whose value differs in the migrated copy.
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableValidationResult {
    pub table: String,
    pub total_source: u64,
    pub found: u64,
    pub missing: u64,
    pub mismatch: u64,
    pub missing_records: Vec<MissingRecord>,
    pub mismatch_records: Vec<MismatchRecord>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableValidationResult {
    #[must_use]
    pub fn new(table: &str) -> Self {
        Self { table: table.to_string(), ..Self::default() }
    }

    #[must_use]
    pub fn failed(table: &str, error: String) -> Self {
        Self { table: table.to_string(), success: false, error: Some(error), ..Self::default() }
    }

    pub fn record_missing(&mut self, record: MissingRecord) {
        self.missing += 1;
        self.missing_records.push(record);
    }

    pub fn record_mismatch(&mut self, record: MismatchRecord) {
        self.mismatch += 1;
        self.mismatch_records.push(record);
    }

    /// Seal the result once every source record has been checked.
    pub fn finish(&mut self) {
        self.success = self.error.is_none() && self.missing == 0 && self.mismatch == 0;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub total_source: u64,
    pub total_found: u64,
    pub total_missing: u64,
    pub total_mismatch: u64,
    pub all_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub timestamp: String,
    pub results: Vec<TableValidationResult>,
    pub summary: ValidationSummary,
}

impl ValidationReport {
    #[must_use]
    pub fn from_results(timestamp: String, results: Vec<TableValidationResult>) -> Self {
        let mut summary = ValidationSummary { all_success: true, ..ValidationSummary::default() };
        for result in &results {
            summary.total_source += result.total_source;
            summary.total_found += result.found;
            summary.total_missing += result.missing;
            summary.total_mismatch += result.mismatch;
            summary.all_success &= result.success;
        }
        Self { timestamp, results, summary }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Function,
    Table,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionResult {
    pub kind: ResourceKind,
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionSummary {
    pub functions_deleted: u64,
    pub tables_deleted: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionReport {
    pub mode: MigrationMode,
    pub timestamp: String,
    pub results: Vec<DecommissionResult>,
    pub summary: DecommissionSummary,
}

impl DecommissionReport {
    #[must_use]
    pub fn from_results(mode: MigrationMode, timestamp: String, results: Vec<DecommissionResult>) -> Self {
        let mut summary = DecommissionSummary::default();
        for result in &results {
            match (result.success, result.kind) {
                (false, _) => summary.failures += 1,
                (true, ResourceKind::Function) => summary.functions_deleted += 1,
                (true, ResourceKind::Table) => summary.tables_deleted += 1,
            }
        }
        Self { mode, timestamp, results, summary }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.summary.failures == 0
    }
}
