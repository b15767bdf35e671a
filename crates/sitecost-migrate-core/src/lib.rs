//! Domain model and pure stages of the user-scope to company-scope migration.
//!
//! Nothing in this crate touches the file system or a real database: the
//! storage collaborator is expressed as the [`TableStore`] and
//! [`FunctionRegistry`] traits so every stage can be exercised against
//! [`MemoryTableStore`].

use time::OffsetDateTime;

pub mod entity;
pub mod report;
pub mod resolver;
pub mod store;
pub mod transform;

pub use entity::{
    apply_legacy_work_names, Contractor, EntityKind, EntityRecord, Expense, Item, Project, Work,
    WorkStatus, DEPRECATED_CONTRACTOR_ATTRS, LEGACY_WORK_ATTRS, MIGRATED_AT_ATTR,
    MIGRATED_FROM_ATTR, OWNER_ATTR, TENANT_ATTR,
};
pub use report::{
    DecommissionReport, DecommissionResult, DecommissionSummary, MigrationMode,
    MigrationRunReport, MigrationSummary, MismatchRecord, MissingRecord, ResourceKind,
    TableMigrationResult, TableValidationResult, ValidationReport, ValidationSummary,
};
pub use resolver::{Resolution, ScopeMapping};
pub use store::{
    scan_all, FunctionRegistry, ItemKey, KeySchema, MemoryTableStore, ScanPage, SecondaryIndex,
    StoreError, TableDefinition, TableDescription, TableStore,
};
pub use transform::{
    attribute_differences, entity_id_of, owner_of, transform, ProvenanceStamp, TARGET_ONLY_ATTRS,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecordError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Format a timestamp the way every report and stamp in this workspace does.
///
/// # Errors
/// Returns [`RecordError::Validation`] when the timestamp cannot be rendered as RFC 3339.
pub fn rfc3339(value: OffsetDateTime) -> Result<String, RecordError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RecordError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// # Errors
/// Returns [`RecordError::Validation`] when the current time cannot be formatted.
pub fn now_rfc3339() -> Result<String, RecordError> {
    rfc3339(OffsetDateTime::now_utc())
}

/// File-name safe rendering of an RFC 3339 timestamp (`:` and `.` replaced).
#[must_use]
pub fn timestamp_suffix(timestamp: &str) -> String {
    timestamp.replace([':', '.'], "-")
}
