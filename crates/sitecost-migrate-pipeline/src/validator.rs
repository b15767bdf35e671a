//! Post-migration validator: proves every source record has an equal tenant-scoped copy.

use std::path::Path;

use anyhow::{Context, Result};
use sitecost_migrate_core::{
    attribute_differences, entity_id_of, now_rfc3339, owner_of, scan_all, timestamp_suffix, Item,
    ItemKey, MismatchRecord, MissingRecord, ScopeMapping, TableStore, TableValidationResult,
    ValidationReport,
};

use crate::config::{MigrationConfig, TablePlan};
use crate::output::{write_json_once, WrittenFile};

/// Check one table. Scan failures mark the table failed; they never abort the run.
pub fn validate_table<S: TableStore + ?Sized>(
    store: &S,
    mapping: &ScopeMapping,
    plan: &TablePlan,
    page_size: usize,
) -> TableValidationResult {
    let loaded = store
        .describe_table(&plan.target_table)
        .with_context(|| format!("failed to describe {}", plan.target_table))
        .and_then(|_| {
            scan_all(store, &plan.source_table, page_size)
                .with_context(|| format!("failed to scan {}", plan.source_table))
        });
    let items = match loaded {
        Ok(items) => items,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(table = %plan.source_table, error = %message, "validation could not read tables");
            return TableValidationResult::failed(&plan.source_table, message);
        }
    };

    let mut result = TableValidationResult::new(&plan.source_table);
    result.total_source = items.len() as u64;
    for item in &items {
        check_record(store, mapping, plan, item, &mut result);
    }
    result.finish();

    if result.success {
        tracing::info!(table = %plan.source_table, found = result.found, "table validated");
    } else {
        tracing::warn!(
            table = %plan.source_table,
            found = result.found,
            missing = result.missing,
            mismatch = result.mismatch,
            "table validation found discrepancies"
        );
    }
    result
}

fn check_record<S: TableStore + ?Sized>(
    store: &S,
    mapping: &ScopeMapping,
    plan: &TablePlan,
    item: &Item,
    result: &mut TableValidationResult,
) {
    let record_id = entity_id_of(plan.kind, item).unwrap_or_default().to_string();
    if record_id.is_empty() {
        result.record_missing(MissingRecord {
            record_id,
            user_id: owner_of(item).map(str::to_string),
            company_id: None,
            reason: format!("source record has no {}", plan.kind.id_attribute()),
        });
        return;
    }

    let Some(owner) = owner_of(item) else {
        result.record_missing(MissingRecord {
            record_id,
            user_id: None,
            company_id: None,
            reason: "source record has no userId and cannot be placed in a company".to_string(),
        });
        return;
    };

    let company_id = mapping.resolve(owner);
    let lookup = store.get_item(&plan.target_table, &ItemKey::new(&company_id, &record_id));
    match lookup {
        Ok(Some(target)) => {
            let attributes = attribute_differences(item, &target);
            if attributes.is_empty() {
                result.found += 1;
            } else {
                tracing::warn!(record_id = %record_id, company_id = %company_id, ?attributes, "migrated record differs");
                result.record_mismatch(MismatchRecord { record_id, company_id, attributes });
            }
        }
        Ok(None) => {
            tracing::warn!(record_id = %record_id, company_id = %company_id, "migrated record missing");
            result.record_missing(MissingRecord {
                record_id,
                user_id: Some(owner.to_string()),
                company_id: Some(company_id),
                reason: "not found in target table".to_string(),
            });
        }
        Err(err) => {
            result.record_missing(MissingRecord {
                record_id,
                user_id: Some(owner.to_string()),
                company_id: Some(company_id),
                reason: format!("target lookup failed: {err}"),
            });
        }
    }
}

/// Validate every configured table with a freshly built mapping and write the report.
///
/// # Errors
/// Returns an error only when the timestamp or the report file cannot be produced.
pub fn run_validation<S: TableStore + ?Sized>(
    store: &S,
    config: &MigrationConfig,
    report_dir: &Path,
) -> Result<(ValidationReport, WrittenFile)> {
    let timestamp = now_rfc3339()?;
    let mapping = ScopeMapping::build(store, &config.membership_table, config.scan_page_size);
    let results = config
        .tables
        .iter()
        .map(|plan| validate_table(store, &mapping, plan, config.scan_page_size))
        .collect::<Vec<_>>();

    let report = ValidationReport::from_results(timestamp, results);
    let file_name = format!("validation-report-{}.json", timestamp_suffix(&report.timestamp));
    let written = write_json_once(report_dir, &file_name, &report)?;
    tracing::info!(
        report = %written.path.display(),
        missing = report.summary.total_missing,
        mismatch = report.summary.total_mismatch,
        all_success = report.summary.all_success,
        "validation run finished"
    );
    Ok((report, written))
}
