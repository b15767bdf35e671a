//! Decommission sequencer: delete legacy handlers, then legacy tables.
//!
//! Callers are expected to run it only after a clean validation report; nothing here
//! checks that.

use sitecost_migrate_core::{
    DecommissionReport, DecommissionResult, FunctionRegistry, MigrationMode, ResourceKind,
    TableStore,
};

/// Delete every function, then every table, recording each outcome and never stopping early.
/// A dry run only lists what would be deleted.
pub fn decommission<S: TableStore + FunctionRegistry + ?Sized>(
    store: &mut S,
    functions: &[String],
    tables: &[String],
    mode: MigrationMode,
    timestamp: String,
) -> DecommissionReport {
    let mut results = Vec::with_capacity(functions.len() + tables.len());

    for name in functions {
        let outcome = if mode.is_dry_run() { Ok(()) } else { store.delete_function(name) };
        results.push(record(ResourceKind::Function, name, mode, outcome));
    }
    for name in tables {
        let outcome = if mode.is_dry_run() { Ok(()) } else { store.delete_table(name) };
        results.push(record(ResourceKind::Table, name, mode, outcome));
    }

    let report = DecommissionReport::from_results(mode, timestamp, results);
    tracing::info!(
        mode = mode.as_str(),
        functions = report.summary.functions_deleted,
        tables = report.summary.tables_deleted,
        failures = report.summary.failures,
        "decommission finished"
    );
    report
}

fn record(
    kind: ResourceKind,
    name: &str,
    mode: MigrationMode,
    outcome: Result<(), sitecost_migrate_core::StoreError>,
) -> DecommissionResult {
    match outcome {
        Ok(()) => {
            if mode.is_dry_run() {
                tracing::info!(resource = ?kind, resource_name = %name, "dry run: would delete");
            } else {
                tracing::info!(resource = ?kind, resource_name = %name, "deleted");
            }
            DecommissionResult { kind, name: name.to_string(), success: true, error: None }
        }
        Err(err) => {
            tracing::error!(resource = ?kind, resource_name = %name, error = %err, "delete failed");
            DecommissionResult { kind, name: name.to_string(), success: false, error: Some(err.to_string()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use sitecost_migrate_core::{KeySchema, MemoryTableStore, StoreError, TableDefinition};

    use super::*;

    fn store_with(functions: &[&str], tables: &[&str]) -> Result<MemoryTableStore, StoreError> {
        let mut store = MemoryTableStore::new();
        for function in functions {
            store.register_function(function)?;
        }
        for table in tables {
            store.create_table(&TableDefinition {
                table_name: (*table).to_string(),
                key_schema: KeySchema::new("userId", Some("expenseId")),
                secondary_indexes: Vec::new(),
            })?;
        }
        Ok(store)
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[test]
    fn execute_deletes_functions_then_tables_and_keeps_going_on_failure() -> Result<(), StoreError> {
        let mut store = store_with(&["get-expenses", "add-expense"], &["expenses"])?;
        let report = decommission(
            &mut store,
            &names(&["get-expenses", "ghost-handler", "add-expense"]),
            &names(&["expenses", "ghost-table"]),
            MigrationMode::Execute,
            "2025-03-01T10:00:00Z".to_string(),
        );

        let order = report.results.iter().map(|result| (result.kind, result.success)).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                (ResourceKind::Function, true),
                (ResourceKind::Function, false),
                (ResourceKind::Function, true),
                (ResourceKind::Table, true),
                (ResourceKind::Table, false),
            ]
        );
        assert_eq!(report.summary.failures, 2);
        assert!(!report.succeeded());
        assert!(store.list_functions()?.is_empty());
        assert!(store.list_tables()?.is_empty());
        Ok(())
    }

    #[test]
    fn dry_run_deletes_nothing() -> Result<(), StoreError> {
        let mut store = store_with(&["get-expenses"], &["expenses"])?;
        let report = decommission(
            &mut store,
            &names(&["get-expenses"]),
            &names(&["expenses"]),
            MigrationMode::DryRun,
            "2025-03-01T10:00:00Z".to_string(),
        );
        assert!(report.succeeded());
        assert_eq!(store.list_functions()?, names(&["get-expenses"]));
        assert_eq!(store.list_tables()?, names(&["expenses"]));
        Ok(())
    }
}
