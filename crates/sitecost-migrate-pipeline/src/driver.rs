//! Migration driver: scan, resolve, transform, check and write, one record at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sitecost_migrate_core::{
    entity_id_of, now_rfc3339, owner_of, scan_all, timestamp_suffix, transform, EntityKind,
    EntityRecord, Item, ItemKey, MigrationMode, MigrationRunReport, ProvenanceStamp, ScopeMapping,
    StoreError, TableMigrationResult, TableStore,
};

use crate::config::{MigrationConfig, TablePlan};
use crate::output::{write_json_once, WrittenFile};
use crate::snapshot::SnapshotDirectory;

/// Where source records are read from.
#[derive(Debug, Clone, Copy)]
pub enum RecordSource<'a> {
    Live,
    Snapshot(&'a SnapshotDirectory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub mode: MigrationMode,
    /// Treat an owner without membership as a record error instead of a self-named tenant.
    pub strict: bool,
    pub page_size: usize,
}

impl DriverOptions {
    #[must_use]
    pub fn new(mode: MigrationMode) -> Self {
        Self { mode, strict: false, page_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    /// `fallback` is set when the owner had no membership and became its own tenant.
    Migrated { fallback: bool },
    Skipped,
}

/// Per-run migration state. One driver migrates every table of a run in order.
pub struct MigrationDriver<'a> {
    mapping: &'a ScopeMapping,
    options: DriverOptions,
    migrated_at: String,
    target_tables: BTreeMap<EntityKind, String>,
    /// `(kind, tenant, id)` of every record migrated (or, in a dry run, that would be).
    accepted: BTreeSet<(EntityKind, String, String)>,
}

impl<'a> MigrationDriver<'a> {
    #[must_use]
    pub fn new(
        mapping: &'a ScopeMapping,
        options: DriverOptions,
        migrated_at: &str,
        plans: &[TablePlan],
    ) -> Self {
        Self {
            mapping,
            options,
            migrated_at: migrated_at.to_string(),
            target_tables: plans.iter().map(|plan| (plan.kind, plan.target_table.clone())).collect(),
            accepted: BTreeSet::new(),
        }
    }

    /// Migrate one table. Never fails: load failures mark the table, record failures are counted.
    pub fn migrate_table<S: TableStore + ?Sized>(
        &mut self,
        store: &mut S,
        plan: &TablePlan,
        source: RecordSource<'_>,
    ) -> TableMigrationResult {
        let items = match self.load_source(store, plan, source) {
            Ok(items) => items,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(table = %plan.source_table, error = %message, "failed to load source table");
                return TableMigrationResult::failed(&plan.source_table, message);
            }
        };

        let mut result = TableMigrationResult::new(&plan.source_table);
        result.total_records = items.len() as u64;
        if items.is_empty() {
            tracing::info!(table = %plan.source_table, "source table is empty");
            return result;
        }

        let stamp = ProvenanceStamp::new(&plan.source_table, &self.migrated_at);
        for item in &items {
            match self.migrate_record(store, plan, &stamp, item) {
                Ok(RecordOutcome::Migrated { fallback }) => {
                    result.migrated += 1;
                    if fallback {
                        result.fallback_mappings += 1;
                    }
                }
                Ok(RecordOutcome::Skipped) => result.skipped += 1,
                Err(err) => {
                    result.errors += 1;
                    let record = Value::Object(item.clone());
                    tracing::error!(
                        table = %plan.source_table,
                        record = %record,
                        error = %format!("{err:#}"),
                        "record migration failed"
                    );
                }
            }
        }

        tracing::info!(
            table = %plan.source_table,
            mode = self.options.mode.as_str(),
            total = result.total_records,
            migrated = result.migrated,
            skipped = result.skipped,
            errors = result.errors,
            fallback = result.fallback_mappings,
            "table migration finished"
        );
        result
    }

    fn load_source<S: TableStore + ?Sized>(
        &self,
        store: &S,
        plan: &TablePlan,
        source: RecordSource<'_>,
    ) -> Result<Vec<Item>> {
        match source {
            RecordSource::Live => scan_all(store, &plan.source_table, self.options.page_size)
                .with_context(|| format!("failed to scan {}", plan.source_table)),
            RecordSource::Snapshot(directory) => Ok(directory.load_table(&plan.source_table)?.items),
        }
    }

    fn migrate_record<S: TableStore + ?Sized>(
        &mut self,
        store: &mut S,
        plan: &TablePlan,
        stamp: &ProvenanceStamp,
        item: &Item,
    ) -> Result<RecordOutcome> {
        let Some(owner) = owner_of(item) else {
            tracing::warn!(
                table = %plan.source_table,
                record_id = entity_id_of(plan.kind, item).unwrap_or("<none>"),
                "skipping record without userId"
            );
            return Ok(RecordOutcome::Skipped);
        };

        let resolution = self.mapping.resolution(owner);
        if !resolution.mapped {
            if self.options.strict {
                return Err(anyhow!("owner {owner} has no company membership"));
            }
            tracing::warn!(user_id = owner, "no company membership; using the owner id as tenant id");
        }
        let fallback = !resolution.mapped;
        let tenant = resolution.tenant_id;

        let target = transform(plan.kind, item, &tenant, stamp);
        let record = plan.kind.decode(&target)?;
        if let EntityRecord::Work(work) = &record {
            self.require_reference(store, EntityKind::Project, &tenant, &work.project_id)?;
            self.require_reference(store, EntityKind::Contractor, &tenant, &work.contractor_id)?;
        }

        let entity_id = record.entity_id().to_string();
        let accepted_key = (plan.kind, tenant.clone(), entity_id.clone());
        let key = ItemKey::new(&tenant, &entity_id);
        if self.accepted.contains(&accepted_key) || store.get_item(&plan.target_table, &key)?.is_some() {
            tracing::info!(table = %plan.target_table, key = %key, "target record exists; skipping");
            return Ok(RecordOutcome::Skipped);
        }

        match self.options.mode {
            MigrationMode::DryRun => {
                let rendered = Value::Object(target);
                tracing::info!(
                    table = %plan.target_table,
                    key = %key,
                    record = %rendered,
                    "dry run: would write record"
                );
            }
            MigrationMode::Execute => match store.put_item_if_absent(&plan.target_table, &target) {
                Ok(()) => tracing::debug!(table = %plan.target_table, key = %key, "record written"),
                Err(StoreError::ConditionFailed { .. }) => {
                    tracing::warn!(table = %plan.target_table, key = %key, "record appeared before write; skipping");
                    return Ok(RecordOutcome::Skipped);
                }
                Err(err) => return Err(err.into()),
            },
        }

        self.accepted.insert(accepted_key);
        Ok(RecordOutcome::Migrated { fallback })
    }

    /// A work may only point at a project or contractor that exists for the same tenant,
    /// either in the target table or among records accepted earlier in this run.
    fn require_reference<S: TableStore + ?Sized>(
        &self,
        store: &S,
        kind: EntityKind,
        tenant: &str,
        id: &str,
    ) -> Result<()> {
        if self.accepted.contains(&(kind, tenant.to_string(), id.to_string())) {
            return Ok(());
        }
        let table = self
            .target_tables
            .get(&kind)
            .ok_or_else(|| anyhow!("no target table configured for {}", kind.as_str()))?;
        if store.get_item(table, &ItemKey::new(tenant, id))?.is_some() {
            return Ok(());
        }
        Err(anyhow!("work references unknown {} {id} for company {tenant}", kind.as_str()))
    }
}

/// Run every configured table in order and write the run report.
///
/// # Errors
/// Returns an error only when the timestamp cannot be produced or the report cannot be
/// written; table and record failures are reported inside the returned report.
pub fn run_migration<S: TableStore + ?Sized>(
    store: &mut S,
    config: &MigrationConfig,
    options: DriverOptions,
    source: RecordSource<'_>,
    report_dir: &Path,
) -> Result<(MigrationRunReport, WrittenFile)> {
    let timestamp = now_rfc3339()?;
    tracing::info!(mode = options.mode.as_str(), timestamp = %timestamp, "starting migration run");

    let mapping = ScopeMapping::build(store, &config.membership_table, options.page_size);
    let mut driver = MigrationDriver::new(&mapping, options, &timestamp, &config.tables);
    let results = config
        .tables
        .iter()
        .map(|plan| driver.migrate_table(store, plan, source))
        .collect::<Vec<_>>();

    let report = MigrationRunReport::from_results(options.mode, timestamp, results);
    let file_name = format!(
        "migration-report-{}-{}.json",
        options.mode.as_str(),
        timestamp_suffix(&report.timestamp)
    );
    let written = write_json_once(report_dir, &file_name, &report)?;
    tracing::info!(
        report = %written.path.display(),
        total = report.summary.total_records,
        migrated = report.summary.total_migrated,
        skipped = report.summary.total_skipped,
        errors = report.summary.total_errors,
        "migration run finished"
    );
    Ok((report, written))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sitecost_migrate_core::{MemoryTableStore, TableDefinition};
    use ulid::Ulid;

    use super::*;

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object: {other}"),
        }
    }

    fn expense(user: &str, id: &str, invoice: &str) -> Item {
        item(json!({
            "userId": user,
            "expenseId": id,
            "amount": 250,
            "date": "2024-05-02",
            "invoiceNum": invoice,
            "paymentMethod": "transfer",
        }))
    }

    fn project(user: &str, id: &str) -> Item {
        item(json!({ "userId": user, "projectId": id, "name": "Villa", "startDate": "2024-01-01" }))
    }

    fn contractor(user: &str, id: &str) -> Item {
        item(json!({ "userId": user, "contractorId": id, "name": "Dana Builders", "specialty": "roofing" }))
    }

    fn work(user: &str, id: &str, project_id: &str, contractor_id: &str) -> Item {
        item(json!({
            "userId": user,
            "workId": id,
            "projectId": project_id,
            "contractorId": contractor_id,
            "workName": "Framing",
            "totalWorkCost": 1200,
        }))
    }

    fn provisioned(config: &MigrationConfig, memberships: &[(&str, &str)]) -> Result<MemoryTableStore> {
        let mut store = MemoryTableStore::new();
        for definition in config.table_definitions() {
            store.create_table(&definition)?;
        }
        for (company, user) in memberships {
            store.put_item_if_absent(
                &config.membership_table,
                &item(json!({ "companyId": company, "userId": user })),
            )?;
        }
        Ok(store)
    }

    fn seed(store: &mut MemoryTableStore, config: &MigrationConfig, kind: EntityKind, items: &[Item]) -> Result<()> {
        let plan = config.plan(kind).ok_or_else(|| anyhow!("no plan for {}", kind.as_str()))?;
        for item in items {
            store.put_item_if_absent(&plan.source_table, item)?;
        }
        Ok(())
    }

    fn plan(config: &MigrationConfig, kind: EntityKind) -> Result<TablePlan> {
        config.plan(kind).cloned().ok_or_else(|| anyhow!("no plan for {}", kind.as_str()))
    }

    fn migrate(
        store: &mut MemoryTableStore,
        config: &MigrationConfig,
        kind: EntityKind,
        options: DriverOptions,
    ) -> Result<TableMigrationResult> {
        let mapping = ScopeMapping::build(store, &config.membership_table, 100);
        let mut driver = MigrationDriver::new(&mapping, options, "2025-03-01T10:00:00Z", &config.tables);
        Ok(driver.migrate_table(store, &plan(config, kind)?, RecordSource::Live))
    }

    fn target_count(store: &MemoryTableStore, config: &MigrationConfig, kind: EntityKind) -> Result<usize> {
        let plan = plan(config, kind)?;
        store.item_count(&plan.target_table).ok_or_else(|| anyhow!("missing target table"))
    }

    #[test]
    fn fresh_migration_moves_every_expense_under_the_company() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        let expenses = [expense("u1", "e-1", "INV-1"), expense("u1", "e-2", "INV-2"), expense("u1", "e-3", "INV-3")];
        seed(&mut store, &config, EntityKind::Expense, &expenses)?;

        let result = migrate(&mut store, &config, EntityKind::Expense, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!((result.total_records, result.migrated, result.skipped, result.errors), (3, 3, 0, 0));

        let expense_plan = plan(&config, EntityKind::Expense)?;
        let migrated = store.query_partition(&expense_plan.target_table, "companyA")?;
        assert_eq!(migrated.len(), 3);
        let invoices = migrated.iter().filter_map(|item| item.get("invoiceNum")).cloned().collect::<Vec<_>>();
        assert_eq!(invoices, vec![json!("INV-1"), json!("INV-2"), json!("INV-3")]);
        let source_tag = json!(expense_plan.source_table);
        assert!(migrated.iter().all(|item| item.get("migratedFrom") == Some(&source_tag)));
        Ok(())
    }

    #[test]
    fn second_execute_run_skips_everything() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Expense, &[expense("u1", "e-1", "INV-1"), expense("u1", "e-2", "INV-2")])?;

        let options = DriverOptions::new(MigrationMode::Execute);
        migrate(&mut store, &config, EntityKind::Expense, options)?;
        let before = target_count(&store, &config, EntityKind::Expense)?;

        let second = migrate(&mut store, &config, EntityKind::Expense, options)?;
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, second.total_records);
        assert_eq!(target_count(&store, &config, EntityKind::Expense)?, before);
        Ok(())
    }

    #[test]
    fn dry_run_leaves_the_target_untouched() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Expense, &[expense("u1", "e-1", "INV-1")])?;
        let target = plan(&config, EntityKind::Expense)?.target_table;
        let before = store.query_partition(&target, "companyA")?;

        let result = migrate(&mut store, &config, EntityKind::Expense, DriverOptions::new(MigrationMode::DryRun))?;
        assert_eq!(result.migrated, 1);
        assert_eq!(store.query_partition(&target, "companyA")?, before);
        assert_eq!(target_count(&store, &config, EntityKind::Expense)?, 0);
        Ok(())
    }

    #[test]
    fn unmapped_owner_becomes_its_own_tenant() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u2", "p-1")])?;

        let result = migrate(&mut store, &config, EntityKind::Project, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!(result.migrated, 1);
        assert_eq!(result.fallback_mappings, 1);
        let target = plan(&config, EntityKind::Project)?.target_table;
        assert!(store.get_item(&target, &ItemKey::new("u2", "p-1"))?.is_some());
        Ok(())
    }

    #[test]
    fn rerun_does_not_count_fallbacks_for_skipped_records() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u2", "p-1")])?;

        let first = migrate(&mut store, &config, EntityKind::Project, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!((first.migrated, first.skipped, first.fallback_mappings), (1, 0, 1));
        let second = migrate(&mut store, &config, EntityKind::Project, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!((second.migrated, second.skipped, second.fallback_mappings), (0, 1, 0));
        Ok(())
    }

    #[test]
    fn strict_mode_rejects_unmapped_owners() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u2", "p-1")])?;

        let options = DriverOptions { strict: true, ..DriverOptions::new(MigrationMode::Execute) };
        let result = migrate(&mut store, &config, EntityKind::Project, options)?;
        assert_eq!((result.migrated, result.errors, result.fallback_mappings), (0, 1, 0));
        assert_eq!(target_count(&store, &config, EntityKind::Project)?, 0);
        Ok(())
    }

    #[test]
    fn one_bad_record_does_not_stop_the_table() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        let mut invalid = expense("u1", "e-2", "INV-2");
        invalid.insert("amount".to_string(), json!(0));
        seed(
            &mut store,
            &config,
            EntityKind::Expense,
            &[expense("u1", "e-1", "INV-1"), invalid, expense("u1", "e-3", "INV-3"), expense("u1", "e-4", "INV-4")],
        )?;

        let result = migrate(&mut store, &config, EntityKind::Expense, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!((result.total_records, result.migrated, result.errors, result.skipped), (4, 3, 1, 0));
        Ok(())
    }

    #[test]
    fn work_with_unknown_project_is_an_error_and_writes_nothing() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Contractor, &[contractor("u1", "c-1")])?;
        seed(&mut store, &config, EntityKind::Work, &[work("u1", "w-1", "p-missing", "c-1")])?;

        let options = DriverOptions::new(MigrationMode::Execute);
        migrate(&mut store, &config, EntityKind::Contractor, options)?;
        let result = migrate(&mut store, &config, EntityKind::Work, options)?;
        assert_eq!((result.migrated, result.errors), (0, 1));
        assert_eq!(target_count(&store, &config, EntityKind::Work)?, 0);
        assert_eq!(target_count(&store, &config, EntityKind::Contractor)?, 1);
        Ok(())
    }

    #[test]
    fn dry_run_accepts_works_whose_parents_were_accepted_earlier() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u1", "p-1")])?;
        seed(&mut store, &config, EntityKind::Contractor, &[contractor("u1", "c-1")])?;
        seed(&mut store, &config, EntityKind::Work, &[work("u1", "w-1", "p-1", "c-1")])?;

        let mapping = ScopeMapping::build(&store, &config.membership_table, 100);
        let mut driver = MigrationDriver::new(
            &mapping,
            DriverOptions::new(MigrationMode::DryRun),
            "2025-03-01T10:00:00Z",
            &config.tables,
        );
        let results = config
            .tables
            .iter()
            .map(|plan| driver.migrate_table(&mut store, plan, RecordSource::Live))
            .collect::<Vec<_>>();
        assert!(results.iter().all(|result| result.errors == 0));
        assert_eq!(results.iter().map(|result| result.migrated).sum::<u64>(), 3);
        Ok(())
    }

    #[test]
    fn legacy_work_names_are_carried_forward() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u1", "p-1")])?;
        seed(&mut store, &config, EntityKind::Contractor, &[contractor("u1", "c-1")])?;
        seed(&mut store, &config, EntityKind::Work, &[work("u1", "w-1", "p-1", "c-1")])?;

        let options = DriverOptions::new(MigrationMode::Execute);
        for kind in [EntityKind::Project, EntityKind::Contractor, EntityKind::Work] {
            let result = migrate(&mut store, &config, kind, options)?;
            assert_eq!(result.errors, 0, "{} migration failed", kind.as_str());
        }

        let target = plan(&config, EntityKind::Work)?.target_table;
        let migrated = store
            .get_item(&target, &ItemKey::new("companyA", "w-1"))?
            .ok_or_else(|| anyhow!("work was not migrated"))?;
        assert_eq!(migrated.get("WorkName"), Some(&json!("Framing")));
        assert_eq!(migrated.get("workName"), Some(&json!("Framing")));
        assert_eq!(migrated.get("TotalWorkCost"), Some(&json!(1200)));

        let contractor_target = plan(&config, EntityKind::Contractor)?.target_table;
        let migrated_contractor = store
            .get_item(&contractor_target, &ItemKey::new("companyA", "c-1"))?
            .ok_or_else(|| anyhow!("contractor was not migrated"))?;
        assert_eq!(migrated_contractor.get("specialty"), Some(&json!("roofing")));
        Ok(())
    }

    #[test]
    fn missing_source_table_fails_only_that_table() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        seed(&mut store, &config, EntityKind::Project, &[project("u1", "p-1")])?;
        let expense_source = plan(&config, EntityKind::Expense)?.source_table;
        store.delete_table(&expense_source)?;

        let report_dir = std::env::temp_dir().join(format!("sitecost-driver-{}", Ulid::new()));
        let (report, written) = run_migration(
            &mut store,
            &config,
            DriverOptions::new(MigrationMode::Execute),
            RecordSource::Live,
            &report_dir,
        )?;

        assert!(report.results[0].error.as_deref().is_some_and(|error| error.contains("table not found")));
        assert_eq!(report.results[0].total_records, 0);
        assert_eq!(report.results[1].migrated, 1);
        assert!(!report.succeeded());
        assert!(written
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("migration-report-execute-")));

        std::fs::remove_dir_all(&report_dir)
            .with_context(|| format!("failed to cleanup temp dir {}", report_dir.display()))?;
        Ok(())
    }

    #[test]
    fn records_without_owner_are_skipped() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config, &[("companyA", "u1")])?;
        let plan = plan(&config, EntityKind::Expense)?;
        store.delete_table(&plan.source_table)?;
        store.create_table(&TableDefinition {
            table_name: plan.source_table.clone(),
            key_schema: sitecost_migrate_core::KeySchema::new("expenseId", None),
            secondary_indexes: Vec::new(),
        })?;
        let mut orphan = expense("u1", "e-2", "INV-2");
        orphan.remove("userId");
        store.put_item_if_absent(&plan.source_table, &expense("u1", "e-1", "INV-1"))?;
        store.put_item_if_absent(&plan.source_table, &orphan)?;

        let result = migrate(&mut store, &config, EntityKind::Expense, DriverOptions::new(MigrationMode::Execute))?;
        assert_eq!((result.total_records, result.migrated, result.skipped, result.errors), (2, 1, 1, 0));
        Ok(())
    }
}
