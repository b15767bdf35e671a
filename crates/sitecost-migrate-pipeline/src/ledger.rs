//! Company-scoped entity writes with the create-time invariants of each entity.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sitecost_migrate_core::{
    now_rfc3339, EntityKind, EntityRecord, Item, ItemKey, StoreError, TableStore,
    DEPRECATED_CONTRACTOR_ATTRS, TENANT_ATTR,
};
use ulid::Ulid;

use crate::config::MigrationConfig;

/// Writes new entities into the tenant-scoped tables named by a [`MigrationConfig`].
pub struct TenantLedger<'a, S: TableStore + ?Sized> {
    store: &'a mut S,
    config: &'a MigrationConfig,
}

impl<'a, S: TableStore + ?Sized> TenantLedger<'a, S> {
    pub fn new(store: &'a mut S, config: &'a MigrationConfig) -> Self {
        Self { store, config }
    }

    /// # Errors
    /// Returns an error when the expense is invalid or its invoice number is already used
    /// within the company.
    pub fn create_expense(&mut self, company_id: &str, attributes: Item) -> Result<Item> {
        let item = self.prepare(EntityKind::Expense, company_id, attributes)?;
        let EntityRecord::Expense(expense) = EntityKind::Expense.decode(&item)? else {
            return Err(anyhow!("decoded record is not an expense"));
        };

        let table = self.target_table(EntityKind::Expense)?;
        let duplicate = self.store.query_partition(&table, company_id)?.into_iter().any(|existing| {
            existing.get("invoiceNum").and_then(Value::as_str) == Some(expense.invoice_num.as_str())
        });
        if duplicate {
            return Err(anyhow!(
                "expense with invoice number {} already exists for company {company_id}",
                expense.invoice_num
            ));
        }

        self.write(&table, item)
    }

    /// New projects start with `SpentAmount` 0 and status `active` unless one is given.
    ///
    /// # Errors
    /// Returns an error when the project is invalid or its id is taken.
    pub fn create_project(&mut self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut item = self.prepare(EntityKind::Project, company_id, attributes)?;
        item.insert("SpentAmount".to_string(), Value::from(0));
        item.entry("status").or_insert_with(|| Value::from("active"));
        EntityKind::Project.decode(&item)?;

        let table = self.target_table(EntityKind::Project)?;
        self.write(&table, item)
    }

    /// # Errors
    /// Returns an error when deprecated attributes are supplied or the contractor is invalid.
    pub fn create_contractor(&mut self, company_id: &str, attributes: Item) -> Result<Item> {
        if let Some(attribute) =
            DEPRECATED_CONTRACTOR_ATTRS.iter().find(|attribute| attributes.contains_key(**attribute))
        {
            return Err(anyhow!("contractor attribute {attribute} is no longer accepted"));
        }
        let item = self.prepare(EntityKind::Contractor, company_id, attributes)?;
        EntityKind::Contractor.decode(&item)?;

        let table = self.target_table(EntityKind::Contractor)?;
        self.write(&table, item)
    }

    /// The referenced project and contractor must exist for the company; nothing is
    /// written otherwise.
    ///
    /// # Errors
    /// Returns an error when the work is invalid or a reference does not resolve.
    pub fn create_work(&mut self, company_id: &str, attributes: Item) -> Result<Item> {
        let mut item = self.prepare(EntityKind::Work, company_id, attributes)?;
        item.entry("status").or_insert_with(|| Value::from("planned"));
        let EntityRecord::Work(work) = EntityKind::Work.decode(&item)? else {
            return Err(anyhow!("decoded record is not a work"));
        };

        for (kind, id) in [(EntityKind::Project, &work.project_id), (EntityKind::Contractor, &work.contractor_id)] {
            let table = self.target_table(kind)?;
            if self.store.get_item(&table, &ItemKey::new(company_id, id))?.is_none() {
                return Err(anyhow!("{} {id} not found for company {company_id}", kind.as_str()));
            }
        }

        let table = self.target_table(EntityKind::Work)?;
        self.write(&table, item)
    }

    fn prepare(&self, kind: EntityKind, company_id: &str, mut item: Item) -> Result<Item> {
        if company_id.trim().is_empty() {
            return Err(anyhow!("company id must be non-empty"));
        }
        let now = now_rfc3339()?;
        item.entry(kind.id_attribute()).or_insert_with(|| Value::from(Ulid::new().to_string()));
        item.insert(TENANT_ATTR.to_string(), Value::from(company_id));
        item.entry("createdAt").or_insert_with(|| Value::from(now.clone()));
        item.insert("updatedAt".to_string(), Value::from(now));
        Ok(item)
    }

    fn target_table(&self, kind: EntityKind) -> Result<String> {
        self.config
            .plan(kind)
            .map(|plan| plan.target_table.clone())
            .ok_or_else(|| anyhow!("no target table configured for {}", kind.as_str()))
    }

    fn write(&mut self, table: &str, item: Item) -> Result<Item> {
        match self.store.put_item_if_absent(table, &item) {
            Ok(()) => {
                tracing::info!(table, "ledger record created");
                Ok(item)
            }
            Err(StoreError::ConditionFailed { key, .. }) => {
                Err(anyhow!("record {key} already exists in {table}"))
            }
            Err(err) => Err(err).with_context(|| format!("failed to write to {table}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sitecost_migrate_core::MemoryTableStore;

    use super::*;

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object: {other}"),
        }
    }

    fn provisioned(config: &MigrationConfig) -> Result<MemoryTableStore> {
        let mut store = MemoryTableStore::new();
        for definition in config.table_definitions() {
            store.create_table(&definition)?;
        }
        Ok(store)
    }

    fn expense(invoice: &str) -> Item {
        item(json!({ "amount": 120, "date": "2024-07-01", "invoiceNum": invoice, "paymentMethod": "cash" }))
    }

    fn count(store: &MemoryTableStore, config: &MigrationConfig, kind: EntityKind) -> usize {
        config
            .plan(kind)
            .and_then(|plan| store.item_count(&plan.target_table))
            .unwrap_or_default()
    }

    fn error_text(result: Result<Item>) -> String {
        match result {
            Ok(item) => panic!("expected rejection, got {item:?}"),
            Err(err) => format!("{err:#}"),
        }
    }

    #[test]
    fn duplicate_invoice_number_is_rejected_within_a_company() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config)?;
        let mut ledger = TenantLedger::new(&mut store, &config);

        let created = ledger.create_expense("companyA", expense("INV-100"))?;
        assert!(created.get("expenseId").and_then(Value::as_str).is_some_and(|id| !id.is_empty()));
        assert!(error_text(ledger.create_expense("companyA", expense("INV-100"))).contains("already exists"));
        ledger.create_expense("companyB", expense("INV-100"))?;

        assert_eq!(count(&store, &config, EntityKind::Expense), 2);
        Ok(())
    }

    #[test]
    fn project_starts_with_zero_spent_and_active_status() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config)?;
        let mut ledger = TenantLedger::new(&mut store, &config);

        let project = ledger.create_project(
            "companyA",
            item(json!({ "name": "Warehouse", "startDate": "2024-02-01", "SpentAmount": 500 })),
        )?;
        assert_eq!(project.get("SpentAmount"), Some(&json!(0)));
        assert_eq!(project.get("status"), Some(&json!("active")));
        Ok(())
    }

    #[test]
    fn contractor_rejects_deprecated_attributes() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config)?;
        let mut ledger = TenantLedger::new(&mut store, &config);

        let rejected = ledger.create_contractor("companyA", item(json!({ "name": "Eli", "rate": 40 })));
        assert!(error_text(rejected).contains("rate"));
        ledger.create_contractor("companyA", item(json!({ "name": "Eli", "phone": "050-1234567" })))?;
        Ok(())
    }

    #[test]
    fn work_with_missing_project_is_rejected_before_any_write() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config)?;
        let mut ledger = TenantLedger::new(&mut store, &config);
        ledger.create_contractor("companyA", item(json!({ "contractorId": "c-1", "name": "Eli" })))?;

        let rejected = ledger.create_work(
            "companyA",
            item(json!({
                "projectId": "p-404",
                "contractorId": "c-1",
                "WorkName": "Plumbing",
                "TotalWorkCost": 900,
            })),
        );
        assert!(error_text(rejected).contains("project p-404 not found"));

        assert_eq!(count(&store, &config, EntityKind::Work), 0);
        assert_eq!(count(&store, &config, EntityKind::Contractor), 1);
        Ok(())
    }

    #[test]
    fn work_defaults_to_planned_when_references_resolve() -> Result<()> {
        let config = MigrationConfig::default();
        let mut store = provisioned(&config)?;
        let mut ledger = TenantLedger::new(&mut store, &config);
        ledger.create_project(
            "companyA",
            item(json!({ "projectId": "p-1", "name": "Villa", "startDate": "2024-01-01" })),
        )?;
        ledger.create_contractor("companyA", item(json!({ "contractorId": "c-1", "name": "Eli" })))?;

        let work = ledger.create_work(
            "companyA",
            item(json!({ "projectId": "p-1", "contractorId": "c-1", "WorkName": "Tiling", "TotalWorkCost": 0 })),
        )?;
        assert_eq!(work.get("status"), Some(&json!("planned")));

        let invalid_status = ledger.create_work(
            "companyA",
            item(json!({
                "projectId": "p-1",
                "contractorId": "c-1",
                "WorkName": "Tiling",
                "TotalWorkCost": 10,
                "status": "abandoned",
            })),
        );
        assert!(invalid_status.is_err());
        Ok(())
    }
}
