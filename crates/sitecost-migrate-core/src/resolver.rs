use std::collections::BTreeMap;

use serde_json::Value;

use crate::entity::{OWNER_ATTR, TENANT_ATTR};
use crate::store::{scan_all, TableStore};

/// Outcome of resolving one owner identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub tenant_id: String,
    /// `false` when no membership existed and the owner id was reused as the tenant id.
    pub mapped: bool,
}

/// Owner (user) to tenant (company) lookup, built once per run and passed by reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeMapping {
    owners: BTreeMap<String, String>,
    load_error: Option<String>,
}

impl ScopeMapping {
    /// Scan the membership table into memory.
    ///
    /// A failed scan is logged and yields an empty mapping, so every lookup falls back to
    /// the owner id. Malformed membership rows are skipped; when one user belongs to more
    /// than one company the first association in key order wins.
    pub fn build<S: TableStore + ?Sized>(store: &S, membership_table: &str, page_size: usize) -> Self {
        let items = match scan_all(store, membership_table, page_size) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(
                    table = membership_table,
                    error = %err,
                    "membership scan failed; every owner will fall back to a self-named tenant"
                );
                return Self { owners: BTreeMap::new(), load_error: Some(err.to_string()) };
            }
        };

        let mut owners = BTreeMap::new();
        for item in &items {
            let (Some(Value::String(owner)), Some(Value::String(tenant))) =
                (item.get(OWNER_ATTR), item.get(TENANT_ATTR))
            else {
                tracing::warn!(table = membership_table, "skipping membership row without userId/companyId");
                continue;
            };

            match owners.get(owner) {
                Some(existing) if existing != tenant => {
                    tracing::warn!(
                        user_id = %owner,
                        kept = %existing,
                        ignored = %tenant,
                        "user belongs to more than one company; keeping the first association"
                    );
                }
                Some(_) => {}
                None => {
                    owners.insert(owner.clone(), tenant.clone());
                }
            }
        }

        tracing::info!(table = membership_table, mappings = owners.len(), "built scope mapping");
        Self { owners, load_error: None }
    }

    pub fn from_pairs<I, O, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (O, T)>,
        O: Into<String>,
        T: Into<String>,
    {
        let mut owners = BTreeMap::new();
        for (owner, tenant) in pairs {
            owners.entry(owner.into()).or_insert_with(|| tenant.into());
        }
        Self { owners, load_error: None }
    }

    /// Tenant id for `owner_id`; an unmapped owner becomes its own tenant.
    #[must_use]
    pub fn resolve(&self, owner_id: &str) -> String {
        self.resolution(owner_id).tenant_id
    }

    #[must_use]
    pub fn resolution(&self, owner_id: &str) -> Resolution {
        match self.owners.get(owner_id) {
            Some(tenant_id) => Resolution { tenant_id: tenant_id.clone(), mapped: true },
            None => Resolution { tenant_id: owner_id.to_string(), mapped: false },
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Error recorded when the membership scan failed.
    #[must_use]
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::entity::Item;
    use crate::store::{KeySchema, MemoryTableStore, TableDefinition};

    fn membership(company: &str, user: &str) -> Item {
        let mut item = Item::new();
        item.insert("companyId".to_string(), json!(company));
        item.insert("userId".to_string(), json!(user));
        item
    }

    fn membership_store(rows: &[(&str, &str)]) -> MemoryTableStore {
        let mut store = MemoryTableStore::new();
        let created = store.create_table(&TableDefinition {
            table_name: "company-users".to_string(),
            key_schema: KeySchema::new("companyId", Some("userId")),
            secondary_indexes: vec![],
        });
        assert!(created.is_ok());
        for (company, user) in rows {
            assert!(store.put_item_if_absent("company-users", &membership(company, user)).is_ok());
        }
        store
    }

    #[test]
    fn build_maps_members_to_their_company() {
        let store = membership_store(&[("companyA", "u1"), ("companyA", "u3"), ("companyB", "u2")]);
        let mapping = ScopeMapping::build(&store, "company-users", 2);
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.resolve("u1"), "companyA");
        assert_eq!(mapping.resolve("u2"), "companyB");
        assert_eq!(mapping.resolution("u3"), Resolution { tenant_id: "companyA".to_string(), mapped: true });
    }

    #[test]
    fn unmapped_owner_falls_back_to_itself() {
        let store = membership_store(&[("companyA", "u1")]);
        let mapping = ScopeMapping::build(&store, "company-users", 100);
        assert_eq!(
            mapping.resolution("u2"),
            Resolution { tenant_id: "u2".to_string(), mapped: false }
        );
    }

    #[test]
    fn failed_membership_scan_yields_empty_mapping() {
        let store = MemoryTableStore::new();
        let mapping = ScopeMapping::build(&store, "company-users", 100);
        assert!(mapping.is_empty());
        assert_eq!(mapping.load_error(), Some("table not found: company-users"));
        assert_eq!(mapping.resolve("u1"), "u1");
    }

    #[test]
    fn first_company_wins_for_users_in_several_companies() {
        let store = membership_store(&[("companyB", "u1"), ("companyA", "u1")]);
        let mapping = ScopeMapping::build(&store, "company-users", 100);
        assert_eq!(mapping.resolve("u1"), "companyA");
    }

    #[test]
    fn rows_without_user_are_skipped() -> Result<(), crate::store::StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&TableDefinition {
            table_name: "memberships".to_string(),
            key_schema: KeySchema::new("membershipId", None),
            secondary_indexes: vec![],
        })?;
        let mut complete = membership("companyA", "u1");
        complete.insert("membershipId".to_string(), json!("m-1"));
        let mut orphan = Item::new();
        orphan.insert("membershipId".to_string(), json!("m-2"));
        orphan.insert("companyId".to_string(), json!("companyC"));
        store.put_item_if_absent("memberships", &complete)?;
        store.put_item_if_absent("memberships", &orphan)?;

        let mapping = ScopeMapping::build(&store, "memberships", 100);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.resolve("u1"), "companyA");
        Ok(())
    }

    proptest! {
        #[test]
        fn property_unmapped_owner_resolves_to_itself(owner in "[a-z0-9]{1,16}") {
            let mapping = ScopeMapping::from_pairs([("mapped-user", "companyA")]);
            prop_assume!(owner != "mapped-user");
            prop_assert_eq!(mapping.resolve(&owner), owner);
        }
    }
}
