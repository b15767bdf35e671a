use serde_json::Value;

use crate::entity::{
    apply_legacy_work_names, EntityKind, Item, MIGRATED_AT_ATTR, MIGRATED_FROM_ATTR, OWNER_ATTR,
    TENANT_ATTR,
};

/// Provenance stamped onto every migrated item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceStamp {
    pub source_tag: String,
    pub migrated_at: String,
}

impl ProvenanceStamp {
    #[must_use]
    pub fn new(source_tag: &str, migrated_at: &str) -> Self {
        Self { source_tag: source_tag.to_string(), migrated_at: migrated_at.to_string() }
    }
}

/// Attributes that legitimately differ between a source item and its migrated copy.
pub const TARGET_ONLY_ATTRS: [&str; 3] = [TENANT_ATTR, MIGRATED_FROM_ATTR, MIGRATED_AT_ATTR];

/// Re-key one source item under `tenant_id` and stamp its provenance.
///
/// Every source attribute is copied verbatim. The only additions are the tenant id, the
/// two provenance attributes and, for works, the current attribute names when only the
/// legacy spelling is present.
#[must_use]
pub fn transform(kind: EntityKind, source: &Item, tenant_id: &str, stamp: &ProvenanceStamp) -> Item {
    let mut target = source.clone();
    if kind == EntityKind::Work {
        apply_legacy_work_names(&mut target);
    }
    target.insert(TENANT_ATTR.to_string(), Value::String(tenant_id.to_string()));
    target.insert(MIGRATED_FROM_ATTR.to_string(), Value::String(stamp.source_tag.clone()));
    target.insert(MIGRATED_AT_ATTR.to_string(), Value::String(stamp.migrated_at.clone()));
    target
}

/// Owner identity of a source item; empty and non-string values count as absent.
#[must_use]
pub fn owner_of(item: &Item) -> Option<&str> {
    non_empty_string(item, OWNER_ATTR)
}

#[must_use]
pub fn entity_id_of(kind: EntityKind, item: &Item) -> Option<&str> {
    non_empty_string(item, kind.id_attribute())
}

fn non_empty_string<'a>(item: &'a Item, attribute: &str) -> Option<&'a str> {
    match item.get(attribute) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.as_str()),
        _ => None,
    }
}

/// Source attributes whose value is absent from, or different in, `target`.
///
/// Tenant and provenance attributes are excluded. Values are compared as JSON, so `10`
/// and `10.0` count as different.
#[must_use]
pub fn attribute_differences(source: &Item, target: &Item) -> Vec<String> {
    source
        .iter()
        .filter(|(attribute, _)| !TARGET_ONLY_ATTRS.contains(&attribute.as_str()))
        .filter(|(attribute, value)| target.get(attribute.as_str()) != Some(*value))
        .map(|(attribute, _)| attribute.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object: {other}"),
        }
    }

    fn stamp() -> ProvenanceStamp {
        ProvenanceStamp::new("construction-expenses-production-expenses", "2025-03-01T10:00:00Z")
    }

    #[test]
    fn transform_rekeys_and_stamps_without_touching_the_source() {
        let source = item(json!({
            "userId": "u1",
            "expenseId": "exp-1",
            "amount": 12.5,
            "invoiceNum": "INV-7"
        }));
        let before = source.clone();

        let target = transform(EntityKind::Expense, &source, "companyA", &stamp());

        assert_eq!(source, before);
        assert_eq!(target.get("companyId"), Some(&json!("companyA")));
        assert_eq!(target.get("userId"), Some(&json!("u1")));
        assert_eq!(target.get("amount"), Some(&json!(12.5)));
        assert_eq!(target.get("migratedFrom"), Some(&json!("construction-expenses-production-expenses")));
        assert_eq!(target.get("migratedAt"), Some(&json!("2025-03-01T10:00:00Z")));
        assert!(attribute_differences(&source, &target).is_empty());
    }

    #[test]
    fn transform_overwrites_a_stale_company_id() {
        let source = item(json!({ "userId": "u1", "projectId": "p-1", "companyId": "old" }));
        let target = transform(EntityKind::Project, &source, "companyA", &stamp());
        assert_eq!(target.get("companyId"), Some(&json!("companyA")));
    }

    #[test]
    fn transform_adds_current_work_names_only_when_absent() {
        let legacy = item(json!({ "workId": "w-1", "workName": "Framing", "totalWorkCost": 400 }));
        let target = transform(EntityKind::Work, &legacy, "companyA", &stamp());
        assert_eq!(target.get("WorkName"), Some(&json!("Framing")));
        assert_eq!(target.get("TotalWorkCost"), Some(&json!(400)));
        assert_eq!(target.get("workName"), Some(&json!("Framing")));

        let current = item(json!({ "workId": "w-2", "WorkName": "Roofing", "workName": "stale" }));
        let target = transform(EntityKind::Work, &current, "companyA", &stamp());
        assert_eq!(target.get("WorkName"), Some(&json!("Roofing")));
    }

    #[test]
    fn owner_of_ignores_blank_and_non_string_values() {
        assert_eq!(owner_of(&item(json!({ "userId": "u1" }))), Some("u1"));
        assert_eq!(owner_of(&item(json!({ "userId": "  " }))), None);
        assert_eq!(owner_of(&item(json!({ "userId": 42 }))), None);
        assert_eq!(owner_of(&item(json!({}))), None);
    }

    #[test]
    fn attribute_differences_reports_changed_and_missing_attributes() {
        let source = item(json!({ "userId": "u1", "amount": 10, "date": "2024-01-01" }));
        let target = item(json!({ "userId": "u1", "amount": 10.0, "companyId": "companyA" }));
        assert_eq!(attribute_differences(&source, &target), vec!["amount".to_string(), "date".to_string()]);
    }

    proptest! {
        #[test]
        fn property_transform_is_pure_and_stamped(
            owner in "[a-z0-9]{1,12}",
            tenant in "[a-zA-Z0-9-]{1,12}",
            amount in 1_u32..1_000_000,
            description in ".{0,40}",
        ) {
            let source = item(json!({
                "userId": owner,
                "expenseId": "exp-1",
                "amount": amount,
                "description": description,
            }));
            let before = source.clone();
            let target = transform(EntityKind::Expense, &source, &tenant, &stamp());

            prop_assert_eq!(&source, &before);
            prop_assert_eq!(target.get("companyId"), Some(&json!(tenant)));
            for attribute in [MIGRATED_FROM_ATTR, MIGRATED_AT_ATTR] {
                let stamped = target.get(attribute).and_then(Value::as_str).unwrap_or_default();
                prop_assert!(!stamped.is_empty());
            }
            prop_assert!(attribute_differences(&source, &target).is_empty());
        }
    }
}
