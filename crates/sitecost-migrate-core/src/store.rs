use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Item;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("item already exists in {table} for key {key}")]
    ConditionFailed { table: String, key: String },
    #[error("item is missing string key attribute `{0}`")]
    MissingKey(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeySchema {
    pub partition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
}

impl KeySchema {
    #[must_use]
    pub fn new(partition_key: &str, sort_key: Option<&str>) -> Self {
        Self { partition_key: partition_key.to_string(), sort_key: sort_key.map(str::to_string) }
    }

    /// Extract the primary key of an item under this schema.
    ///
    /// # Errors
    /// Returns [`StoreError::MissingKey`] when a key attribute is absent, empty, or not a string.
    pub fn key_of(&self, item: &Item) -> Result<ItemKey, StoreError> {
        let partition = string_attribute(item, &self.partition_key)?;
        let sort = match &self.sort_key {
            Some(attribute) => Some(string_attribute(item, attribute)?),
            None => None,
        };
        Ok(ItemKey { partition, sort })
    }

    /// Key attributes in `HASH`, `RANGE` order, named the way table metadata exports them.
    #[must_use]
    pub fn elements(&self) -> Vec<(String, &'static str)> {
        let mut elements = vec![(self.partition_key.clone(), "HASH")];
        if let Some(sort_key) = &self.sort_key {
            elements.push((sort_key.clone(), "RANGE"));
        }
        elements
    }
}

fn string_attribute(item: &Item, attribute: &str) -> Result<String, StoreError> {
    match item.get(attribute) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Err(StoreError::MissingKey(attribute.to_string())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryIndex {
    pub index_name: String,
    pub key_schema: KeySchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub table_name: String,
    pub key_schema: KeySchema,
    #[serde(default)]
    pub secondary_indexes: Vec<SecondaryIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    pub table_name: String,
    pub key_schema: KeySchema,
    pub secondary_indexes: Vec<SecondaryIndex>,
    pub billing_mode: String,
    pub item_count: u64,
    pub status: String,
    pub creation_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl ItemKey {
    #[must_use]
    pub fn new(partition: &str, sort: &str) -> Self {
        Self { partition: partition.to_string(), sort: Some(sort.to_string()) }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}/{}", self.partition, sort),
            None => write!(f, "{}", self.partition),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// Continuation key; `None` once the table is exhausted.
    pub last_evaluated_key: Option<ItemKey>,
}

/// Key-value table store the pipeline reads from and writes to.
///
/// Scans return items in ascending primary-key order, one page at a time.
pub trait TableStore {
    /// # Errors
    /// Returns [`StoreError::TableExists`] when the name is taken.
    fn create_table(&mut self, definition: &TableDefinition) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::TableNotFound`] for unknown tables.
    fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the catalog cannot be read.
    fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    /// Read up to `limit` items strictly after `exclusive_start_key`.
    ///
    /// # Errors
    /// Returns [`StoreError::TableNotFound`] for unknown tables.
    fn scan_page(
        &self,
        table: &str,
        exclusive_start_key: Option<&ItemKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError>;

    /// # Errors
    /// Returns [`StoreError::TableNotFound`] for unknown tables.
    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, StoreError>;

    /// All items sharing one partition key value, in sort-key order.
    ///
    /// # Errors
    /// Returns [`StoreError::TableNotFound`] for unknown tables.
    fn query_partition(&self, table: &str, partition: &str) -> Result<Vec<Item>, StoreError>;

    /// Insert an item unless one with the same primary key exists; never overwrites.
    ///
    /// # Errors
    /// Returns [`StoreError::ConditionFailed`] when the key is taken and
    /// [`StoreError::MissingKey`] when the item lacks a key attribute.
    fn put_item_if_absent(&mut self, table: &str, item: &Item) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::TableNotFound`] for unknown tables.
    fn delete_table(&mut self, table: &str) -> Result<(), StoreError>;
}

/// Registry of deployed compute handlers.
pub trait FunctionRegistry {
    /// # Errors
    /// Returns [`StoreError::Backend`] when the registry cannot be written.
    fn register_function(&mut self, name: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the registry cannot be read.
    fn list_functions(&self) -> Result<Vec<String>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::FunctionNotFound`] for unknown handlers.
    fn delete_function(&mut self, name: &str) -> Result<(), StoreError>;
}

/// Read a whole table, following continuation keys until the last page.
///
/// # Errors
/// Propagates the first page failure.
pub fn scan_all<S: TableStore + ?Sized>(
    store: &S,
    table: &str,
    page_size: usize,
) -> Result<Vec<Item>, StoreError> {
    let page_size = page_size.max(1);
    let mut items = Vec::new();
    let mut start_key: Option<ItemKey> = None;

    loop {
        let page = store.scan_page(table, start_key.as_ref(), page_size)?;
        items.extend(page.items);
        match page.last_evaluated_key {
            Some(key) => start_key = Some(key),
            None => return Ok(items),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    definition: TableDefinition,
    creation_time: String,
    items: BTreeMap<ItemKey, Item>,
}

/// In-process store used by unit tests and fixtures.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    tables: BTreeMap<String, MemoryTable>,
    functions: BTreeSet<String>,
}

impl MemoryTableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: &str) -> Result<&MemoryTable, StoreError> {
        self.tables.get(table).ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// Number of items currently stored in `table`, or `None` for unknown tables.
    #[must_use]
    pub fn item_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|entry| entry.items.len())
    }
}

impl TableStore for MemoryTableStore {
    fn create_table(&mut self, definition: &TableDefinition) -> Result<(), StoreError> {
        if self.tables.contains_key(&definition.table_name) {
            return Err(StoreError::TableExists(definition.table_name.clone()));
        }
        self.tables.insert(
            definition.table_name.clone(),
            MemoryTable {
                definition: definition.clone(),
                creation_time: "1970-01-01T00:00:00Z".to_string(),
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError> {
        let entry = self.table(table)?;
        Ok(TableDescription {
            table_name: entry.definition.table_name.clone(),
            key_schema: entry.definition.key_schema.clone(),
            secondary_indexes: entry.definition.secondary_indexes.clone(),
            billing_mode: "PAY_PER_REQUEST".to_string(),
            item_count: entry.items.len() as u64,
            status: "ACTIVE".to_string(),
            creation_time: entry.creation_time.clone(),
        })
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn scan_page(
        &self,
        table: &str,
        exclusive_start_key: Option<&ItemKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let entry = self.table(table)?;
        let start = exclusive_start_key.map_or(Bound::Unbounded, Bound::Excluded);
        let mut remaining = entry.items.range::<ItemKey, _>((start, Bound::Unbounded));

        let items: Vec<(&ItemKey, &Item)> = remaining.by_ref().take(limit.max(1)).collect();
        let has_more = remaining.next().is_some();
        let last_evaluated_key =
            if has_more { items.last().map(|(key, _)| (*key).clone()) } else { None };

        Ok(ScanPage {
            items: items.into_iter().map(|(_, item)| item.clone()).collect(),
            last_evaluated_key,
        })
    }

    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        Ok(self.table(table)?.items.get(key).cloned())
    }

    fn query_partition(&self, table: &str, partition: &str) -> Result<Vec<Item>, StoreError> {
        Ok(self
            .table(table)?
            .items
            .iter()
            .filter(|(key, _)| key.partition == partition)
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn put_item_if_absent(&mut self, table: &str, item: &Item) -> Result<(), StoreError> {
        let entry = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let key = entry.definition.key_schema.key_of(item)?;
        if entry.items.contains_key(&key) {
            return Err(StoreError::ConditionFailed { table: table.to_string(), key: key.to_string() });
        }
        entry.items.insert(key, item.clone());
        Ok(())
    }

    fn delete_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }
}

impl FunctionRegistry for MemoryTableStore {
    fn register_function(&mut self, name: &str) -> Result<(), StoreError> {
        self.functions.insert(name.to_string());
        Ok(())
    }

    fn list_functions(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.functions.iter().cloned().collect())
    }

    fn delete_function(&mut self, name: &str) -> Result<(), StoreError> {
        if self.functions.remove(name) {
            Ok(())
        } else {
            Err(StoreError::FunctionNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn definition(table: &str) -> TableDefinition {
        TableDefinition {
            table_name: table.to_string(),
            key_schema: KeySchema::new("userId", Some("expenseId")),
            secondary_indexes: vec![],
        }
    }

    fn expense(user: &str, id: &str) -> Item {
        let mut item = Item::new();
        item.insert("userId".to_string(), json!(user));
        item.insert("expenseId".to_string(), json!(id));
        item
    }

    #[test]
    fn scan_all_follows_continuation_keys() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        for index in 0..7 {
            store.put_item_if_absent("expenses", &expense("u1", &format!("exp-{index}")))?;
        }

        let first = store.scan_page("expenses", None, 3)?;
        assert_eq!(first.items.len(), 3);
        assert!(first.last_evaluated_key.is_some());

        let all = scan_all(&store, "expenses", 3)?;
        assert_eq!(all.len(), 7);
        Ok(())
    }

    #[test]
    fn scan_page_resumes_strictly_after_the_start_key() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        for index in 1..=4 {
            store.put_item_if_absent("expenses", &expense("u1", &format!("exp-{index}")))?;
        }
        store.put_item_if_absent("expenses", &expense("u2", "exp-1"))?;

        let page = store.scan_page("expenses", Some(&ItemKey::new("u1", "exp-2")), 2)?;
        let ids = page.items.iter().filter_map(|item| item.get("expenseId").cloned()).collect::<Vec<_>>();
        assert_eq!(ids, vec![json!("exp-3"), json!("exp-4")]);
        assert_eq!(page.last_evaluated_key, Some(ItemKey::new("u1", "exp-4")));

        let absent_start = store.scan_page("expenses", Some(&ItemKey::new("u1", "exp-25")), 10)?;
        assert_eq!(absent_start.items.len(), 3);
        assert_eq!(absent_start.last_evaluated_key, None);
        Ok(())
    }

    #[test]
    fn last_page_has_no_continuation_key() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        store.put_item_if_absent("expenses", &expense("u1", "exp-1"))?;
        store.put_item_if_absent("expenses", &expense("u1", "exp-2"))?;

        let page = store.scan_page("expenses", None, 2)?;
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.last_evaluated_key, None);
        Ok(())
    }

    #[test]
    fn put_if_absent_never_overwrites() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        store.put_item_if_absent("expenses", &expense("u1", "exp-1"))?;

        let mut replacement = expense("u1", "exp-1");
        replacement.insert("amount".to_string(), json!(99));
        let result = store.put_item_if_absent("expenses", &replacement);
        assert!(matches!(result, Err(StoreError::ConditionFailed { .. })));

        let stored = store.get_item("expenses", &ItemKey::new("u1", "exp-1"))?;
        assert_eq!(stored, Some(expense("u1", "exp-1")));
        Ok(())
    }

    #[test]
    fn put_rejects_items_without_key_attributes() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        let mut item = expense("u1", "exp-1");
        item.remove("userId");
        assert_eq!(
            store.put_item_if_absent("expenses", &item),
            Err(StoreError::MissingKey("userId".to_string()))
        );
        Ok(())
    }

    #[test]
    fn unknown_table_is_reported() {
        let store = MemoryTableStore::new();
        assert_eq!(
            store.scan_page("missing", None, 10),
            Err(StoreError::TableNotFound("missing".to_string()))
        );
    }

    #[test]
    fn query_partition_filters_by_partition_value() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.create_table(&definition("expenses"))?;
        store.put_item_if_absent("expenses", &expense("u1", "exp-1"))?;
        store.put_item_if_absent("expenses", &expense("u2", "exp-2"))?;
        assert_eq!(store.query_partition("expenses", "u2")?, vec![expense("u2", "exp-2")]);
        Ok(())
    }

    #[test]
    fn deleting_an_unknown_function_fails() -> Result<(), StoreError> {
        let mut store = MemoryTableStore::new();
        store.register_function("get-expenses")?;
        store.delete_function("get-expenses")?;
        assert_eq!(
            store.delete_function("get-expenses"),
            Err(StoreError::FunctionNotFound("get-expenses".to_string()))
        );
        Ok(())
    }
}
