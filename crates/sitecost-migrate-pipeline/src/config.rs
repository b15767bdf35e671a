//! Run configuration: table names, decommission resources and scan sizing.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sitecost_migrate_core::{
    EntityKind, KeySchema, SecondaryIndex, TableDefinition, OWNER_ATTR, TENANT_ATTR,
};

const SOURCE_PREFIX: &str = "construction-expenses-production";
const TARGET_PREFIX: &str = "construction-expenses-company";

/// One source table and the tenant-scoped table its records move into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablePlan {
    pub kind: EntityKind,
    pub source_table: String,
    pub target_table: String,
}

impl TablePlan {
    #[must_use]
    pub fn default_for(kind: EntityKind) -> Self {
        let suffix = match kind {
            EntityKind::Expense => "expenses",
            EntityKind::Project => "projects",
            EntityKind::Contractor => "contractors",
            EntityKind::Work => "works",
        };
        Self {
            kind,
            source_table: format!("{SOURCE_PREFIX}-{suffix}"),
            target_table: format!("{TARGET_PREFIX}-{suffix}"),
        }
    }

    /// Legacy layout: partitioned by owner, sorted by entity id.
    #[must_use]
    pub fn source_definition(&self) -> TableDefinition {
        TableDefinition {
            table_name: self.source_table.clone(),
            key_schema: KeySchema::new(OWNER_ATTR, Some(self.kind.id_attribute())),
            secondary_indexes: Vec::new(),
        }
    }

    /// Tenant layout: partitioned by company, sorted by entity id, with an owner index.
    #[must_use]
    pub fn target_definition(&self) -> TableDefinition {
        TableDefinition {
            table_name: self.target_table.clone(),
            key_schema: KeySchema::new(TENANT_ATTR, Some(self.kind.id_attribute())),
            secondary_indexes: vec![SecondaryIndex {
                index_name: "userId-index".to_string(),
                key_schema: KeySchema::new(OWNER_ATTR, None),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default = "default_membership_table")]
    pub membership_table: String,
    /// Migration order; works must come after projects and contractors.
    #[serde(default = "default_tables")]
    pub tables: Vec<TablePlan>,
    #[serde(default = "default_decommission_functions")]
    pub decommission_functions: Vec<String>,
    /// Storage deleted after the handlers; defaults to every source table.
    #[serde(default)]
    pub decommission_tables: Option<Vec<String>>,
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_membership_table() -> String {
    format!("{TARGET_PREFIX}-users")
}

fn default_tables() -> Vec<TablePlan> {
    EntityKind::ALL.into_iter().map(TablePlan::default_for).collect()
}

fn default_decommission_functions() -> Vec<String> {
    ["expenses", "projects", "contractors", "works"]
        .iter()
        .flat_map(|entity| {
            ["get", "add", "update", "delete"]
                .iter()
                .map(move |verb| format!("construction-expenses-{verb}-{entity}"))
        })
        .collect()
}

fn default_scan_page_size() -> usize {
    100
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            membership_table: default_membership_table(),
            tables: default_tables(),
            decommission_functions: default_decommission_functions(),
            decommission_tables: None,
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl MigrationConfig {
    /// Load a YAML config file; absent keys take the production defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse config yaml")?;
        config.validate()?;
        Ok(config)
    }

    /// `--config` when given, otherwise the defaults.
    ///
    /// # Errors
    /// Propagates [`MigrationConfig::from_path`] failures.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    /// # Errors
    /// Returns an error naming the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if self.membership_table.trim().is_empty() {
            return Err(anyhow!("membership_table must be non-empty"));
        }
        if self.scan_page_size == 0 {
            return Err(anyhow!("scan_page_size must be >= 1"));
        }

        let mut kinds = BTreeSet::new();
        let mut names = BTreeSet::new();
        for plan in &self.tables {
            if !kinds.insert(plan.kind) {
                return Err(anyhow!("entity {} is planned more than once", plan.kind.as_str()));
            }
            for name in [&plan.source_table, &plan.target_table] {
                if name.trim().is_empty() {
                    return Err(anyhow!("table names for {} must be non-empty", plan.kind.as_str()));
                }
                if !names.insert(name.as_str()) {
                    return Err(anyhow!("table {name} appears more than once"));
                }
            }
        }

        if let Some(work_position) = self.position(EntityKind::Work) {
            for parent in [EntityKind::Project, EntityKind::Contractor] {
                if self.position(parent).is_some_and(|position| position > work_position) {
                    return Err(anyhow!(
                        "{} must be migrated before work so references resolve",
                        parent.as_str()
                    ));
                }
            }
        }

        Ok(())
    }

    fn position(&self, kind: EntityKind) -> Option<usize> {
        self.tables.iter().position(|plan| plan.kind == kind)
    }

    #[must_use]
    pub fn plan(&self, kind: EntityKind) -> Option<&TablePlan> {
        self.tables.iter().find(|plan| plan.kind == kind)
    }

    /// Source tables plus the membership table, in snapshot order.
    #[must_use]
    pub fn backup_tables(&self) -> Vec<String> {
        let mut tables = self.tables.iter().map(|plan| plan.source_table.clone()).collect::<Vec<_>>();
        tables.push(self.membership_table.clone());
        tables
    }

    #[must_use]
    pub fn decommission_tables(&self) -> Vec<String> {
        self.decommission_tables.clone().unwrap_or_else(|| {
            self.tables.iter().map(|plan| plan.source_table.clone()).collect()
        })
    }

    /// Every table `store init` provisions: sources, targets and the membership table.
    #[must_use]
    pub fn table_definitions(&self) -> Vec<TableDefinition> {
        let mut definitions = Vec::with_capacity(self.tables.len() * 2 + 1);
        for plan in &self.tables {
            definitions.push(plan.source_definition());
            definitions.push(plan.target_definition());
        }
        definitions.push(TableDefinition {
            table_name: self.membership_table.clone(),
            key_schema: KeySchema::new(TENANT_ATTR, Some(OWNER_ATTR)),
            secondary_indexes: vec![SecondaryIndex {
                index_name: "userId-index".to_string(),
                key_schema: KeySchema::new(OWNER_ATTR, None),
            }],
        });
        definitions
    }
}
