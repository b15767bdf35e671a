use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime};

use crate::RecordError;

/// One stored record: a flat attribute map, exactly as the table store holds it.
pub type Item = Map<String, Value>;

/// Legacy per-user partition key.
pub const OWNER_ATTR: &str = "userId";
/// Per-company partition key of the target tables.
pub const TENANT_ATTR: &str = "companyId";
pub const MIGRATED_FROM_ATTR: &str = "migratedFrom";
pub const MIGRATED_AT_ATTR: &str = "migratedAt";

/// Contractor attributes from the earlier schema. New contractors may not carry them.
pub const DEPRECATED_CONTRACTOR_ATTRS: [&str; 3] = ["specialty", "email", "rate"];

/// Work attributes renamed by the schema revision: (legacy name, current name).
pub const LEGACY_WORK_ATTRS: [(&str, &str); 2] =
    [("workName", "WorkName"), ("totalWorkCost", "TotalWorkCost")];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Expense,
    Project,
    Contractor,
    Work,
}

impl EntityKind {
    /// Migration order: works last so their project and contractor references resolve.
    pub const ALL: [Self; 4] = [Self::Expense, Self::Project, Self::Contractor, Self::Work];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Project => "project",
            Self::Contractor => "contractor",
            Self::Work => "work",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expense" => Some(Self::Expense),
            "project" => Some(Self::Project),
            "contractor" => Some(Self::Contractor),
            "work" => Some(Self::Work),
            _ => None,
        }
    }

    /// Attribute holding the entity's unique id (the sort key of every entity table).
    #[must_use]
    pub fn id_attribute(self) -> &'static str {
        match self {
            Self::Expense => "expenseId",
            Self::Project => "projectId",
            Self::Contractor => "contractorId",
            Self::Work => "workId",
        }
    }

    /// Decode a stored item into its typed view and check the entity invariants.
    ///
    /// # Errors
    /// Returns [`RecordError::Decode`] when required attributes are missing or mistyped and
    /// [`RecordError::Validation`] when a value breaks an entity invariant.
    pub fn decode(self, item: &Item) -> Result<EntityRecord, RecordError> {
        let mut normalized = item.clone();
        if self == Self::Work {
            apply_legacy_work_names(&mut normalized);
        }
        let value = Value::Object(normalized);
        let record = match self {
            Self::Expense => EntityRecord::Expense(decode_as(value, self)?),
            Self::Project => EntityRecord::Project(decode_as(value, self)?),
            Self::Contractor => EntityRecord::Contractor(decode_as(value, self)?),
            Self::Work => EntityRecord::Work(decode_as(value, self)?),
        };
        record.validate()?;
        Ok(record)
    }
}

/// Fill the current work attribute names from their legacy spelling when absent.
/// Values already present under the current names are left untouched.
pub fn apply_legacy_work_names(item: &mut Item) {
    for (legacy, current) in LEGACY_WORK_ATTRS {
        if item.contains_key(current) {
            continue;
        }
        if let Some(value) = item.get(legacy).cloned() {
            item.insert(current.to_string(), value);
        }
    }
}

fn decode_as<T: serde::de::DeserializeOwned>(value: Value, kind: EntityKind) -> Result<T, RecordError> {
    serde_json::from_value(value)
        .map_err(|err| RecordError::Decode(format!("invalid {} record: {err}", kind.as_str())))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub expense_id: String,
    pub amount: Number,
    pub date: String,
    pub invoice_num: String,
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contractor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_image: Option<String>,
    /// Scope, provenance, timestamps and any attribute this schema does not name.
    #[serde(flatten)]
    pub extra: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub start_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "SpentAmount", default, skip_serializing_if = "Option::is_none")]
    pub spent_amount: Option<Number>,
    #[serde(flatten)]
    pub extra: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contractor {
    pub contractor_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Item,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    Planned,
    InProgress,
    Completed,
}

impl WorkStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub work_id: String,
    pub project_id: String,
    pub contractor_id: String,
    #[serde(rename = "WorkName")]
    pub work_name: String,
    #[serde(rename = "TotalWorkCost")]
    pub total_work_cost: Number,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_id: Option<String>,
    #[serde(flatten)]
    pub extra: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum EntityRecord {
    Expense(Expense),
    Project(Project),
    Contractor(Contractor),
    Work(Work),
}

impl EntityRecord {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Expense(_) => EntityKind::Expense,
            Self::Project(_) => EntityKind::Project,
            Self::Contractor(_) => EntityKind::Contractor,
            Self::Work(_) => EntityKind::Work,
        }
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Expense(expense) => &expense.expense_id,
            Self::Project(project) => &project.project_id,
            Self::Contractor(contractor) => &contractor.contractor_id,
            Self::Work(work) => &work.work_id,
        }
    }

    /// Check the per-entity invariants of the company-scoped schema.
    ///
    /// # Errors
    /// Returns [`RecordError::Validation`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), RecordError> {
        require_non_empty(self.kind().id_attribute(), self.entity_id())?;

        match self {
            Self::Expense(expense) => {
                require_positive("amount", &expense.amount)?;
                require_calendar_date("date", &expense.date)?;
                require_non_empty("invoiceNum", &expense.invoice_num)?;
                require_non_empty("paymentMethod", &expense.payment_method)?;
            }
            Self::Project(project) => {
                require_non_empty("name", &project.name)?;
                require_calendar_date("startDate", &project.start_date)?;
                if let Some(end_date) = &project.end_date {
                    require_calendar_date("endDate", end_date)?;
                }
                if let Some(budget) = &project.budget {
                    require_non_negative("budget", budget)?;
                }
                if let Some(spent) = &project.spent_amount {
                    require_non_negative("SpentAmount", spent)?;
                }
            }
            Self::Contractor(contractor) => {
                require_non_empty("name", &contractor.name)?;
            }
            Self::Work(work) => {
                require_non_empty("projectId", &work.project_id)?;
                require_non_empty("contractorId", &work.contractor_id)?;
                require_non_empty("WorkName", &work.work_name)?;
                require_non_negative("TotalWorkCost", &work.total_work_cost)?;
            }
        }

        Ok(())
    }

    /// Render the typed record back into a flat item.
    ///
    /// # Errors
    /// Returns [`RecordError::Decode`] when serialization does not yield an object.
    pub fn to_item(&self) -> Result<Item, RecordError> {
        let value = match self {
            Self::Expense(expense) => serde_json::to_value(expense),
            Self::Project(project) => serde_json::to_value(project),
            Self::Contractor(contractor) => serde_json::to_value(contractor),
            Self::Work(work) => serde_json::to_value(work),
        }
        .map_err(|err| RecordError::Decode(format!("failed to serialize record: {err}")))?;

        match value {
            Value::Object(item) => Ok(item),
            other => Err(RecordError::Decode(format!("record serialized to non-object: {other}"))),
        }
    }
}

fn require_non_empty(attribute: &str, value: &str) -> Result<(), RecordError> {
    if value.trim().is_empty() {
        return Err(RecordError::Validation(format!("{attribute} MUST be non-empty")));
    }
    Ok(())
}

fn require_positive(attribute: &str, value: &Number) -> Result<(), RecordError> {
    match value.as_f64() {
        Some(amount) if amount.is_finite() && amount > 0.0 => Ok(()),
        _ => Err(RecordError::Validation(format!("{attribute} MUST be > 0 (got {value})"))),
    }
}

fn require_non_negative(attribute: &str, value: &Number) -> Result<(), RecordError> {
    match value.as_f64() {
        Some(amount) if amount.is_finite() && amount >= 0.0 => Ok(()),
        _ => Err(RecordError::Validation(format!("{attribute} MUST be >= 0 (got {value})"))),
    }
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp.
fn require_calendar_date(attribute: &str, value: &str) -> Result<(), RecordError> {
    if parse_calendar_date(value).is_some() || OffsetDateTime::parse(value, &Rfc3339).is_ok() {
        return Ok(());
    }
    Err(RecordError::Validation(format!("{attribute} MUST be an ISO calendar date (got {value:?})")))
}

fn parse_calendar_date(value: &str) -> Option<Date> {
    let mut parts = value.split('-');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return None;
    }
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    Date::from_calendar_date(year.parse().ok()?, month, day.parse().ok()?).ok()
}
