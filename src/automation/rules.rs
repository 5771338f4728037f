//! Automation rule definitions and their storage.

use crate::error::{Error, Result};
use crate::tasks::id::generate_rule_id;
use crate::tasks::store::open_connection;
use crate::tasks::Priority;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Task fields a trigger filter may test, besides `customFields.<name>`.
pub const FILTERABLE_FIELDS: &[&str] = &[
    "title",
    "description",
    "status",
    "priority",
    "labels",
    "assigneeIds",
    "blockedBy",
    "isBlocked",
    "dueDate",
    "recurredFrom",
];

/// Lifecycle occurrences a rule can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    /// A task was created.
    #[serde(rename = "task.created")]
    TaskCreated,
    /// A task was updated in any way.
    #[serde(rename = "task.updated")]
    TaskUpdated,
    /// A task moved into the terminal-complete status.
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// The status changed.
    #[serde(rename = "task.status.changed")]
    StatusChanged,
    /// The priority changed.
    #[serde(rename = "task.priority.changed")]
    PriorityChanged,
    /// The assignee set changed.
    #[serde(rename = "task.assignees.changed")]
    AssigneesChanged,
    /// The label set changed.
    #[serde(rename = "task.labels.changed")]
    LabelsChanged,
    /// The due date changed.
    #[serde(rename = "task.due_date.changed")]
    DueDateChanged,
}

impl TriggerType {
    /// Every `*.changed` trigger.
    pub const CHANGE_TRIGGERS: [Self; 5] = [
        Self::StatusChanged,
        Self::PriorityChanged,
        Self::AssigneesChanged,
        Self::LabelsChanged,
        Self::DueDateChanged,
    ];

    /// The task field a `*.changed` trigger watches.
    pub const fn watched_field(self) -> Option<&'static str> {
        match self {
            Self::StatusChanged => Some("status"),
            Self::PriorityChanged => Some("priority"),
            Self::AssigneesChanged => Some("assigneeIds"),
            Self::LabelsChanged => Some("labels"),
            Self::DueDateChanged => Some("dueDate"),
            Self::TaskCreated | Self::TaskUpdated | Self::TaskCompleted => None,
        }
    }

    /// Wire name, e.g. `task.status.changed`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task.created",
            Self::TaskUpdated => "task.updated",
            Self::TaskCompleted => "task.completed",
            Self::StatusChanged => "task.status.changed",
            Self::PriorityChanged => "task.priority.changed",
            Self::AssigneesChanged => "task.assignees.changed",
            Self::LabelsChanged => "task.labels.changed",
            Self::DueDateChanged => "task.due_date.changed",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Occurrence to react to.
    #[serde(rename = "type")]
    pub kind: TriggerType,
    /// Field name to expected value; all must match the new task state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, serde_json::Value>,
}

impl Trigger {
    /// A trigger without filters.
    pub const fn on(kind: TriggerType) -> Self {
        Self { kind, filters: BTreeMap::new() }
    }

    /// Add a filter.
    #[must_use]
    pub fn with_filter(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.filters.insert(field.to_string(), value.into());
        self
    }
}

/// What a rule does to the task that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Action {
    /// Replace the assignees with a single member.
    #[serde(rename = "task.assign", rename_all = "camelCase")]
    Assign {
        /// Member to assign.
        assignee_id: String,
    },
    /// Overwrite the priority.
    #[serde(rename = "task.set.priority")]
    SetPriority {
        /// Priority name, case-insensitive.
        priority: String,
    },
    /// Add a label if missing.
    #[serde(rename = "task.add.label")]
    AddLabel {
        /// Label to add.
        label: String,
    },
    /// Remove a label if present.
    #[serde(rename = "task.remove.label")]
    RemoveLabel {
        /// Label to remove.
        label: String,
    },
}

impl Action {
    /// Check the action's parameters.
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty parameters or an unknown priority.
    pub fn validate(&self) -> Result<()> {
        let (name, value) = match self {
            Self::Assign { assignee_id } => ("assigneeId", assignee_id),
            Self::SetPriority { priority } => ("priority", priority),
            Self::AddLabel { label } | Self::RemoveLabel { label } => ("label", label),
        };
        if value.trim().is_empty() {
            return Err(Error::validation(format!("action parameter '{name}' is empty")));
        }
        if let Self::SetPriority { priority } = self {
            parse_priority(priority)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assign { assignee_id } => write!(f, "assigned to {assignee_id}"),
            Self::SetPriority { priority } => write!(f, "set priority to {priority}"),
            Self::AddLabel { label } => write!(f, "added label '{label}'"),
            Self::RemoveLabel { label } => write!(f, "removed label '{label}'"),
        }
    }
}

/// Parse a priority parameter into a validation error on failure.
pub(crate) fn parse_priority(value: &str) -> Result<Priority> {
    Priority::from_str(value).map_err(|e| Error::validation(e.to_string()))
}

/// A stored "when X happens, do Y" rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    /// Unique id; assigned on first upsert when empty.
    #[serde(default)]
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Display name.
    pub name: String,
    /// Disabled rules are never evaluated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When the rule fires.
    pub trigger: Trigger,
    /// What the rule does.
    pub action: Action,
}

const fn default_enabled() -> bool {
    true
}

impl AutomationRule {
    /// A new enabled rule without an id.
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        trigger: Trigger,
        action: Action,
    ) -> Self {
        Self {
            id: String::new(),
            organization_id: organization_id.into(),
            name: name.into(),
            enabled: true,
            trigger,
            action,
        }
    }

    /// Check a rule before it is saved.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("rule name is empty"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(Error::validation(format!("rule '{}' has no organization", self.name)));
        }
        for field in self.trigger.filters.keys() {
            if !is_filterable(field) {
                return Err(Error::validation(format!(
                    "rule '{}' filters on unknown field '{field}'",
                    self.name
                )));
            }
        }
        self.action.validate()
    }
}

fn is_filterable(field: &str) -> bool {
    FILTERABLE_FIELDS.contains(&field)
        || field.strip_prefix("customFields.").is_some_and(|rest| !rest.is_empty())
}

/// Storage for automation rules, used by the management surface.
#[allow(clippy::missing_errors_doc)]
pub trait RuleStore {
    /// All rules of an organization, enabled or not, in store order.
    fn list_rules(&self, organization_id: &str) -> Result<Vec<AutomationRule>>;

    /// Get a rule by ID.
    fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>>;

    /// Validate and save a rule, assigning an id if it has none.
    fn upsert_rule(&self, rule: AutomationRule) -> Result<AutomationRule>;

    /// Delete a rule. Fails with [`Error::RuleNotFound`] if it does not exist.
    fn delete_rule(&self, id: &str) -> Result<()>;
}

/// Validate a rule and fill in its id; shared by every rule store.
pub(crate) fn prepare_rule(mut rule: AutomationRule) -> Result<AutomationRule> {
    rule.validate()?;
    if rule.id.is_empty() {
        rule.id = generate_rule_id(&rule.name);
    }
    Ok(rule)
}

/// SQLite-based rule store. Can share a database file with the task store.
#[derive(Debug, Clone)]
pub struct SqliteRuleStore {
    db_path: PathBuf,
}

impl SqliteRuleStore {
    /// Create a new `SQLite` rule store at the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self { db_path: db_path.as_ref().to_path_buf() };
        let conn = store.open()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS automation_rules (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rules_org ON automation_rules(organization_id);
            ",
        )?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn parse_rule(row: &rusqlite::Row) -> rusqlite::Result<AutomationRule> {
        let document: String = row.get(0)?;
        serde_json::from_str(&document).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }
}

impl RuleStore for SqliteRuleStore {
    fn list_rules(&self, organization_id: &str) -> Result<Vec<AutomationRule>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT document FROM automation_rules WHERE organization_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rules = stmt
            .query_map(params![organization_id], Self::parse_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>> {
        let conn = self.open()?;
        let rule = conn
            .query_row(
                "SELECT document FROM automation_rules WHERE id = ?1",
                params![id],
                Self::parse_rule,
            )
            .optional()?;
        Ok(rule)
    }

    fn upsert_rule(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let rule = prepare_rule(rule)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO automation_rules (id, organization_id, enabled, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                enabled = excluded.enabled,
                document = excluded.document,
                updated_at = excluded.updated_at",
            params![&rule.id, &rule.organization_id, rule.enabled, serde_json::to_string(&rule)?, now],
        )?;
        Ok(rule)
    }

    fn delete_rule(&self, id: &str) -> Result<()> {
        let conn = self.open()?;
        let rows = conn.execute("DELETE FROM automation_rules WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::RuleNotFound(id.to_string()));
        }
        Ok(())
    }
}
