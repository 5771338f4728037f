//! Task model types for the lifecycle engine.
//!
//! Field names serialize in camelCase so that stored documents and
//! automation rule filters use the same vocabulary (`blockedBy`,
//! `assigneeIds`, `dueDate`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Task priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Needs attention now.
    Urgent,
    /// Should be done soon.
    High,
    /// Normal work (default).
    #[default]
    Medium,
    /// Nice to have.
    Low,
    /// No priority assigned.
    None,
}

impl Priority {
    /// Parse a priority from a string, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid priority.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, InvalidPriority> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "none" => Ok(Self::None),
            _ => Err(InvalidPriority(s.to_string())),
        }
    }

    /// Get the string representation of the priority.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "Urgent",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::None => "None",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error when an invalid priority string is provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPriority(pub String);

impl std::fmt::Display for InvalidPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid priority: '{}' (must be one of: Urgent, High, Medium, Low, None)",
            self.0
        )
    }
}

impl std::error::Error for InvalidPriority {}

/// Kind of a non-blocking link between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// The tasks concern the same topic.
    RelatedTo,
    /// One task duplicates the other.
    DuplicateOf,
}

/// A symmetric relation, stored on one side only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// The other task.
    pub task_id: String,
    /// Relation kind.
    #[serde(rename = "type")]
    pub kind: RelationType,
}

/// A checklist item inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Checklist item text.
    pub title: String,
    /// Whether the item is ticked.
    #[serde(default)]
    pub completed: bool,
}

/// One line of a task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub message: String,
}

impl HistoryEntry {
    /// A history entry stamped with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self { at: Utc::now(), message: message.into() }
    }
}

/// Unit of a recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every `interval` days.
    Daily,
    /// Every `interval` weeks.
    Weekly,
    /// Every `interval` months.
    Monthly,
    /// Every `interval` years.
    Yearly,
}

/// How a task repeats. Date arithmetic lives in `lifecycle::recurrence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    /// Unit of repetition.
    pub frequency: Frequency,
    /// Number of units between occurrences (at least 1).
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Target day for monthly and yearly rules. Clamped to the month's last day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    /// Last date an occurrence may fall on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<NaiveDate>,
}

const fn default_interval() -> u32 {
    1
}

impl Recurrence {
    /// A rule repeating every `interval` units of `frequency`.
    pub const fn every(interval: u32, frequency: Frequency) -> Self {
        Self { frequency, interval, day_of_month: None, until: None }
    }
}

/// A task record as held by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier (slug from title + random hex).
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Short title.
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Current status name, from the organization's workflow.
    pub status: String,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Labels, with set semantics.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Assigned members.
    #[serde(default)]
    pub assignee_ids: Vec<String>,
    /// Tasks that must finish before this one is actionable.
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    /// Cached evaluation of `blocked_by`.
    #[serde(default)]
    pub is_blocked: bool,
    /// Non-blocking links to other tasks.
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Recurrence rule.
    #[serde(default)]
    pub recurring: Option<Recurrence>,
    /// Due date.
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// When the task entered the terminal-complete status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Checklist.
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Organization-defined fields.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    /// Append-only history.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Idempotency token of the completion that generated this task.
    #[serde(default)]
    pub recurrence_token: Option<String>,
    /// Parent task for recurrence successors.
    #[serde(default)]
    pub recurred_from: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Write counter, bumped by every store write.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Build the stored form of a new task.
    pub fn from_new(id: String, new: NewTask, initial_status: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            organization_id: new.organization_id,
            title: new.title,
            description: new.description,
            status: new.status.unwrap_or_else(|| initial_status.to_string()),
            priority: new.priority,
            labels: new.labels,
            assignee_ids: new.assignee_ids,
            blocked_by: new.blocked_by,
            is_blocked: new.is_blocked,
            relations: new.relations,
            recurring: new.recurring,
            due_date: new.due_date,
            completed_at: new.completed_at,
            subtasks: new.subtasks,
            custom_fields: new.custom_fields,
            history: new.history,
            recurrence_token: new.recurrence_token,
            recurred_from: new.recurred_from,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Whether `label` is present.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Data for creating a task. The store assigns id, timestamps and version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewTask {
    /// Owning organization.
    pub organization_id: String,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Initial status. None means the workflow's initial status.
    pub status: Option<String>,
    /// Priority.
    pub priority: Priority,
    /// Labels.
    pub labels: Vec<String>,
    /// Assigned members.
    pub assignee_ids: Vec<String>,
    /// Blockers.
    pub blocked_by: BTreeSet<String>,
    /// Initial block flag; recomputed by the engine on create.
    pub is_blocked: bool,
    /// Relations.
    pub relations: Vec<Relation>,
    /// Recurrence rule.
    pub recurring: Option<Recurrence>,
    /// Due date.
    pub due_date: Option<NaiveDate>,
    /// Completion time, when created already complete.
    pub completed_at: Option<DateTime<Utc>>,
    /// Checklist.
    pub subtasks: Vec<Subtask>,
    /// Organization-defined fields.
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    /// Initial history.
    pub history: Vec<HistoryEntry>,
    /// Idempotency token; unique across the store when set.
    pub recurrence_token: Option<String>,
    /// Parent task for recurrence successors.
    pub recurred_from: Option<String>,
}

impl NewTask {
    /// A new task with the given organization and title, everything else defaulted.
    pub fn new(organization_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self { organization_id: organization_id.into(), title: title.into(), ..Self::default() }
    }
}

/// Partial update of a task. `None` leaves a field untouched; for clearable
/// fields, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPatch {
    /// New title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// New priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Replacement label list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    /// Replacement assignee list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_ids: Option<Vec<String>>,
    /// Replacement blocker set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<BTreeSet<String>>,
    /// New block flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_blocked: Option<bool>,
    /// Replacement relation list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
    /// New or cleared recurrence rule.
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub recurring: Option<Option<Recurrence>>,
    /// New or cleared due date.
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    /// New or cleared completion time.
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Option<DateTime<Utc>>>,
    /// Replacement checklist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Subtask>>,
    /// Replacement custom fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<BTreeMap<String, serde_json::Value>>,
    /// Entries appended to the history.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

/// Distinguishes an explicit `null` (clear) from an absent field (keep).
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TaskPatch {
    /// Check if any fields are set for update.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.labels.is_none()
            && self.assignee_ids.is_none()
            && self.blocked_by.is_none()
            && self.is_blocked.is_none()
            && self.relations.is_none()
            && self.recurring.is_none()
            && self.due_date.is_none()
            && self.completed_at.is_none()
            && self.subtasks.is_none()
            && self.custom_fields.is_none()
            && self.history.is_empty()
    }

    /// Apply the patch to a task in place. Timestamps and version are left to the store.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(ref title) = self.title {
            task.title.clone_from(title);
        }
        if let Some(ref description) = self.description {
            task.description.clone_from(description);
        }
        if let Some(ref status) = self.status {
            task.status.clone_from(status);
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(ref labels) = self.labels {
            task.labels.clone_from(labels);
        }
        if let Some(ref assignees) = self.assignee_ids {
            task.assignee_ids.clone_from(assignees);
        }
        if let Some(ref blocked_by) = self.blocked_by {
            task.blocked_by.clone_from(blocked_by);
        }
        if let Some(is_blocked) = self.is_blocked {
            task.is_blocked = is_blocked;
        }
        if let Some(ref relations) = self.relations {
            task.relations.clone_from(relations);
        }
        if let Some(ref recurring) = self.recurring {
            task.recurring.clone_from(recurring);
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(ref subtasks) = self.subtasks {
            task.subtasks.clone_from(subtasks);
        }
        if let Some(ref fields) = self.custom_fields {
            task.custom_fields.clone_from(fields);
        }
        task.history.extend(self.history.iter().cloned());
    }
}
