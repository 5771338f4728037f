//! Rule matching and action execution.
//!
//! Matching happens once per event, against a snapshot of the rules, before
//! any action runs. Action writes therefore never feed back into the same
//! dispatch: a rule that raises a priority cannot wake a
//! `task.priority.changed` rule for the same event.

use super::rules::{parse_priority, Action, AutomationRule, Trigger, TriggerType};
use crate::config::Workflow;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleEvent;
use crate::tasks::{HistoryEntry, Task, TaskPatch, TaskStore, TaskWrite};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Checks that entities referenced by rule actions still exist.
#[allow(clippy::missing_errors_doc)]
pub trait ReferenceDirectory {
    /// Whether `member_id` is a current member of the organization.
    fn member_exists(&self, organization_id: &str, member_id: &str) -> Result<bool>;

    /// Whether `label` is defined for the organization.
    fn label_exists(&self, organization_id: &str, label: &str) -> Result<bool>;
}

/// A directory that accepts every member and label.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

impl ReferenceDirectory for OpenDirectory {
    fn member_exists(&self, _organization_id: &str, _member_id: &str) -> Result<bool> {
        Ok(true)
    }

    fn label_exists(&self, _organization_id: &str, _label: &str) -> Result<bool> {
        Ok(true)
    }
}

/// What executing one action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The task was written; holds the stored result.
    Applied(Task),
    /// The task already had the requested state; nothing was written.
    Unchanged,
}

/// Result of running one matched rule.
#[derive(Debug)]
pub struct RuleExecution {
    /// Rule id.
    pub rule_id: String,
    /// Rule name, for reports.
    pub rule_name: String,
    /// What happened.
    pub result: Result<ActionOutcome>,
}

/// Trigger types that occurred in `event`.
pub fn triggered_types(event: &LifecycleEvent, workflow: &Workflow) -> Vec<TriggerType> {
    match event {
        LifecycleEvent::Created { .. } => vec![TriggerType::TaskCreated],
        LifecycleEvent::Updated { task, previous } => {
            let mut types = vec![TriggerType::TaskUpdated];
            if event.became_complete(workflow) {
                types.push(TriggerType::TaskCompleted);
            }
            let (new, old) = (as_document(task), as_document(previous));
            for kind in TriggerType::CHANGE_TRIGGERS {
                if let Some(field) = kind.watched_field() {
                    if values_differ(lookup(&new, field), lookup(&old, field)) {
                        types.push(kind);
                    }
                }
            }
            types
        }
        LifecycleEvent::Deleted { .. } => Vec::new(),
    }
}

/// Whether every filter of `trigger` holds for `task`.
///
/// For a `*.changed` trigger, a filter on the watched field additionally
/// requires that field to differ from `previous`.
pub fn filter_matches(trigger: &Trigger, task: &Task, previous: Option<&Task>) -> bool {
    let new = as_document(task);
    let old = previous.map(as_document);
    trigger.filters.iter().all(|(field, expected)| {
        if !value_matches(lookup(&new, field), expected) {
            return false;
        }
        match (trigger.kind.watched_field(), &old) {
            (Some(watched), Some(old)) if watched == field => {
                values_differ(lookup(&new, field), lookup(old, field))
            }
            _ => true,
        }
    })
}

fn as_document(task: &Task) -> Value {
    serde_json::to_value(task).unwrap_or(Value::Null)
}

/// Resolve a field name, following dots into nested objects.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |value, segment| value.get(segment))
}

fn value_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual.unwrap_or(&Value::Null), expected) {
        (actual, Value::Null) => actual.is_null(),
        (Value::Array(items), Value::Array(wanted)) => {
            wanted.iter().all(|w| items.iter().any(|i| loose_eq(i, w)))
                && items.iter().all(|i| wanted.iter().any(|w| loose_eq(i, w)))
        }
        (Value::Array(items), scalar) => items.iter().any(|i| loose_eq(i, scalar)),
        (actual, expected) => loose_eq(actual, expected),
    }
}

/// Equality with case-insensitive strings and numeric comparison across representations.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

/// Strict change detection; arrays compare as sets.
fn values_differ(a: Option<&Value>, b: Option<&Value>) -> bool {
    let (a, b) = (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null));
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            let a: BTreeSet<String> = a.iter().map(Value::to_string).collect();
            let b: BTreeSet<String> = b.iter().map(Value::to_string).collect();
            a != b
        }
        _ => a != b,
    }
}

/// Evaluates rules against lifecycle events and applies their actions.
pub struct AutomationEngine<'a> {
    store: &'a dyn TaskStore,
    directory: &'a dyn ReferenceDirectory,
    max_retries: u32,
}

impl<'a> AutomationEngine<'a> {
    /// Create an engine writing to `store`.
    pub fn new(store: &'a dyn TaskStore, directory: &'a dyn ReferenceDirectory) -> Self {
        Self { store, directory, max_retries: 0 }
    }

    /// Retry an action this many times after a transient store error.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Rules from `rules` that fire for `event`.
    pub fn evaluate<'r>(
        rules: &'r [AutomationRule],
        event: &LifecycleEvent,
        workflow: &Workflow,
    ) -> Vec<&'r AutomationRule> {
        let task = event.task();
        let occurred = triggered_types(event, workflow);
        rules
            .iter()
            .filter(|rule| {
                rule.enabled
                    && rule.organization_id == task.organization_id
                    && occurred.contains(&rule.trigger.kind)
                    && filter_matches(&rule.trigger, task, event.previous())
            })
            .collect()
    }

    /// Match `rules` against `event`, then run each matched rule's action.
    ///
    /// A failing rule does not stop the others.
    pub fn run(
        &self,
        rules: &[AutomationRule],
        event: &LifecycleEvent,
        workflow: &Workflow,
    ) -> Vec<RuleExecution> {
        let matched = Self::evaluate(rules, event, workflow);
        debug!(task = %event.task().id, candidates = rules.len(), matched = matched.len(), "Evaluated automation rules");

        matched
            .into_iter()
            .map(|rule| {
                let result = self.execute(rule, &event.task().id);
                match result {
                    Ok(ActionOutcome::Applied(_)) => {
                        info!(rule = %rule.id, task = %event.task().id, action = %rule.action, "Automation rule applied");
                    }
                    Ok(ActionOutcome::Unchanged) => {
                        debug!(rule = %rule.id, task = %event.task().id, "Automation rule left task unchanged");
                    }
                    Err(ref err) => {
                        warn!(rule = %rule.id, task = %event.task().id, error = %err, "Automation rule failed");
                    }
                }
                RuleExecution { rule_id: rule.id.clone(), rule_name: rule.name.clone(), result }
            })
            .collect()
    }

    /// Apply one rule's action to the current state of `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reference`] when the action names a missing member or
    /// label, [`Error::TaskNotFound`] when the task is gone, and store errors
    /// once retries are exhausted.
    pub fn execute(&self, rule: &AutomationRule, task_id: &str) -> Result<ActionOutcome> {
        let mut attempt = 0;
        loop {
            match self.try_execute(rule, task_id) {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(rule = %rule.id, task = task_id, attempt, error = %err, "Retrying automation action");
                }
                result => return result,
            }
        }
    }

    fn try_execute(&self, rule: &AutomationRule, task_id: &str) -> Result<ActionOutcome> {
        let task =
            self.store.get_task(task_id)?.ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        self.check_references(&rule.action, &task.organization_id)?;

        let Some(mut patch) = patch_for(&rule.action, &task)? else {
            return Ok(ActionOutcome::Unchanged);
        };
        patch
            .history
            .push(HistoryEntry::now(format!("automation '{}': {}", rule.name, rule.action)));

        let mut updated = self.store.atomic_batch(&[TaskWrite::guarded(&task, patch)])?;
        updated
            .pop()
            .map(ActionOutcome::Applied)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    fn check_references(&self, action: &Action, organization_id: &str) -> Result<()> {
        match action {
            Action::Assign { assignee_id } => {
                if !self.directory.member_exists(organization_id, assignee_id)? {
                    return Err(Error::Reference(format!("member '{assignee_id}' no longer exists")));
                }
            }
            Action::AddLabel { label } => {
                if !self.directory.label_exists(organization_id, label)? {
                    return Err(Error::Reference(format!("label '{label}' no longer exists")));
                }
            }
            Action::SetPriority { .. } | Action::RemoveLabel { .. } => {}
        }
        Ok(())
    }
}

/// The patch an action makes to `task`, or `None` if it would change nothing.
///
/// # Errors
///
/// Returns a validation error for an unparseable priority.
pub fn patch_for(action: &Action, task: &Task) -> Result<Option<TaskPatch>> {
    let patch = match action {
        Action::Assign { assignee_id } => {
            if task.assignee_ids.len() == 1 && &task.assignee_ids[0] == assignee_id {
                return Ok(None);
            }
            TaskPatch { assignee_ids: Some(vec![assignee_id.clone()]), ..Default::default() }
        }
        Action::SetPriority { priority } => {
            let priority = parse_priority(priority)?;
            if task.priority == priority {
                return Ok(None);
            }
            TaskPatch { priority: Some(priority), ..Default::default() }
        }
        Action::AddLabel { label } => {
            if task.has_label(label) {
                return Ok(None);
            }
            let mut labels = task.labels.clone();
            labels.push(label.clone());
            TaskPatch { labels: Some(labels), ..Default::default() }
        }
        Action::RemoveLabel { label } => {
            if !task.has_label(label) {
                return Ok(None);
            }
            let labels = task.labels.iter().filter(|l| *l != label).cloned().collect();
            TaskPatch { labels: Some(labels), ..Default::default() }
        }
    };
    Ok(Some(patch))
}
