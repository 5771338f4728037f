//! In-memory stores and test doubles.
//!
//! [`MemoryTaskStore`] and [`MemoryRuleStore`] implement the same contracts as
//! the `SQLite` stores, so they double as embeddable stores for callers that
//! keep tasks elsewhere. The remaining types are mocks for tests.

use crate::automation::rules::prepare_rule;
use crate::automation::{AutomationRule, ReferenceDirectory, RuleStore};
use crate::error::{Error, Result};
use crate::lifecycle::{DispatchReport, LifecycleEvent};
use crate::notify::Notifier;
use crate::tasks::store::{apply_write, prepare_new_task};
use crate::tasks::{NewTask, Task, TaskFilter, TaskStore, TaskWrite};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

/// A task store held in memory, in creation order.
///
/// Failures can be injected into [`TaskStore::atomic_batch`] to exercise
/// retry paths.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RefCell<Vec<Task>>,
    batches_before_failure: Cell<usize>,
    failing_batches: Cell<u32>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` non-empty batches fail with a transient error.
    pub fn fail_next_batches(&self, count: u32) {
        self.fail_batches(0, count);
    }

    /// Let `skip` non-empty batches succeed, then fail the following `count`.
    pub fn fail_batches(&self, skip: usize, count: u32) {
        self.batches_before_failure.set(skip);
        self.failing_batches.set(count);
    }

    /// Every stored task.
    pub fn all(&self) -> Vec<Task> {
        self.tasks.borrow().clone()
    }

    fn injected_failure(&self) -> Option<Error> {
        if self.failing_batches.get() == 0 {
            return None;
        }
        let skip = self.batches_before_failure.get();
        if skip > 0 {
            self.batches_before_failure.set(skip - 1);
            return None;
        }
        self.failing_batches.set(self.failing_batches.get() - 1);
        Some(Error::Transient("injected batch failure".to_string()))
    }
}

impl TaskStore for MemoryTaskStore {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.borrow().iter().find(|t| t.id == id).cloned())
    }

    fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.tasks.borrow().iter().filter(|t| filter.matches(t)).cloned().collect())
    }

    fn atomic_batch(&self, writes: &[TaskWrite]) -> Result<Vec<Task>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        // Apply to a copy and swap it in only if every write succeeds
        let mut staged = self.tasks.borrow().clone();
        let mut updated = Vec::with_capacity(writes.len());
        for write in writes {
            let index = staged.iter().position(|t| t.id == write.id);
            let task = apply_write(index.map(|i| staged[i].clone()), write)?;
            if let Some(i) = index {
                staged[i] = task.clone();
            }
            updated.push(task);
        }
        *self.tasks.borrow_mut() = staged;
        Ok(updated)
    }

    fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = prepare_new_task(new)?;
        let mut tasks = self.tasks.borrow_mut();
        if let Some(ref token) = task.recurrence_token {
            if let Some(existing) = tasks.iter().find(|t| t.recurrence_token.as_ref() == Some(token)) {
                return Err(Error::Conflict {
                    key: token.clone(),
                    detail: format!("recurrence token already used by {}", existing.id),
                });
            }
        }
        tasks.push(task.clone());
        Ok(task)
    }

    fn delete_task(&self, id: &str) -> Result<bool> {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        Ok(tasks.len() < before)
    }
}

/// A rule store held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RefCell<Vec<AutomationRule>>,
}

impl MemoryRuleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for MemoryRuleStore {
    fn list_rules(&self, organization_id: &str) -> Result<Vec<AutomationRule>> {
        Ok(self
            .rules
            .borrow()
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .cloned()
            .collect())
    }

    fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>> {
        Ok(self.rules.borrow().iter().find(|r| r.id == id).cloned())
    }

    fn upsert_rule(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let rule = prepare_rule(rule)?;
        let mut rules = self.rules.borrow_mut();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule.clone(),
            None => rules.push(rule.clone()),
        }
        Ok(rule)
    }

    fn delete_rule(&self, id: &str) -> Result<()> {
        let mut rules = self.rules.borrow_mut();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(Error::RuleNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// A reference directory with an explicit member and label list.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    members: RefCell<HashSet<(String, String)>>,
    labels: RefCell<HashSet<(String, String)>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member.
    #[must_use]
    pub fn with_member(self, organization_id: &str, member_id: &str) -> Self {
        self.members.borrow_mut().insert((organization_id.to_string(), member_id.to_string()));
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(self, organization_id: &str, label: &str) -> Self {
        self.labels.borrow_mut().insert((organization_id.to_string(), label.to_string()));
        self
    }

    /// Remove a member, as when someone leaves the organization.
    pub fn remove_member(&self, organization_id: &str, member_id: &str) {
        self.members.borrow_mut().remove(&(organization_id.to_string(), member_id.to_string()));
    }
}

impl ReferenceDirectory for MemoryDirectory {
    fn member_exists(&self, organization_id: &str, member_id: &str) -> Result<bool> {
        Ok(self.members.borrow().contains(&(organization_id.to_string(), member_id.to_string())))
    }

    fn label_exists(&self, organization_id: &str, label: &str) -> Result<bool> {
        Ok(self.labels.borrow().contains(&(organization_id.to_string(), label.to_string())))
    }
}

/// A notifier that records `(event kind, task id)` pairs.
///
/// Clones share the same record, so a test can keep one clone and hand the
/// other to the engine.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Rc<RefCell<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    /// Create a notifier with an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far.
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, event: &LifecycleEvent, _report: &DispatchReport) -> Result<()> {
        self.events.borrow_mut().push((event.kind().to_string(), event.task().id.clone()));
        Ok(())
    }
}

/// A notifier that always fails, for testing error paths.
#[derive(Debug)]
pub struct FailingNotifier {
    name: String,
}

impl FailingNotifier {
    /// Create a failing notifier with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, _event: &LifecycleEvent, _report: &DispatchReport) -> Result<()> {
        Err(std::io::Error::other(format!("{} is unreachable", self.name)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{Action, Trigger, TriggerType};
    use crate::tasks::TaskPatch;

    fn new_task(title: &str) -> NewTask {
        NewTask { status: Some("Todo".to_string()), ..NewTask::new("acme", title) }
    }

    #[test]
    fn test_memory_store_batch_is_all_or_nothing() {
        let store = MemoryTaskStore::new();
        let a = store.create_task(new_task("A")).unwrap();

        let err = store
            .atomic_batch(&[
                TaskWrite::guarded(&a, TaskPatch { is_blocked: Some(true), ..Default::default() }),
                TaskWrite::unguarded("ghost", TaskPatch::default()),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
        assert!(!store.get_task(&a.id).unwrap().unwrap().is_blocked);
        assert_eq!(store.get_task(&a.id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryTaskStore::new();
        let a = store.create_task(new_task("A")).unwrap();
        let write = TaskWrite::unguarded(&a.id, TaskPatch { title: Some("A2".to_string()), ..Default::default() });

        store.fail_batches(1, 1);
        assert!(store.atomic_batch(&[]).unwrap().is_empty());
        store.atomic_batch(&[write.clone()]).unwrap();
        assert!(store.atomic_batch(&[write.clone()]).unwrap_err().is_transient());
        store.atomic_batch(&[write]).unwrap();
        assert_eq!(store.get_task(&a.id).unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_memory_store_token_uniqueness() {
        let store = MemoryTaskStore::new();
        let token = Some("a@2024-06-03T09:00:00+00:00".to_string());
        store.create_task(NewTask { recurrence_token: token.clone(), ..new_task("Next") }).unwrap();
        let err = store.create_task(NewTask { recurrence_token: token, ..new_task("Next") }).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_memory_rule_store() {
        let store = MemoryRuleStore::new();
        let rule = store
            .upsert_rule(AutomationRule::new(
                "acme",
                "Triage",
                Trigger::on(TriggerType::TaskCreated),
                Action::AddLabel { label: "triage".to_string() },
            ))
            .unwrap();
        assert!(!rule.id.is_empty());
        assert_eq!(store.list_rules("acme").unwrap().len(), 1);

        let mut renamed = rule.clone();
        renamed.name = "Triage all".to_string();
        store.upsert_rule(renamed).unwrap();
        assert_eq!(store.get_rule(&rule.id).unwrap().unwrap().name, "Triage all");

        store.delete_rule(&rule.id).unwrap();
        assert!(matches!(store.delete_rule(&rule.id), Err(Error::RuleNotFound(_))));
    }

    #[test]
    fn test_memory_directory() {
        let directory = MemoryDirectory::new().with_member("acme", "sam").with_label("acme", "ops");
        assert!(directory.member_exists("acme", "sam").unwrap());
        assert!(!directory.member_exists("other", "sam").unwrap());
        assert!(directory.label_exists("acme", "ops").unwrap());

        directory.remove_member("acme", "sam");
        assert!(!directory.member_exists("acme", "sam").unwrap());
    }

    #[test]
    fn test_failing_notifier() {
        let notifier = FailingNotifier::new("digest");
        let task = store_task();
        let result = notifier.notify(&LifecycleEvent::Created { task }, &DispatchReport::new("a"));
        assert!(result.unwrap_err().to_string().contains("digest"));
    }

    fn store_task() -> Task {
        MemoryTaskStore::new().create_task(new_task("A")).unwrap()
    }
}
