//! Integration tests for `tasklife` against the `SQLite` stores.

use std::cell::Cell;
use std::path::Path;

use chrono::NaiveDate;
use tasklife::automation::{
    Action, AutomationRule, RuleStore, SqliteRuleStore, Trigger, TriggerType,
};
use tasklife::config::EngineConfig;
use tasklife::error::{Error, Result};
use tasklife::lifecycle::{LifecycleEngine, RecurrenceOutcome};
use tasklife::tasks::{
    Frequency, NewTask, Recurrence, SqliteTaskStore, Task, TaskFilter, TaskStore, TaskWrite,
};
use tasklife::VERSION;
use tempfile::TempDir;

/// Delegates to `SQLite` but fails chosen non-empty batches with a transient error.
struct FlakyStore {
    inner: SqliteTaskStore,
    skip: Cell<u32>,
    fail: Cell<u32>,
}

impl FlakyStore {
    fn new(db_path: &Path) -> Self {
        Self { inner: SqliteTaskStore::new(db_path).unwrap(), skip: Cell::new(0), fail: Cell::new(0) }
    }

    fn fail_batches(&self, skip: u32, count: u32) {
        self.skip.set(skip);
        self.fail.set(count);
    }
}

impl TaskStore for FlakyStore {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.inner.get_task(id)
    }

    fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.inner.query_tasks(filter)
    }

    fn atomic_batch(&self, writes: &[TaskWrite]) -> Result<Vec<Task>> {
        if !writes.is_empty() {
            if self.skip.get() > 0 {
                self.skip.set(self.skip.get() - 1);
            } else if self.fail.get() > 0 {
                self.fail.set(self.fail.get() - 1);
                return Err(Error::Transient("database is busy".to_string()));
            }
        }
        self.inner.atomic_batch(writes)
    }

    fn create_task(&self, new: NewTask) -> Result<Task> {
        self.inner.create_task(new)
    }

    fn delete_task(&self, id: &str) -> Result<bool> {
        self.inner.delete_task(id)
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn test_version_exists() {
    assert!(!VERSION.is_empty());
}

#[test]
fn test_completion_unblocks_and_rolls_over() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.sqlite3");
    let engine = LifecycleEngine::new(
        SqliteTaskStore::new(&db).unwrap(),
        SqliteRuleStore::new(&db).unwrap(),
        EngineConfig::default(),
    );

    let a = engine
        .create_task(NewTask {
            status: Some("In Progress".to_string()),
            due_date: Some(date(2024, 6, 3)),
            recurring: Some(Recurrence::every(1, Frequency::Weekly)),
            ..NewTask::new("acme", "Weekly deploy")
        })
        .unwrap()
        .task;
    let b = engine
        .create_task(NewTask {
            blocked_by: [a.id.clone()].into_iter().collect(),
            ..NewTask::new("acme", "Announce deploy")
        })
        .unwrap()
        .task;
    assert!(b.is_blocked);

    let done = engine.complete_task(&a.id).unwrap();
    assert!(done.report.is_clean(), "failures: {:?}", done.report.failures());
    assert_eq!(done.task.status, "Done");
    assert!(done.task.completed_at.is_some());

    let b = engine.store().get_task(&b.id).unwrap().unwrap();
    assert!(!b.is_blocked);

    let Some(RecurrenceOutcome::Created(next)) = done.report.recurrence.completed() else {
        panic!("expected a successor, got {:?}", done.report.recurrence);
    };
    assert_eq!(next.due_date, Some(date(2024, 6, 10)));
    assert_eq!(next.status, "Todo");
    assert!(next.completed_at.is_none());
    assert_eq!(next.recurred_from.as_deref(), Some(a.id.as_str()));

    // The stores persist across reopen
    let reopened = SqliteTaskStore::new(&db).unwrap();
    let stored = reopened.get_task(&next.id).unwrap().unwrap();
    assert_eq!(stored.title, "Weekly deploy");
}

#[test]
fn test_transient_cascade_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.sqlite3");
    let engine = LifecycleEngine::new(
        FlakyStore::new(&db),
        SqliteRuleStore::new(&db).unwrap(),
        EngineConfig::default(),
    );

    let a = engine.create_task(NewTask::new("acme", "Blocker")).unwrap().task;
    let b = engine
        .create_task(NewTask {
            blocked_by: [a.id.clone()].into_iter().collect(),
            ..NewTask::new("acme", "Dependent")
        })
        .unwrap()
        .task;

    // The completion write goes through; the first cascade write fails once
    engine.store().fail_batches(1, 1);
    let done = engine.complete_task(&a.id).unwrap();

    let cascade = done.report.dependency.completed().unwrap();
    assert_eq!(cascade.unblocked, vec![b.id.clone()]);
    assert!(!engine.store().get_task(&b.id).unwrap().unwrap().is_blocked);
}

#[test]
fn test_stored_rules_fire_on_mutation() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.sqlite3");
    let rules = SqliteRuleStore::new(&db).unwrap();
    rules
        .upsert_rule(AutomationRule::new(
            "acme",
            "Triage new work",
            Trigger::on(TriggerType::TaskCreated),
            Action::AddLabel { label: "triage".to_string() },
        ))
        .unwrap();

    let engine =
        LifecycleEngine::new(SqliteTaskStore::new(&db).unwrap(), rules, EngineConfig::default());

    let created = engine.create_task(NewTask::new("acme", "Fix login")).unwrap();
    assert!(created.report.is_clean());

    let stored = engine.store().get_task(&created.task.id).unwrap().unwrap();
    assert!(stored.has_label("triage"));

    // Rules of other organizations do not apply
    let other = engine.create_task(NewTask::new("globex", "Fix login")).unwrap();
    let stored = engine.store().get_task(&other.task.id).unwrap().unwrap();
    assert!(!stored.has_label("triage"));
}
