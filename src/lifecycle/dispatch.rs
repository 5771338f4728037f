//! The lifecycle engine: primary task mutations and the pipeline they drive.

use super::{
    dependency, recurrence, Diagnostic, DispatchReport, LifecycleEvent, NotificationResult,
    StepOutcome,
};
use crate::automation::{
    AutomationEngine, OpenDirectory, ReferenceDirectory, RuleExecution, RuleStore,
};
use crate::config::{EngineConfig, Workflow};
use crate::error::{Error, Result};
use crate::lifecycle::{CascadeSummary, RecurrenceOutcome};
use crate::notify::Notifier;
use crate::tasks::{HistoryEntry, NewTask, Recurrence, Task, TaskPatch, TaskStore, TaskWrite};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A persisted mutation and what its side effects did.
#[derive(Debug)]
pub struct Mutation {
    /// The task as stored by the primary write (for deletes, its last state).
    pub task: Task,
    /// Side-effect report.
    pub report: DispatchReport,
}

/// Owns the task and rule stores and runs every mutation through the
/// dependency, recurrence, automation and notification steps.
pub struct LifecycleEngine<S, R> {
    store: S,
    rules: R,
    config: EngineConfig,
    directory: Box<dyn ReferenceDirectory>,
    notifiers: Vec<Box<dyn Notifier>>,
}

impl<S: TaskStore, R: RuleStore> LifecycleEngine<S, R> {
    /// Create an engine that accepts every member and label reference.
    pub fn new(store: S, rules: R, config: EngineConfig) -> Self {
        Self { store, rules, config, directory: Box::new(OpenDirectory), notifiers: Vec::new() }
    }

    /// Use `directory` to check assignees and labels named by rule actions.
    #[must_use]
    pub fn with_directory(mut self, directory: impl ReferenceDirectory + 'static) -> Self {
        self.directory = Box::new(directory);
        self
    }

    /// Call `notifier` after every dispatch.
    #[must_use]
    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }

    /// The task store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The rule store.
    pub const fn rules(&self) -> &R {
        &self.rules
    }

    /// The engine configuration.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a task and dispatch its `created` event.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown status or malformed
    /// recurrence rule, or a store error if the task could not be saved.
    /// Side-effect failures are reported in the returned [`Mutation`].
    pub fn create_task(&self, mut new: NewTask) -> Result<Mutation> {
        if new.title.trim().is_empty() {
            return Err(Error::validation("task title is empty"));
        }
        if new.organization_id.trim().is_empty() {
            return Err(Error::validation("task has no organization"));
        }
        let workflow = self.config.workflow_for(&new.organization_id);

        let status = new.status.take().unwrap_or_else(|| workflow.initial.clone());
        check_status(workflow, &status)?;
        if let Some(ref rule) = new.recurring {
            validate_recurrence(rule)?;
        }

        let statuses =
            dependency::checked_blocker_statuses(&self.store, &new.organization_id, &new.blocked_by)?;
        new.is_blocked = dependency::any_active_blocker(&new.blocked_by, &statuses, workflow);
        dedup(&mut new.labels);
        dedup(&mut new.assignee_ids);
        if workflow.is_complete(&status) && new.completed_at.is_none() {
            new.completed_at = Some(Utc::now());
        }
        new.status = Some(status);
        new.history.push(HistoryEntry::now("created"));

        let task = self.store.create_task(new)?;
        info!(task = %task.id, organization = %task.organization_id, status = %task.status, "Task created");

        let event = LifecycleEvent::Created { task };
        let report = self.on_task_mutated(&event);
        Ok(Mutation { task: self.settled(event), report })
    }

    /// Apply `patch` to a task and dispatch its `updated` event.
    ///
    /// Entering the complete status stamps `completedAt`; leaving it clears
    /// it. A changed blocker set recomputes `isBlocked` in the same write.
    /// `isBlocked` itself is derived and cannot be patched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`], a validation error, or a store error
    /// once retries are exhausted.
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Mutation> {
        if patch.is_blocked.is_some() {
            return Err(Error::validation("isBlocked is derived from blockedBy and cannot be set"));
        }
        if patch.is_empty() {
            return Err(Error::validation("nothing to update"));
        }
        if patch.blocked_by.as_ref().is_some_and(|b| b.contains(id)) {
            return Err(Error::validation(format!("task {id} cannot block itself")));
        }
        if let Some(Some(ref rule)) = patch.recurring {
            validate_recurrence(rule)?;
        }

        let (task, previous) = self.retrying("update", id, || {
            let previous =
                self.store.get_task(id)?.ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            let patch = self.complete_patch(&previous, patch.clone())?;
            let mut updated = self.store.atomic_batch(&[TaskWrite::guarded(&previous, patch)])?;
            let task = updated.pop().ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            Ok((task, previous))
        })?;
        info!(task = %task.id, version = task.version, "Task updated");

        let event = LifecycleEvent::Updated { task, previous };
        let report = self.on_task_mutated(&event);
        Ok(Mutation { task: self.settled(event), report })
    }

    /// Move a task into its organization's complete status.
    ///
    /// # Errors
    ///
    /// As [`Self::update_task`].
    pub fn complete_task(&self, id: &str) -> Result<Mutation> {
        let task = self.store.get_task(id)?.ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let complete = self.config.workflow_for(&task.organization_id).complete.clone();
        self.update_task(id, TaskPatch { status: Some(complete), ..Default::default() })
    }

    /// Delete a task and dispatch its `deleted` event, releasing dependents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] or a store error.
    pub fn delete_task(&self, id: &str) -> Result<Mutation> {
        let task = self.store.get_task(id)?.ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if !self.store.delete_task(id)? {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        info!(task = %id, "Task deleted");

        let event = LifecycleEvent::Deleted { task };
        let report = self.on_task_mutated(&event);
        Ok(Mutation { task: into_task(event), report })
    }

    /// Turn a caller's patch into the stored patch: status bookkeeping,
    /// blocker recomputation and history.
    fn complete_patch(&self, previous: &Task, mut patch: TaskPatch) -> Result<TaskPatch> {
        let workflow = self.config.workflow_for(&previous.organization_id);

        if let Some(ref status) = patch.status {
            check_status(workflow, status)?;
            let was_complete = workflow.is_complete(&previous.status);
            let is_complete = workflow.is_complete(status);
            if is_complete && !was_complete && patch.completed_at.is_none() {
                patch.completed_at = Some(Some(Utc::now()));
            } else if was_complete && !is_complete {
                patch.completed_at = Some(None);
            }
            if *status != previous.status {
                patch.history.push(HistoryEntry::now(format!(
                    "status changed from {} to {status}",
                    previous.status
                )));
            }
        }

        if let Some(ref blocked_by) = patch.blocked_by {
            let statuses = dependency::checked_blocker_statuses(
                &self.store,
                &previous.organization_id,
                blocked_by,
            )?;
            patch.is_blocked = Some(dependency::any_active_blocker(blocked_by, &statuses, workflow));
        }
        if let Some(ref mut labels) = patch.labels {
            dedup(labels);
        }
        if let Some(ref mut assignees) = patch.assignee_ids {
            dedup(assignees);
        }

        if patch.history.is_empty() {
            patch.history.push(HistoryEntry::now("updated"));
        }
        Ok(patch)
    }

    /// Run the side-effect pipeline for one event.
    ///
    /// Never fails: each step's outcome is recorded in the report and
    /// failures are logged.
    pub fn on_task_mutated(&self, event: &LifecycleEvent) -> DispatchReport {
        let task = event.task();
        let workflow = self.config.workflow_for(&task.organization_id);
        let mut report = DispatchReport::new(&task.id);
        debug!(task = %task.id, event = event.kind(), "Dispatching lifecycle event");

        report.dependency = self.dependency_step(event, workflow);
        if let Some(summary) = report.dependency.completed() {
            report.diagnostics.extend(
                summary.cycles.iter().map(|ids| Diagnostic::CycleWarning { task_ids: ids.clone() }),
            );
        }
        report.recurrence = self.recurrence_step(event, workflow);
        report.automation = self.automation_step(event, workflow);

        for (step, error) in [
            ("dependency", report.dependency.error()),
            ("recurrence", report.recurrence.error()),
            ("automation", report.automation.error()),
        ] {
            if let Some(err) = error {
                warn!(task = %task.id, step, error = %err, "Lifecycle step failed");
            }
        }

        for notifier in &self.notifiers {
            let result = notifier.notify(event, &report);
            if let Err(ref err) = result {
                warn!(task = %task.id, notifier = notifier.name(), error = %err, "Notifier failed");
            }
            report
                .notifications
                .push(NotificationResult { notifier: notifier.name().to_string(), result });
        }

        report
    }

    fn dependency_step(
        &self,
        event: &LifecycleEvent,
        workflow: &Workflow,
    ) -> StepOutcome<CascadeSummary> {
        let release = event.release_changed(workflow);
        let own = event.blockers_changed();
        if !release && !own {
            return StepOutcome::Skipped;
        }

        let task = event.task();
        StepOutcome::from_result(self.retrying("dependency", &task.id, || {
            let mut summary = if release {
                dependency::cascade_from_blocker(&task.id, &task.organization_id, &self.store, workflow)?
            } else {
                CascadeSummary::default()
            };
            if own {
                summary.examined += 1;
                if let Some(refreshed) = dependency::refresh_task(&task.id, &self.store, workflow)? {
                    if refreshed.is_blocked {
                        summary.reblocked.push(refreshed.id);
                    } else {
                        summary.unblocked.push(refreshed.id);
                    }
                }
                if let Some(cycle) = dependency::find_cycle(&self.store, &task.id)? {
                    warn!(task = %task.id, cycle = ?cycle, "Task is permanently blocked by a dependency cycle");
                    summary.cycles.push(cycle);
                }
            }
            Ok(summary)
        }))
    }

    fn recurrence_step(
        &self,
        event: &LifecycleEvent,
        workflow: &Workflow,
    ) -> StepOutcome<RecurrenceOutcome> {
        let task = event.task();
        if !event.became_complete(workflow) || task.recurring.is_none() {
            return StepOutcome::Skipped;
        }
        StepOutcome::from_result(self.retrying("recurrence", &task.id, || {
            recurrence::on_task_completed(task, &self.store, workflow)
        }))
    }

    fn automation_step(
        &self,
        event: &LifecycleEvent,
        workflow: &Workflow,
    ) -> StepOutcome<Vec<RuleExecution>> {
        if matches!(event, LifecycleEvent::Deleted { .. }) {
            return StepOutcome::Skipped;
        }
        let task = event.task();
        let rules = match self.retrying("automation", &task.id, || {
            self.rules.list_rules(&task.organization_id)
        }) {
            Ok(rules) => rules,
            Err(err) => return StepOutcome::Failed(err),
        };

        let engine = AutomationEngine::new(&self.store, self.directory.as_ref())
            .with_max_retries(self.config.max_store_retries);
        StepOutcome::Completed(engine.run(&rules, event, workflow))
    }

    /// The event's task as stored after its side effects ran.
    fn settled(&self, event: LifecycleEvent) -> Task {
        let task = into_task(event);
        match self.store.get_task(&task.id) {
            Ok(Some(current)) => current,
            Ok(None) => task,
            Err(err) => {
                warn!(task = %task.id, error = %err, "Could not re-read task after dispatch");
                task
            }
        }
    }

    /// Run `op`, retrying transient store errors up to the configured limit.
    fn retrying<T>(&self, step: &str, task_id: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.config.max_store_retries => {
                    attempt += 1;
                    debug!(step, task = task_id, attempt, error = %err, "Retrying after transient store error");
                }
                result => return result,
            }
        }
    }
}

/// Drop repeated entries, keeping first occurrences in order.
fn dedup(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}

fn into_task(event: LifecycleEvent) -> Task {
    match event {
        LifecycleEvent::Created { task }
        | LifecycleEvent::Updated { task, .. }
        | LifecycleEvent::Deleted { task } => task,
    }
}

fn check_status(workflow: &Workflow, status: &str) -> Result<()> {
    if workflow.knows(status) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "unknown status '{status}' (expected one of: {})",
            workflow.statuses.join(", ")
        )))
    }
}

fn validate_recurrence(rule: &Recurrence) -> Result<()> {
    if rule.interval == 0 {
        return Err(Error::validation("recurrence interval must be at least 1"));
    }
    if let Some(day) = rule.day_of_month {
        if !(1..=31).contains(&day) {
            return Err(Error::validation(format!("dayOfMonth {day} is outside 1..=31")));
        }
    }
    Ok(())
}
