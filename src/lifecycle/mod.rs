//! Task lifecycle events and the cascades they drive.
//!
//! A task mutation produces one [`LifecycleEvent`]. The
//! [`LifecycleEngine`](dispatch::LifecycleEngine) runs a fixed pipeline on it:
//!
//! 1. dependency cascade ([`dependency`])
//! 2. recurrence successor ([`recurrence`])
//! 3. automation rules ([`crate::automation`])
//! 4. external notifiers ([`crate::notify`])
//!
//! Every step reports into a [`DispatchReport`]; no step can fail the
//! mutation that produced the event.

pub mod dependency;
pub mod dispatch;
pub mod recurrence;

pub use dependency::CascadeSummary;
pub use dispatch::{LifecycleEngine, Mutation};
pub use recurrence::RecurrenceOutcome;

use crate::automation::RuleExecution;
use crate::config::Workflow;
use crate::error::Error;
use crate::tasks::Task;
use serde::Serialize;

/// Something that happened to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A task was created.
    Created {
        /// The stored task.
        task: Task,
    },
    /// A task was updated.
    Updated {
        /// State after the update.
        task: Task,
        /// State before the update.
        previous: Task,
    },
    /// A task was deleted.
    Deleted {
        /// Last stored state.
        task: Task,
    },
}

impl LifecycleEvent {
    /// The task the event concerns, in its newest known state.
    pub const fn task(&self) -> &Task {
        match self {
            Self::Created { task } | Self::Updated { task, .. } | Self::Deleted { task } => task,
        }
    }

    /// The state before an update.
    pub const fn previous(&self) -> Option<&Task> {
        match self {
            Self::Updated { previous, .. } => Some(previous),
            Self::Created { .. } | Self::Deleted { .. } => None,
        }
    }

    /// Short name used in logs and the event journal.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }

    /// Whether the task moved into the terminal-complete status.
    pub fn became_complete(&self, workflow: &Workflow) -> bool {
        match self {
            Self::Updated { task, previous } => {
                workflow.is_complete(&task.status) && !workflow.is_complete(&previous.status)
            }
            Self::Created { .. } | Self::Deleted { .. } => false,
        }
    }

    /// Whether dependents of this task may need their block flag recomputed.
    pub fn release_changed(&self, workflow: &Workflow) -> bool {
        match self {
            Self::Updated { task, previous } => {
                workflow.releases_dependents(&task.status)
                    != workflow.releases_dependents(&previous.status)
            }
            Self::Deleted { .. } => true,
            Self::Created { .. } => false,
        }
    }

    /// Whether the task's own blocker set was set or changed.
    pub fn blockers_changed(&self) -> bool {
        match self {
            Self::Created { task } => !task.blocked_by.is_empty(),
            Self::Updated { task, previous } => task.blocked_by != previous.blocked_by,
            Self::Deleted { .. } => false,
        }
    }
}

/// Outcome of one pipeline step.
#[derive(Debug)]
pub enum StepOutcome<T> {
    /// The event did not call for this step.
    Skipped,
    /// The step ran to completion.
    Completed(T),
    /// The step failed; its own writes were not applied.
    Failed(Error),
}

impl<T> StepOutcome<T> {
    /// Wrap a step result.
    pub fn from_result(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(err) => Self::Failed(err),
        }
    }

    /// The error, if the step failed.
    pub const fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Skipped | Self::Completed(_) => None,
        }
    }

    /// The value, if the step completed.
    pub const fn completed(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped | Self::Failed(_) => None,
        }
    }

    /// Whether the step was skipped.
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Non-fatal findings surfaced during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// These tasks block each other in a loop and stay blocked until a human
    /// breaks it.
    CycleWarning {
        /// Task ids along the cycle, starting at the task that was examined.
        task_ids: Vec<String>,
    },
}

/// Result of one notifier call.
#[derive(Debug)]
pub struct NotificationResult {
    /// Notifier name.
    pub notifier: String,
    /// Call result.
    pub result: crate::error::Result<()>,
}

/// Everything that happened while dispatching one event.
#[derive(Debug)]
pub struct DispatchReport {
    /// Task the event concerned.
    pub task_id: String,
    /// Dependency cascade.
    pub dependency: StepOutcome<CascadeSummary>,
    /// Recurrence successor.
    pub recurrence: StepOutcome<RecurrenceOutcome>,
    /// Automation rules, one entry per matched rule.
    pub automation: StepOutcome<Vec<RuleExecution>>,
    /// Notifier calls.
    pub notifications: Vec<NotificationResult>,
    /// Non-fatal findings.
    pub diagnostics: Vec<Diagnostic>,
}

impl DispatchReport {
    /// An empty report with every step skipped.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            dependency: StepOutcome::Skipped,
            recurrence: StepOutcome::Skipped,
            automation: StepOutcome::Skipped,
            notifications: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Human-readable description of every failed side effect.
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if let Some(err) = self.dependency.error() {
            failures.push(format!("dependency cascade: {err}"));
        }
        if let Some(err) = self.recurrence.error() {
            failures.push(format!("recurrence: {err}"));
        }
        match &self.automation {
            StepOutcome::Failed(err) => failures.push(format!("automation: {err}")),
            StepOutcome::Completed(executions) => {
                for execution in executions {
                    if let Err(ref err) = execution.result {
                        failures.push(format!("rule '{}': {err}", execution.rule_name));
                    }
                }
            }
            StepOutcome::Skipped => {}
        }
        for notification in &self.notifications {
            if let Err(ref err) = notification.result {
                failures.push(format!("notifier '{}': {err}", notification.notifier));
            }
        }
        failures
    }

    /// Whether every side effect succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }
}
