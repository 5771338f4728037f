//! Blocking relationships between tasks.
//!
//! `is_blocked` is a cache of [`resolve_block_status`]. Whenever a blocker
//! enters or leaves a releasing status (complete or cancelled), or is
//! deleted, every dependent is recomputed from the *current* statuses of its
//! full blocker set. Re-reading instead of patching is what makes two
//! concurrent completions of different blockers converge: whichever cascade
//! runs last sees both.

use crate::config::Workflow;
use crate::error::{Error, Result};
use crate::tasks::{Task, TaskFilter, TaskPatch, TaskStore, TaskWrite};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// What a dependency cascade changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeSummary {
    /// Number of dependents recomputed.
    pub examined: usize,
    /// Dependents that became actionable.
    pub unblocked: Vec<String>,
    /// Dependents that became blocked again.
    pub reblocked: Vec<String>,
    /// Blocking cycles found among dependents that stay blocked.
    pub cycles: Vec<Vec<String>>,
}

/// Compute a task's block flag from the statuses of its blockers.
///
/// Blockers missing from `blocker_statuses` (deleted tasks) do not block.
pub fn resolve_block_status(
    task: &Task,
    blocker_statuses: &HashMap<String, String>,
    workflow: &Workflow,
) -> bool {
    any_active_blocker(&task.blocked_by, blocker_statuses, workflow)
}

/// Whether any of `blocked_by` is in a status that still blocks dependents.
pub fn any_active_blocker<'a>(
    blocked_by: impl IntoIterator<Item = &'a String>,
    blocker_statuses: &HashMap<String, String>,
    workflow: &Workflow,
) -> bool {
    blocked_by.into_iter().any(|id| {
        blocker_statuses.get(id).is_some_and(|status| !workflow.releases_dependents(status))
    })
}

/// Read the current status of every listed blocker that still exists.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn blocker_statuses<'a>(
    store: &dyn TaskStore,
    ids: impl IntoIterator<Item = &'a String>,
) -> Result<HashMap<String, String>> {
    let mut statuses = HashMap::new();
    for id in ids {
        if statuses.contains_key(id) {
            continue;
        }
        if let Some(blocker) = store.get_task(id)? {
            statuses.insert(id.clone(), blocker.status);
        }
    }
    Ok(statuses)
}

/// Read the statuses of the blockers a task in `organization_id` is about to
/// be given.
///
/// Blockers must share the dependent's organization: cascades only look for
/// dependents there, so a cross-organization edge could never be released.
///
/// # Errors
///
/// Returns a validation error naming the first foreign blocker, or a store
/// error.
pub fn checked_blocker_statuses<'a>(
    store: &dyn TaskStore,
    organization_id: &str,
    ids: impl IntoIterator<Item = &'a String>,
) -> Result<HashMap<String, String>> {
    let mut statuses = HashMap::new();
    for id in ids {
        if statuses.contains_key(id) {
            continue;
        }
        if let Some(blocker) = store.get_task(id)? {
            if blocker.organization_id != organization_id {
                return Err(Error::validation(format!(
                    "blocker {id} belongs to organization {}, not {organization_id}",
                    blocker.organization_id
                )));
            }
            statuses.insert(id.clone(), blocker.status);
        }
    }
    Ok(statuses)
}

/// Recompute every dependent of a task that just completed.
///
/// # Errors
///
/// Returns an error if reading fails or the batch write is rejected; in the
/// latter case nothing was written and the cascade can be rerun.
pub fn on_task_completed(
    task: &Task,
    store: &dyn TaskStore,
    workflow: &Workflow,
) -> Result<CascadeSummary> {
    cascade_from_blocker(&task.id, &task.organization_id, store, workflow)
}

/// Recompute every dependent of `blocker_id` and write the changed flags as
/// one atomic batch, each write guarded by the version that was read.
///
/// # Errors
///
/// Returns an error if reading fails or the batch write is rejected.
pub fn cascade_from_blocker(
    blocker_id: &str,
    organization_id: &str,
    store: &dyn TaskStore,
    workflow: &Workflow,
) -> Result<CascadeSummary> {
    let dependents =
        store.query_tasks(&TaskFilter::blocked_by(blocker_id).in_organization(organization_id))?;
    let statuses = blocker_statuses(store, dependents.iter().flat_map(|t| t.blocked_by.iter()))?;

    let mut summary = CascadeSummary { examined: dependents.len(), ..Default::default() };
    let mut writes = Vec::new();
    let mut still_blocked = Vec::new();

    for dependent in &dependents {
        let blocked = resolve_block_status(dependent, &statuses, workflow);
        if blocked {
            still_blocked.push(dependent.id.clone());
        }
        if blocked == dependent.is_blocked {
            continue;
        }
        if blocked {
            summary.reblocked.push(dependent.id.clone());
        } else {
            summary.unblocked.push(dependent.id.clone());
        }
        writes.push(TaskWrite::guarded(
            dependent,
            TaskPatch { is_blocked: Some(blocked), ..Default::default() },
        ));
    }

    store.atomic_batch(&writes)?;
    debug!(
        blocker = blocker_id,
        examined = summary.examined,
        unblocked = summary.unblocked.len(),
        reblocked = summary.reblocked.len(),
        "Dependency cascade applied"
    );

    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for id in still_blocked {
        if let Some(cycle) = find_cycle(store, &id)? {
            let mut key = cycle.clone();
            key.sort();
            if seen.insert(key) {
                warn!(task = %id, cycle = ?cycle, "Task is permanently blocked by a dependency cycle");
                summary.cycles.push(cycle);
            }
        }
    }

    Ok(summary)
}

/// Recompute one task's own block flag, e.g. after its blocker set changed.
///
/// Returns the updated task if the flag changed, `None` otherwise.
///
/// # Errors
///
/// Returns an error if reading fails or the guarded write is rejected.
pub fn refresh_task(
    task_id: &str,
    store: &dyn TaskStore,
    workflow: &Workflow,
) -> Result<Option<Task>> {
    let Some(task) = store.get_task(task_id)? else {
        return Ok(None);
    };
    let statuses = blocker_statuses(store, &task.blocked_by)?;
    let blocked = resolve_block_status(&task, &statuses, workflow);
    if blocked == task.is_blocked {
        return Ok(None);
    }

    let mut updated = store.atomic_batch(&[TaskWrite::guarded(
        &task,
        TaskPatch { is_blocked: Some(blocked), ..Default::default() },
    )])?;
    Ok(updated.pop())
}

/// Find a blocking cycle through `task_id`, following `blocked_by` edges.
///
/// Returns the ids along the cycle, starting with `task_id`.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn find_cycle(store: &dyn TaskStore, task_id: &str) -> Result<Option<Vec<String>>> {
    // Iterative DFS keeping the path to the current node
    let Some(start) = store.get_task(task_id)? else {
        return Ok(None);
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut path: Vec<String> = vec![start.id.clone()];
    let mut stack: Vec<Vec<String>> = vec![start.blocked_by.iter().cloned().collect()];
    visited.insert(start.id);

    while let Some(frontier) = stack.last_mut() {
        let Some(next) = frontier.pop() else {
            stack.pop();
            path.pop();
            continue;
        };
        if next == task_id {
            return Ok(Some(path));
        }
        if !visited.insert(next.clone()) {
            continue;
        }
        if let Some(blocker) = store.get_task(&next)? {
            path.push(next);
            stack.push(blocker.blocked_by.into_iter().collect());
        }
    }

    Ok(None)
}
