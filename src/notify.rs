//! External notification hooks.
//!
//! Notifiers run after the pipeline has finished and see both the event and
//! what the pipeline did with it. Gamification and digest services plug in
//! by implementing [`Notifier`]; [`EventJournal`] appends one JSONL line per
//! dispatched event to `.tasklife/events.jsonl`.

use crate::error::Result;
use crate::lifecycle::{DispatchReport, LifecycleEvent, RecurrenceOutcome};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Journal file name within the `.tasklife` directory.
pub const EVENT_JOURNAL_FILE: &str = "events.jsonl";

/// A downstream consumer of lifecycle events.
pub trait Notifier {
    /// Name used in dispatch reports and logs.
    fn name(&self) -> &str;

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed. The error is recorded in the
    /// dispatch report and never affects the task mutation.
    fn notify(&self, event: &LifecycleEvent, report: &DispatchReport) -> Result<()>;
}

/// Appends dispatched events to a JSONL file.
#[derive(Debug, Clone)]
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    /// Journal writing to an explicit file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Journal in the project's `.tasklife` directory.
    pub fn in_dir(base_dir: &Path) -> Self {
        Self::new(base_dir.join(".tasklife").join(EVENT_JOURNAL_FILE))
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for EventJournal {
    fn name(&self) -> &str {
        "event-journal"
    }

    fn notify(&self, event: &LifecycleEvent, report: &DispatchReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let task = event.task();
        let cascade = report.dependency.completed();
        let successor = match report.recurrence.completed() {
            Some(RecurrenceOutcome::Created(next)) => Some(next.id.as_str()),
            _ => None,
        };
        let rules_run = report.automation.completed().map_or(0, Vec::len);

        let entry = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": event.kind(),
            "task_id": task.id,
            "organization_id": task.organization_id,
            "status": task.status,
            "previous_status": event.previous().map(|p| p.status.as_str()),
            "unblocked": cascade.map(|c| c.unblocked.as_slice()).unwrap_or_default(),
            "reblocked": cascade.map(|c| c.reblocked.as_slice()).unwrap_or_default(),
            "successor": successor,
            "rules_run": rules_run,
            "diagnostics": report.diagnostics,
            "failures": report.failures(),
        });

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }
}
