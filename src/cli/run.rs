//! Command execution for the CLI.
//!
//! This module handles running CLI commands and producing output.

use crate::automation::{ActionOutcome, AutomationRule, RuleStore, SqliteRuleStore};
use crate::cli::{Command, RuleCommand, TaskCommand};
use crate::config::{ensure_config_in, EngineConfig};
use crate::error::Result;
use crate::lifecycle::dependency::find_cycle;
use crate::lifecycle::{Diagnostic, LifecycleEngine, Mutation, RecurrenceOutcome};
use crate::notify::EventJournal;
use crate::tasks::{NewTask, Recurrence, SqliteTaskStore, Task, TaskFilter, TaskPatch, TaskStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitCode;

type Engine = LifecycleEngine<SqliteTaskStore, SqliteRuleStore>;

/// Output from running the CLI, with separate stdout and stderr messages.
#[derive(Debug)]
pub struct CliOutput {
    /// Exit code for the process.
    pub exit_code: ExitCode,
    /// Messages to print to stdout.
    pub stdout: Vec<String>,
    /// Messages to print to stderr.
    pub stderr: Vec<String>,
}

/// Run a CLI command against the project in `base_dir`.
pub fn run(command: Command, base_dir: &Path, stdin: &str) -> CliOutput {
    match command {
        Command::Init => run_init(base_dir),
        Command::Task(cmd) => with_engine(base_dir, |engine| run_task_cmd(engine, cmd)),
        Command::Rule(cmd) => with_engine(base_dir, |engine| run_rule_cmd(engine, cmd, stdin)),
        Command::CheckCycles { org } => with_engine(base_dir, |engine| check_cycles(engine, &org)),
    }
}

fn run_init(base_dir: &Path) -> CliOutput {
    let config = match ensure_config_in(base_dir) {
        Ok(c) => c,
        Err(e) => return error_output(format!("Error ensuring config: {e}")),
    };
    let db_path = config.resolve_database_path(base_dir);
    match open_engine(base_dir) {
        Ok(_) => CliOutput {
            exit_code: ExitCode::SUCCESS,
            stdout: vec![],
            stderr: vec![
                format!("Config ensured at {}", EngineConfig::config_path(base_dir).display()),
                format!("  database: {}", db_path.display()),
                format!("  statuses: {}", config.workflow.statuses.join(", ")),
            ],
        },
        Err(e) => error_output(format!("Error initializing database: {e}")),
    }
}

fn open_engine(base_dir: &Path) -> Result<Engine> {
    let config = EngineConfig::load_from(base_dir)?.unwrap_or_default();
    let db_path = config.resolve_database_path(base_dir);
    let tasks = SqliteTaskStore::new(&db_path)?;
    let rules = SqliteRuleStore::new(&db_path)?;

    let journal = config.journal_events;
    let engine = LifecycleEngine::new(tasks, rules, config);
    Ok(if journal { engine.with_notifier(EventJournal::in_dir(base_dir)) } else { engine })
}

fn with_engine(base_dir: &Path, f: impl FnOnce(&Engine) -> CliOutput) -> CliOutput {
    match open_engine(base_dir) {
        Ok(engine) => f(&engine),
        Err(e) => error_output(e.to_string()),
    }
}

// === Task Commands ===

fn run_task_cmd(engine: &Engine, cmd: TaskCommand) -> CliOutput {
    match cmd {
        TaskCommand::Create {
            org,
            title,
            description,
            status,
            priority,
            labels,
            assignees,
            blocked_by,
            due,
            recurring,
            interval,
            until,
        } => {
            let new = NewTask {
                description,
                status,
                priority,
                labels,
                assignee_ids: assignees,
                blocked_by: blocked_by.into_iter().collect(),
                due_date: due,
                recurring: recurring
                    .map(|frequency| Recurrence { until, ..Recurrence::every(interval, frequency) }),
                ..NewTask::new(org, title)
            };
            mutation_output(engine.create_task(new))
        }
        TaskCommand::Get { id } => match engine.store().get_task(&id) {
            Ok(Some(task)) => json_output(&task),
            Ok(None) => error_output(format!("Task not found: {id}")),
            Err(e) => error_output(e.to_string()),
        },
        TaskCommand::Update {
            id,
            title,
            description,
            status,
            priority,
            labels,
            assignees,
            blocked_by,
            clear_blockers,
            due,
            clear_due,
        } => {
            let blocked_by = if clear_blockers {
                Some(BTreeSet::new())
            } else {
                blocked_by.map(|ids| ids.into_iter().collect())
            };
            let due_date = if clear_due { Some(None) } else { due.map(Some) };
            let patch = TaskPatch {
                title,
                description,
                status,
                priority,
                labels,
                assignee_ids: assignees,
                blocked_by,
                due_date,
                ..Default::default()
            };
            mutation_output(engine.update_task(&id, patch))
        }
        TaskCommand::Complete { id } => mutation_output(engine.complete_task(&id)),
        TaskCommand::Delete { id } => mutation_output(engine.delete_task(&id)),
        TaskCommand::List { org, status, blocked_by, blocked_only } => {
            let filter = TaskFilter { status, blocked_by, ..Default::default() }.in_organization(&org);
            match engine.store().query_tasks(&filter) {
                Ok(tasks) => {
                    let summaries: Vec<TaskSummary> = tasks
                        .iter()
                        .filter(|t| !blocked_only || t.is_blocked)
                        .map(TaskSummary::from)
                        .collect();
                    json_output(&summaries)
                }
                Err(e) => error_output(e.to_string()),
            }
        }
    }
}

// === Rule Commands ===

fn run_rule_cmd(engine: &Engine, cmd: RuleCommand, stdin: &str) -> CliOutput {
    match cmd {
        RuleCommand::List { org } => match engine.rules().list_rules(&org) {
            Ok(rules) => json_output(&rules),
            Err(e) => error_output(e.to_string()),
        },
        RuleCommand::Upsert { file } => {
            let content = match file {
                Some(path) => match std::fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(e) => return error_output(format!("Error reading {}: {e}", path.display())),
                },
                None => stdin.to_string(),
            };
            // YAML parsing also accepts JSON documents
            let rule: AutomationRule = match serde_yaml::from_str(&content) {
                Ok(r) => r,
                Err(e) => return error_output(format!("Invalid rule definition: {e}")),
            };
            match engine.rules().upsert_rule(rule) {
                Ok(saved) => json_output(&saved),
                Err(e) => error_output(e.to_string()),
            }
        }
        RuleCommand::Delete { id } => match engine.rules().delete_rule(&id) {
            Ok(()) => success_output(format!("Rule deleted: {id}")),
            Err(e) => error_output(e.to_string()),
        },
    }
}

// === Diagnostics ===

fn check_cycles(engine: &Engine, org: &str) -> CliOutput {
    let tasks = match engine.store().query_tasks(&TaskFilter::default().in_organization(org)) {
        Ok(t) => t,
        Err(e) => return error_output(e.to_string()),
    };

    let mut seen = BTreeSet::new();
    let mut cycles = Vec::new();
    for task in tasks.iter().filter(|t| !t.blocked_by.is_empty()) {
        match find_cycle(engine.store(), &task.id) {
            Ok(Some(cycle)) => {
                let key: BTreeSet<String> = cycle.iter().cloned().collect();
                if seen.insert(key) {
                    cycles.push(Diagnostic::CycleWarning { task_ids: cycle });
                }
            }
            Ok(None) => {}
            Err(e) => return error_output(e.to_string()),
        }
    }
    json_output(&CycleReport { cycles })
}

// === Output helpers ===

fn mutation_output(result: Result<Mutation>) -> CliOutput {
    match result {
        Ok(mutation) => {
            let failures = mutation.report.failures();
            let mut output = json_output(&MutationOutput::from(&mutation));
            // Side effects never fail the command; surface them on stderr
            output.stderr.extend(failures.into_iter().map(|f| format!("Warning: {f}")));
            output
        }
        Err(e) => error_output(e.to_string()),
    }
}

fn json_output<T: Serialize>(value: &T) -> CliOutput {
    match serde_json::to_string_pretty(value) {
        Ok(json) => CliOutput { exit_code: ExitCode::SUCCESS, stdout: vec![json], stderr: vec![] },
        Err(e) => error_output(e.to_string()),
    }
}

fn success_output(message: String) -> CliOutput {
    CliOutput { exit_code: ExitCode::SUCCESS, stdout: vec![message], stderr: vec![] }
}

fn error_output(message: String) -> CliOutput {
    CliOutput { exit_code: ExitCode::from(1), stdout: vec![], stderr: vec![message] }
}

// === Output Types ===

/// Task summary for list operations.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSummary {
    id: String,
    title: String,
    status: String,
    priority: String,
    is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<chrono::NaiveDate>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status.clone(),
            priority: task.priority.to_string(),
            is_blocked: task.is_blocked,
            due_date: task.due_date,
        }
    }
}

/// A mutation and its side effects.
#[derive(Debug, Serialize)]
struct MutationOutput<'a> {
    task: &'a Task,
    effects: EffectsOutput,
}

#[derive(Debug, Serialize)]
struct EffectsOutput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unblocked: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reblocked: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    successor: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rules: Vec<RuleOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RuleOutput {
    id: String,
    name: String,
    outcome: String,
}

#[derive(Debug, Serialize)]
struct CycleReport {
    cycles: Vec<Diagnostic>,
}

impl<'a> From<&'a Mutation> for MutationOutput<'a> {
    fn from(mutation: &'a Mutation) -> Self {
        let report = &mutation.report;
        let cascade = report.dependency.completed();
        let successor = match report.recurrence.completed() {
            Some(RecurrenceOutcome::Created(next)) => Some(next.id.clone()),
            Some(RecurrenceOutcome::AlreadyGenerated(id)) => Some(id.clone()),
            _ => None,
        };
        let rules = report
            .automation
            .completed()
            .map(|executions| {
                executions
                    .iter()
                    .map(|execution| RuleOutput {
                        id: execution.rule_id.clone(),
                        name: execution.rule_name.clone(),
                        outcome: match execution.result {
                            Ok(ActionOutcome::Applied(_)) => "applied".to_string(),
                            Ok(ActionOutcome::Unchanged) => "unchanged".to_string(),
                            Err(ref e) => format!("failed: {e}"),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            task: &mutation.task,
            effects: EffectsOutput {
                unblocked: cascade.map(|c| c.unblocked.clone()).unwrap_or_default(),
                reblocked: cascade.map(|c| c.reblocked.clone()).unwrap_or_default(),
                successor,
                rules,
                diagnostics: report.diagnostics.clone(),
                failures: report.failures(),
            },
        }
    }
}
