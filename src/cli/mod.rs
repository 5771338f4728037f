//! Command-line interface for tasklife.
//!
//! Two-level commands for tasks and automation rules, plus project setup
//! and diagnostics. Every task mutation goes through the lifecycle engine.

mod rule;
mod run;
mod task;


pub use rule::RuleCommand;
pub use run::{run, CliOutput};
pub use task::TaskCommand;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tasklife - task lifecycle engine.
///
/// Tracks blocking dependencies, rolls recurring tasks over and runs
/// automation rules whenever a task changes.
///
/// Set `TASKLIFE_LOG=debug` to see what each cascade step did.
#[derive(Parser, Debug)]
#[command(name = "tasklife")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project directory holding `.tasklife/config.yaml`
    #[arg(long, global = true, default_value = ".")]
    pub dir: PathBuf,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Task management - create, update, complete and list tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Automation rule management.
    #[command(subcommand)]
    Rule(RuleCommand),

    /// Report blocking cycles in an organization.
    ///
    /// Tasks in a cycle stay blocked until someone removes one of the
    /// blockers.
    #[command(name = "check-cycles")]
    CheckCycles {
        /// Organization
        #[arg(long)]
        org: String,
    },

    /// Create the config file with defaults and initialize the database.
    Init,
}

impl Command {
    /// Returns true if this command reads its input from stdin.
    #[must_use]
    pub const fn needs_stdin(&self) -> bool {
        matches!(self, Self::Rule(RuleCommand::Upsert { file: None }))
    }
}
