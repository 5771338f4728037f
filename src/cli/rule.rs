//! Automation rule CLI subcommands.

use clap::Subcommand;
use std::path::PathBuf;

/// Automation rule commands.
///
/// Rules are written as YAML or JSON:
///
/// ```yaml
/// organizationId: acme
/// name: Urgent work goes to the lead
/// trigger:
///   type: task.priority.changed
///   filters:
///     priority: Urgent
/// action:
///   type: task.assign
///   params:
///     assigneeId: lead
/// ```
#[derive(Subcommand, Debug, Clone)]
pub enum RuleCommand {
    /// List the rules of an organization.
    List {
        /// Organization
        #[arg(long)]
        org: String,
    },

    /// Create or replace a rule from a YAML or JSON file.
    ///
    /// Reads stdin when no file is given. A rule without an id gets one.
    Upsert {
        /// Rule definition file
        file: Option<PathBuf>,
    },

    /// Delete a rule.
    Delete {
        /// Rule ID
        id: String,
    },
}
