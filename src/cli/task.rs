//! Task CLI subcommands.

use crate::tasks::{Frequency, Priority};
use chrono::NaiveDate;
use clap::Subcommand;

/// Task commands.
///
/// Every mutation runs the full lifecycle pipeline: dependents are
/// unblocked, recurring tasks roll over, and automation rules fire.
///
/// ## Quick Start
///
/// ```bash
/// tasklife task create --org acme --title "Deploy auth" --status "In Progress"
/// tasklife task create --org acme --title "Announce launch" --blocked-by deploy-auth-1a2b3c4d
/// tasklife task complete deploy-auth-1a2b3c4d
/// ```
#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    /// Create a task.
    ///
    /// The status defaults to the organization's initial status.
    Create {
        /// Owning organization
        #[arg(long)]
        org: String,

        /// Title (required)
        #[arg(short, long)]
        title: String,

        /// Longer description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Initial status
        #[arg(short, long)]
        status: Option<String>,

        /// Priority: urgent, high, medium, low, none
        #[arg(short, long, value_parser = Priority::from_str, default_value = "medium")]
        priority: Priority,

        /// Label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Assignee member id (repeatable)
        #[arg(long = "assignee")]
        assignees: Vec<String>,

        /// Id of a task that must finish first (repeatable)
        #[arg(long = "blocked-by")]
        blocked_by: Vec<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<NaiveDate>,

        /// Repeat: daily, weekly, monthly, yearly
        #[arg(long, value_parser = parse_frequency)]
        recurring: Option<Frequency>,

        /// Units between occurrences
        #[arg(long, default_value = "1", requires = "recurring")]
        interval: u32,

        /// Last date an occurrence may fall on
        #[arg(long, requires = "recurring")]
        until: Option<NaiveDate>,
    },

    /// Get a task by ID.
    Get {
        /// Task ID
        id: String,
    },

    /// Update a task's fields.
    ///
    /// Only specified fields are updated. List options replace the whole list.
    Update {
        /// Task ID
        id: String,

        /// New title
        #[arg(short, long)]
        title: Option<String>,

        /// New description
        #[arg(short, long)]
        description: Option<String>,

        /// New status
        #[arg(short, long)]
        status: Option<String>,

        /// New priority
        #[arg(short, long, value_parser = Priority::from_str)]
        priority: Option<Priority>,

        /// Replacement labels (repeatable)
        #[arg(long = "label")]
        labels: Option<Vec<String>>,

        /// Replacement assignees (repeatable)
        #[arg(long = "assignee")]
        assignees: Option<Vec<String>>,

        /// Replacement blockers (repeatable)
        #[arg(long = "blocked-by", conflicts_with = "clear_blockers")]
        blocked_by: Option<Vec<String>>,

        /// Remove every blocker
        #[arg(long)]
        clear_blockers: bool,

        /// New due date
        #[arg(long, conflicts_with = "clear_due")]
        due: Option<NaiveDate>,

        /// Remove the due date
        #[arg(long)]
        clear_due: bool,
    },

    /// Move a task into its organization's complete status.
    Complete {
        /// Task ID
        id: String,
    },

    /// Delete a task. Tasks it blocked are released.
    Delete {
        /// Task ID
        id: String,
    },

    /// List tasks of an organization.
    List {
        /// Organization
        #[arg(long)]
        org: String,

        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Only tasks blocked by this id
        #[arg(long)]
        blocked_by: Option<String>,

        /// Only tasks that are currently blocked
        #[arg(long)]
        blocked_only: bool,
    },
}

fn parse_frequency(value: &str) -> Result<Frequency, String> {
    match value.to_lowercase().as_str() {
        "daily" => Ok(Frequency::Daily),
        "weekly" => Ok(Frequency::Weekly),
        "monthly" => Ok(Frequency::Monthly),
        "yearly" => Ok(Frequency::Yearly),
        _ => Err(format!("invalid frequency '{value}' (daily, weekly, monthly, yearly)")),
    }
}
