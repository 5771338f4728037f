//! # `tasklife`
//!
//! A task lifecycle engine. Whenever a task is created, updated or deleted,
//! the engine keeps dependent tasks' blocked state in step with their
//! blockers, rolls completed recurring tasks over into their next occurrence,
//! and runs the organization's automation rules.
//!
//! The engine talks to storage only through the [`tasks::TaskStore`] and
//! [`automation::RuleStore`] traits; `SQLite` implementations ship with the
//! crate and in-memory ones live in [`testing`].

pub mod automation;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod tasks;
pub mod testing;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }
}
