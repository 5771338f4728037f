//! User-defined "when X happens, do Y" rules.
//!
//! A rule pairs a [`Trigger`] (an event type plus field filters) with one
//! [`Action`] applied to the task the event concerns. Rules are owned by the
//! management surface through a [`RuleStore`]; the lifecycle engine only
//! reads a snapshot of them per dispatch.

pub mod engine;
pub mod rules;

pub use engine::{
    filter_matches, patch_for, triggered_types, ActionOutcome, AutomationEngine, OpenDirectory,
    ReferenceDirectory, RuleExecution,
};
pub use rules::{
    Action, AutomationRule, RuleStore, SqliteRuleStore, Trigger, TriggerType, FILTERABLE_FIELDS,
};
