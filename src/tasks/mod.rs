//! Task records and their storage.
//!
//! This module provides:
//! - The task document model, creation data, and partial-update patches
//! - Slug-based id generation
//! - The [`TaskStore`] contract consumed by the lifecycle engine, with a
//!   `SQLite` implementation
//!
//! # Example
//!
//! ```no_run
//! use tasklife::tasks::{NewTask, SqliteTaskStore, TaskFilter, TaskStore};
//!
//! let store = SqliteTaskStore::new("/tmp/tasks.db").unwrap();
//!
//! let blocker = store
//!     .create_task(NewTask { status: Some("Todo".into()), ..NewTask::new("acme", "Deploy auth") })
//!     .unwrap();
//!
//! let dependents = store.query_tasks(&TaskFilter::blocked_by(&blocker.id)).unwrap();
//! assert!(dependents.is_empty());
//! ```

pub mod id;
pub mod models;
pub mod store;

pub use models::{
    Frequency, HistoryEntry, InvalidPriority, NewTask, Priority, Recurrence, Relation,
    RelationType, Subtask, Task, TaskPatch,
};
pub use store::{SqliteTaskStore, TaskFilter, TaskStore, TaskWrite};
