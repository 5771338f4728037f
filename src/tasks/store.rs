//! Task store trait and `SQLite` implementation.
//!
//! The lifecycle engine only talks to tasks through [`TaskStore`]. Writes go
//! through [`TaskStore::atomic_batch`], which applies every patch or none and
//! rejects a write whose expected version is stale. Cascades rely on that
//! compare-and-swap instead of holding locks.

use crate::error::{Error, Result};
use crate::tasks::id::generate_task_id;
use crate::tasks::models::{NewTask, Task, TaskPatch};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Trait for task storage operations.
///
/// All methods return a `Result` and may fail with database errors.
#[allow(clippy::missing_errors_doc)]
pub trait TaskStore {
    /// Get a task by ID.
    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// List tasks matching every set field of the filter, oldest first.
    fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Apply all writes or none. Returns the updated tasks in write order.
    ///
    /// Fails with [`Error::Conflict`] when a write's expected version is stale,
    /// [`Error::TaskNotFound`] when a target is missing, and
    /// [`Error::Validation`] when a patch would make a task block itself.
    fn atomic_batch(&self, writes: &[TaskWrite]) -> Result<Vec<Task>>;

    /// Persist a new task and return it with its generated id.
    ///
    /// `new.status` must be set. Fails with [`Error::Conflict`] when another
    /// task already carries the same recurrence token.
    fn create_task(&self, new: NewTask) -> Result<Task>;

    /// Delete a task by ID. Dependents keep the dangling id in `blocked_by`.
    fn delete_task(&self, id: &str) -> Result<bool>;

    /// Ids of tasks related to `id` in either direction.
    fn related_task_ids(&self, id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .get_task(id)?
            .map(|task| task.relations.into_iter().map(|r| r.task_id).collect())
            .unwrap_or_default();
        let filter = TaskFilter { related_to: Some(id.to_string()), ..Default::default() };
        for task in self.query_tasks(&filter)? {
            if !ids.contains(&task.id) {
                ids.push(task.id);
            }
        }
        Ok(ids)
    }
}

/// Filter options for querying tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks of this organization.
    pub organization_id: Option<String>,
    /// Only tasks whose `blocked_by` contains this id.
    pub blocked_by: Option<String>,
    /// Only tasks holding a relation to this id.
    pub related_to: Option<String>,
    /// Only tasks in this status.
    pub status: Option<String>,
    /// Only the task generated with this recurrence token.
    pub recurrence_token: Option<String>,
}

impl TaskFilter {
    /// Tasks that list `blocker_id` among their blockers.
    pub fn blocked_by(blocker_id: &str) -> Self {
        Self { blocked_by: Some(blocker_id.to_string()), ..Self::default() }
    }

    /// The task generated by the completion identified by `token`.
    pub fn recurrence_token(token: &str) -> Self {
        Self { recurrence_token: Some(token.to_string()), ..Self::default() }
    }

    /// Restrict to one organization.
    #[must_use]
    pub fn in_organization(mut self, organization_id: &str) -> Self {
        self.organization_id = Some(organization_id.to_string());
        self
    }

    /// Evaluate the filter against a task.
    pub fn matches(&self, task: &Task) -> bool {
        self.organization_id.as_ref().map_or(true, |org| &task.organization_id == org)
            && self.blocked_by.as_ref().map_or(true, |id| task.blocked_by.contains(id))
            && self
                .related_to
                .as_ref()
                .map_or(true, |id| task.relations.iter().any(|r| &r.task_id == id))
            && self.status.as_ref().map_or(true, |status| &task.status == status)
            && self
                .recurrence_token
                .as_ref()
                .map_or(true, |token| task.recurrence_token.as_ref() == Some(token))
    }
}

/// One patch inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWrite {
    /// Target task.
    pub id: String,
    /// Version the writer read. None writes unconditionally.
    pub expected_version: Option<u64>,
    /// Changes to apply.
    pub patch: TaskPatch,
}

impl TaskWrite {
    /// A write that only succeeds if `task` is still the stored version.
    pub fn guarded(task: &Task, patch: TaskPatch) -> Self {
        Self { id: task.id.clone(), expected_version: Some(task.version), patch }
    }

    /// A write applied regardless of concurrent changes.
    pub fn unguarded(id: impl Into<String>, patch: TaskPatch) -> Self {
        Self { id: id.into(), expected_version: None, patch }
    }
}

/// Apply one write to an in-memory copy, enforcing the batch contract.
///
/// Shared by every store so that version checks and the self-block rule
/// behave identically.
pub(crate) fn apply_write(current: Option<Task>, write: &TaskWrite) -> Result<Task> {
    let mut task = current.ok_or_else(|| Error::TaskNotFound(write.id.clone()))?;
    if let Some(expected) = write.expected_version {
        if task.version != expected {
            return Err(Error::Conflict {
                key: task.id,
                detail: format!("expected version {expected}, found {}", task.version),
            });
        }
    }
    write.patch.apply_to(&mut task);
    if task.blocked_by.contains(&task.id) {
        return Err(Error::validation(format!("task {} cannot block itself", task.id)));
    }
    task.version += 1;
    task.updated_at = Utc::now();
    Ok(task)
}

/// Build the stored form of a new task, enforcing the creation contract.
pub(crate) fn prepare_new_task(new: NewTask) -> Result<Task> {
    let status = new
        .status
        .clone()
        .ok_or_else(|| Error::validation("new task has no status"))?;
    let id = generate_task_id(&new.title);
    if new.blocked_by.contains(&id) {
        return Err(Error::validation(format!("task {id} cannot block itself")));
    }
    Ok(Task::from_new(id, new, &status, Utc::now()))
}

/// Open a `SQLite` connection with the pragmas every store expects.
pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    Ok(conn)
}

/// SQLite-based task store.
///
/// Each task is kept as a JSON document alongside indexed columns for the
/// fields the engine queries on (organization, status, recurrence token,
/// blockers, relations).
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    db_path: PathBuf,
}

impl SqliteTaskStore {
    /// Create a new `SQLite` task store at the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self { db_path: db_path.as_ref().to_path_buf() };
        store.init_schema()?;
        Ok(store)
    }

    /// Get the database path.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open()?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                status TEXT NOT NULL,
                recurrence_token TEXT UNIQUE,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Blocking edges (task_id is blocked by blocker_id). blocker_id is
            -- deliberately not a foreign key: dangling blockers are allowed.
            CREATE TABLE IF NOT EXISTS task_blockers (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                blocker_id TEXT NOT NULL,
                PRIMARY KEY (task_id, blocker_id),
                CHECK (task_id != blocker_id)
            );

            CREATE TABLE IF NOT EXISTS task_relations (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                related_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (task_id, related_id, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_org ON tasks(organization_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_org_status ON tasks(organization_id, status);
            CREATE INDEX IF NOT EXISTS idx_task_blockers_blocker ON task_blockers(blocker_id);
            CREATE INDEX IF NOT EXISTS idx_task_relations_related ON task_relations(related_id);
            ",
        )?;

        Ok(())
    }

    /// Parse a task from its document column.
    fn parse_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let document: String = row.get(0)?;
        serde_json::from_str(&document).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Task>> {
        let task = conn
            .query_row("SELECT document FROM tasks WHERE id = ?1", params![id], Self::parse_task)
            .optional()?;
        Ok(task)
    }

    /// Rewrite the index rows that mirror `blocked_by` and `relations`.
    fn write_edges(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute("DELETE FROM task_blockers WHERE task_id = ?1", params![&task.id])?;
        for blocker in &task.blocked_by {
            conn.execute(
                "INSERT INTO task_blockers (task_id, blocker_id) VALUES (?1, ?2)",
                params![&task.id, blocker],
            )?;
        }

        conn.execute("DELETE FROM task_relations WHERE task_id = ?1", params![&task.id])?;
        for relation in &task.relations {
            let kind = serde_json::to_value(relation.kind)?;
            conn.execute(
                "INSERT OR IGNORE INTO task_relations (task_id, related_id, kind) VALUES (?1, ?2, ?3)",
                params![&task.id, &relation.task_id, kind.as_str().unwrap_or_default()],
            )?;
        }
        Ok(())
    }

    fn insert(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute(
            "INSERT INTO tasks
                (id, organization_id, status, recurrence_token, version, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &task.id,
                &task.organization_id,
                &task.status,
                &task.recurrence_token,
                task.version,
                serde_json::to_string(task)?,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Self::write_edges(conn, task)
    }

    fn update(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute(
            "UPDATE tasks SET status = ?2, version = ?3, document = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                &task.id,
                &task.status,
                task.version,
                serde_json::to_string(task)?,
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Self::write_edges(conn, task)
    }
}

impl TaskStore for SqliteTaskStore {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.open()?;
        Self::load(&conn, id)
    }

    fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.open()?;

        let mut conditions = Vec::new();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref org) = filter.organization_id {
            conditions.push("organization_id = ?");
            params_vec.push(Box::new(org.clone()));
        }
        if let Some(ref blocker) = filter.blocked_by {
            conditions.push("id IN (SELECT task_id FROM task_blockers WHERE blocker_id = ?)");
            params_vec.push(Box::new(blocker.clone()));
        }
        if let Some(ref related) = filter.related_to {
            conditions.push("id IN (SELECT task_id FROM task_relations WHERE related_id = ?)");
            params_vec.push(Box::new(related.clone()));
        }
        if let Some(ref status) = filter.status {
            conditions.push("status = ?");
            params_vec.push(Box::new(status.clone()));
        }
        if let Some(ref token) = filter.recurrence_token {
            conditions.push("recurrence_token = ?");
            params_vec.push(Box::new(token.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!("SELECT document FROM tasks {where_clause} ORDER BY created_at ASC, id ASC");

        let params: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(AsRef::as_ref).collect();
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params.as_slice(), Self::parse_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(tasks)
    }

    fn atomic_batch(&self, writes: &[TaskWrite]) -> Result<Vec<Task>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut updated = Vec::with_capacity(writes.len());
        for write in writes {
            let task = apply_write(Self::load(&tx, &write.id)?, write)?;
            Self::update(&tx, &task)?;
            updated.push(task);
        }

        // Dropping the transaction on any earlier `?` rolls everything back
        tx.commit()?;
        Ok(updated)
    }

    fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = prepare_new_task(new)?;

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(ref token) = task.recurrence_token {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE recurrence_token = ?1",
                    params![token],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(Error::Conflict {
                    key: token.clone(),
                    detail: format!("recurrence token already used by {existing}"),
                });
            }
        }

        Self::insert(&tx, &task)?;
        tx.commit()?;
        Ok(task)
    }

    fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.open()?;
        let rows = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::models::{Priority, Relation, RelationType};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteTaskStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteTaskStore::new(&db_path).unwrap();
        (dir, store)
    }

    fn new_task(title: &str) -> NewTask {
        NewTask { status: Some("Todo".to_string()), ..NewTask::new("acme", title) }
    }

    #[test]
    fn test_create_and_get_task() {
        let (_dir, store) = create_test_store();

        let task = store
            .create_task(NewTask { priority: Priority::High, ..new_task("Test Task") })
            .unwrap();
        assert!(task.id.starts_with("test-task-"));
        assert_eq!(task.status, "Todo");
        assert_eq!(task.version, 1);

        let fetched = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[test]
    fn test_get_nonexistent_task() {
        let (_dir, store) = create_test_store();
        assert!(store.get_task("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_create_requires_status() {
        let (_dir, store) = create_test_store();
        let err = store.create_task(NewTask::new("acme", "No status")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_create_rejects_duplicate_recurrence_token() {
        let (_dir, store) = create_test_store();
        let token = Some("parent@2024-06-03T09:00:00+00:00".to_string());

        store.create_task(NewTask { recurrence_token: token.clone(), ..new_task("Next") }).unwrap();
        let err = store
            .create_task(NewTask { recurrence_token: token, ..new_task("Next") })
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.query_tasks(&TaskFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_query_by_blocker_and_org() {
        let (_dir, store) = create_test_store();
        let blocker = store.create_task(new_task("Blocker")).unwrap();
        let dependent = store
            .create_task(NewTask {
                blocked_by: BTreeSet::from([blocker.id.clone()]),
                ..new_task("Dependent")
            })
            .unwrap();
        store
            .create_task(NewTask {
                blocked_by: BTreeSet::from([blocker.id.clone()]),
                ..NewTask { organization_id: "other".to_string(), ..new_task("Elsewhere") }
            })
            .unwrap();

        let all = store.query_tasks(&TaskFilter::blocked_by(&blocker.id)).unwrap();
        assert_eq!(all.len(), 2);

        let scoped =
            store.query_tasks(&TaskFilter::blocked_by(&blocker.id).in_organization("acme")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, dependent.id);
    }

    #[test]
    fn test_atomic_batch_applies_all() {
        let (_dir, store) = create_test_store();
        let a = store.create_task(new_task("A")).unwrap();
        let b = store.create_task(new_task("B")).unwrap();

        let updated = store
            .atomic_batch(&[
                TaskWrite::guarded(&a, TaskPatch { is_blocked: Some(true), ..Default::default() }),
                TaskWrite::unguarded(
                    &b.id,
                    TaskPatch { status: Some("Done".to_string()), ..Default::default() },
                ),
            ])
            .unwrap();

        assert_eq!(updated.len(), 2);
        let a = store.get_task(&a.id).unwrap().unwrap();
        assert!(a.is_blocked);
        assert_eq!(a.version, 2);
        assert_eq!(store.get_task(&b.id).unwrap().unwrap().status, "Done");
        assert_eq!(store.query_tasks(&TaskFilter { status: Some("Done".to_string()), ..Default::default() }).unwrap().len(), 1);
    }

    #[test]
    fn test_atomic_batch_rolls_back_on_stale_version() {
        let (_dir, store) = create_test_store();
        let a = store.create_task(new_task("A")).unwrap();
        let b = store.create_task(new_task("B")).unwrap();
        let stale_b = b.clone();

        store
            .atomic_batch(&[TaskWrite::unguarded(
                &b.id,
                TaskPatch { title: Some("B2".to_string()), ..Default::default() },
            )])
            .unwrap();

        let err = store
            .atomic_batch(&[
                TaskWrite::guarded(&a, TaskPatch { is_blocked: Some(true), ..Default::default() }),
                TaskWrite::guarded(
                    &stale_b,
                    TaskPatch { is_blocked: Some(true), ..Default::default() },
                ),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_transient());

        // First write in the batch was rolled back too
        assert!(!store.get_task(&a.id).unwrap().unwrap().is_blocked);
    }

    #[test]
    fn test_atomic_batch_rejects_self_block() {
        let (_dir, store) = create_test_store();
        let a = store.create_task(new_task("A")).unwrap();
        let err = store
            .atomic_batch(&[TaskWrite::guarded(
                &a,
                TaskPatch { blocked_by: Some(BTreeSet::from([a.id.clone()])), ..Default::default() },
            )])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_atomic_batch_missing_task() {
        let (_dir, store) = create_test_store();
        let err = store
            .atomic_batch(&[TaskWrite::unguarded("ghost", TaskPatch::default())])
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_blocker_index_follows_updates() {
        let (_dir, store) = create_test_store();
        let blocker = store.create_task(new_task("Blocker")).unwrap();
        let task = store.create_task(new_task("Task")).unwrap();

        store
            .atomic_batch(&[TaskWrite::guarded(
                &task,
                TaskPatch {
                    blocked_by: Some(BTreeSet::from([blocker.id.clone()])),
                    ..Default::default()
                },
            )])
            .unwrap();
        assert_eq!(store.query_tasks(&TaskFilter::blocked_by(&blocker.id)).unwrap().len(), 1);

        let task = store.get_task(&task.id).unwrap().unwrap();
        store
            .atomic_batch(&[TaskWrite::guarded(
                &task,
                TaskPatch { blocked_by: Some(BTreeSet::new()), ..Default::default() },
            )])
            .unwrap();
        assert!(store.query_tasks(&TaskFilter::blocked_by(&blocker.id)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_keeps_dangling_blockers() {
        let (_dir, store) = create_test_store();
        let blocker = store.create_task(new_task("Blocker")).unwrap();
        let dependent = store
            .create_task(NewTask {
                blocked_by: BTreeSet::from([blocker.id.clone()]),
                ..new_task("Dependent")
            })
            .unwrap();

        assert!(store.delete_task(&blocker.id).unwrap());
        assert!(!store.delete_task(&blocker.id).unwrap());

        let dependent = store.get_task(&dependent.id).unwrap().unwrap();
        assert!(dependent.blocked_by.contains(&blocker.id));
    }

    #[test]
    fn test_related_task_ids_are_bidirectional() {
        let (_dir, store) = create_test_store();
        let a = store.create_task(new_task("A")).unwrap();
        let b = store
            .create_task(NewTask {
                relations: vec![Relation { task_id: a.id.clone(), kind: RelationType::RelatedTo }],
                ..new_task("B")
            })
            .unwrap();

        assert_eq!(store.related_task_ids(&a.id).unwrap(), vec![b.id.clone()]);
        assert_eq!(store.related_task_ids(&b.id).unwrap(), vec![a.id]);
    }
}
