//! Error types for `tasklife`.

/// Errors that can occur in the lifecycle engine and its stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON parsing error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML parsing error occurred.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A `SQLite` database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed input: a task mutation, rule definition, or config value.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A rule action refers to an entity that no longer exists.
    #[error("Reference error: {0}")]
    Reference(String),

    /// A referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A referenced automation rule does not exist.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// A guarded write lost a race: the stored version moved, or a unique
    /// key (such as a recurrence token) is already taken.
    #[error("write conflict on {key}: {detail}")]
    Conflict {
        /// The task id or unique key that conflicted.
        key: String,
        /// What the store observed.
        detail: String,
    },

    /// The store could not complete the operation right now (contention, busy).
    #[error("transient store error: {0}")]
    Transient(String),
}

impl Error {
    /// Whether retrying the same operation against fresh state may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Transient(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_and_transient_are_retryable() {
        let conflict = Error::Conflict { key: "a".to_string(), detail: "version 3 != 2".to_string() };
        assert!(conflict.is_transient());
        assert!(Error::Transient("busy".to_string()).is_transient());
    }

    #[test]
    fn test_domain_errors_are_not_retryable() {
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::Reference("gone".to_string()).is_transient());
        assert!(!Error::TaskNotFound("x".to_string()).is_transient());
    }

    #[test]
    fn test_busy_database_is_retryable() {
        let err = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::Conflict { key: "task-1".to_string(), detail: "stale".to_string() };
        assert_eq!(err.to_string(), "write conflict on task-1: stale");
        assert_eq!(Error::TaskNotFound("x".to_string()).to_string(), "task not found: x");
    }
}
