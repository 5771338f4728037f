//! Configuration management for tasklife.
//!
//! This module handles the `.tasklife/config.yaml` file which stores the
//! workflow (status scheme) of each organization and the engine's tuning
//! knobs.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Config file path relative to project root.
pub const CONFIG_FILE_PATH: &str = ".tasklife/config.yaml";

/// Database file name used when no `database_path` is configured.
pub const DATABASE_FILENAME: &str = "tasklife.sqlite3";

/// Default number of times a cascade step is retried after a transient store error.
pub const DEFAULT_MAX_STORE_RETRIES: u32 = 2;

/// The ordered status list of an organization and the roles of its statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Workflow {
    /// Ordered status names, as shown on the board.
    pub statuses: Vec<String>,
    /// Status given to new tasks and to recurrence successors.
    pub initial: String,
    /// The terminal-complete status.
    pub complete: String,
    /// Status of abandoned tasks. Cancelled blockers do not block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<String>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            statuses: ["Todo", "In Progress", "In Review", "Done", "Cancelled"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            initial: "Todo".to_string(),
            complete: "Done".to_string(),
            cancelled: Some("Cancelled".to_string()),
        }
    }
}

impl Workflow {
    /// Whether `status` is the terminal-complete status.
    pub fn is_complete(&self, status: &str) -> bool {
        self.complete == status
    }

    /// Whether a blocker in `status` no longer blocks its dependents.
    pub fn releases_dependents(&self, status: &str) -> bool {
        self.is_complete(status) || self.cancelled.as_deref() == Some(status)
    }

    /// Whether `status` is one of the configured statuses.
    pub fn knows(&self, status: &str) -> bool {
        self.statuses.iter().any(|s| s == status)
    }

    /// Check that the roles refer to listed statuses.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.statuses.is_empty() {
            return Err(Error::validation("workflow has no statuses"));
        }
        let roles = [Some(&self.initial), Some(&self.complete), self.cancelled.as_ref()];
        for status in roles.into_iter().flatten() {
            if !self.knows(status) {
                return Err(Error::validation(format!(
                    "workflow status '{status}' is not in the status list"
                )));
            }
        }
        if self.initial == self.complete {
            return Err(Error::validation("initial and complete status must differ"));
        }
        Ok(())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Workflow used by organizations without an override.
    #[serde(default)]
    pub workflow: Workflow,

    /// Per-organization workflow overrides, keyed by organization id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub organizations: BTreeMap<String, Workflow>,

    /// How often a cascade step is retried after a transient store error.
    #[serde(default = "default_max_store_retries")]
    pub max_store_retries: u32,

    /// Whether lifecycle events are appended to the JSONL event journal.
    #[serde(default)]
    pub journal_events: bool,

    /// Database location. None means the default data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

const fn default_max_store_retries() -> u32 {
    DEFAULT_MAX_STORE_RETRIES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow: Workflow::default(),
            organizations: BTreeMap::new(),
            max_store_retries: DEFAULT_MAX_STORE_RETRIES,
            journal_events: false,
            database_path: None,
        }
    }
}

impl EngineConfig {
    /// Load config from a specific base directory, returning None if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or fails validation.
    pub fn load_from(base_dir: &Path) -> Result<Option<Self>> {
        let config_path = Self::config_path(base_dir);
        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Save config to a specific base directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, base_dir: &Path) -> Result<()> {
        let config_path = Self::config_path(base_dir);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Get the config file path for a base directory.
    pub fn config_path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE_PATH)
    }

    /// Validate every workflow.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending organization.
    pub fn validate(&self) -> Result<()> {
        self.workflow.validate()?;
        for (org, workflow) in &self.organizations {
            workflow
                .validate()
                .map_err(|e| Error::validation(format!("organization '{org}': {e}")))?;
        }
        Ok(())
    }

    /// The workflow in force for an organization.
    pub fn workflow_for(&self, organization_id: &str) -> &Workflow {
        self.organizations.get(organization_id).unwrap_or(&self.workflow)
    }

    /// Resolve the database path.
    ///
    /// Without an explicit `database_path`, each project gets its own database
    /// under `<data dir>/tasklife/projects/<name>-<hash>/`.
    pub fn resolve_database_path(&self, base_dir: &Path) -> PathBuf {
        if let Some(ref path) = self.database_path {
            if path.is_absolute() {
                return path.clone();
            }
            return base_dir.join(path);
        }
        dirs::data_dir().map_or_else(
            || base_dir.join(".tasklife").join(DATABASE_FILENAME),
            |dir| {
                dir.join("tasklife")
                    .join("projects")
                    .join(project_dir_name(base_dir))
                    .join(DATABASE_FILENAME)
            },
        )
    }
}

/// Readable, collision-free directory name for a project: `<name>-<hash>`.
fn project_dir_name(project_dir: &Path) -> String {
    let path = project_dir.canonicalize().unwrap_or_else(|_| project_dir.to_path_buf());

    let prefix = path.file_name().and_then(|n| n.to_str()).unwrap_or("project");
    let prefix: String = prefix.chars().map(|c| if c.is_alphanumeric() { c } else { '-' }).collect();
    let prefix = match prefix.trim_matches('-') {
        "" => "project",
        p => p,
    };

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{prefix}-{:016x}", hasher.finish())
}

/// Ensure config exists in a specific directory, creating it with defaults if not.
///
/// # Errors
///
/// Returns an error if config cannot be loaded or saved.
pub fn ensure_config_in(base_dir: &Path) -> Result<EngineConfig> {
    if let Some(config) = EngineConfig::load_from(base_dir)? {
        return Ok(config);
    }

    let config = EngineConfig::default();
    config.save_to(base_dir)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_workflow_is_valid() {
        let workflow = Workflow::default();
        workflow.validate().unwrap();
        assert!(workflow.is_complete("Done"));
        assert!(!workflow.is_complete("Cancelled"));
        assert!(workflow.releases_dependents("Cancelled"));
        assert!(!workflow.releases_dependents("In Review"));
    }

    #[test]
    fn test_workflow_rejects_unknown_roles() {
        let workflow = Workflow { complete: "Shipped".to_string(), ..Workflow::default() };
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("Shipped"));

        let empty = Workflow { statuses: vec![], ..Workflow::default() };
        assert!(empty.validate().is_err());

        let same = Workflow { initial: "Done".to_string(), ..Workflow::default() };
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_load_missing_config() {
        let dir = TempDir::new().unwrap();
        assert!(EngineConfig::load_from(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig { journal_events: true, ..Default::default() };
        config.organizations.insert(
            "acme".to_string(),
            Workflow {
                statuses: vec!["Open".to_string(), "Voltooid".to_string()],
                initial: "Open".to_string(),
                complete: "Voltooid".to_string(),
                cancelled: None,
            },
        );
        config.save_to(dir.path()).unwrap();

        let loaded = EngineConfig::load_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.workflow_for("acme").complete, "Voltooid");
        assert_eq!(loaded.workflow_for("other").complete, "Done");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = EngineConfig::config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "journal_events: true\n").unwrap();

        let config = EngineConfig::load_from(dir.path()).unwrap().unwrap();
        assert!(config.journal_events);
        assert_eq!(config.max_store_retries, DEFAULT_MAX_STORE_RETRIES);
        assert_eq!(config.workflow, Workflow::default());
    }

    #[test]
    fn test_invalid_override_is_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = EngineConfig::config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "organizations:\n  acme:\n    statuses: [Open]\n    initial: Open\n    complete: Closed\n",
        )
        .unwrap();

        let err = EngineConfig::load_from(dir.path()).unwrap_err();
        assert!(err.to_string().contains("acme"));
    }

    #[test]
    fn test_ensure_config_creates_file() {
        let dir = TempDir::new().unwrap();
        let config = ensure_config_in(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(EngineConfig::config_path(dir.path()).exists());

        // Second call loads rather than overwrites
        let mut changed = config;
        changed.max_store_retries = 7;
        changed.save_to(dir.path()).unwrap();
        assert_eq!(ensure_config_in(dir.path()).unwrap().max_store_retries, 7);
    }

    #[test]
    fn test_default_database_path_is_per_project() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let config = EngineConfig::default();

        let a = config.resolve_database_path(first.path());
        let b = config.resolve_database_path(second.path());
        assert_ne!(a, b);
        assert!(a.ends_with(DATABASE_FILENAME));
        // Stable for the same project
        assert_eq!(a, config.resolve_database_path(first.path()));
    }

    #[test]
    fn test_project_dir_name_is_readable() {
        let name = project_dir_name(Path::new("/some/project/my app"));
        assert!(name.starts_with("my-app-"), "{name}");
        assert_ne!(name, project_dir_name(Path::new("/other/project/my app")));
    }

    #[test]
    fn test_relative_database_path_is_joined() {
        let config =
            EngineConfig { database_path: Some(PathBuf::from("db.sqlite3")), ..Default::default() };
        assert_eq!(
            config.resolve_database_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/db.sqlite3")
        );
    }
}
