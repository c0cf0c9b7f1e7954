//! Repository record persisted inside the repository directory

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the embedded settings record.
///
/// The record lives *inside* the repository directory so that CoW snapshots
/// transport it with the workspace. No sibling metadata file is ever
/// written, read, updated, or deleted.
pub const SETTINGS_FILE: &str = ".claude-batch-settings.json";

/// Clone pipeline state of a registered repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    /// Source clone (and index bootstrap, if enabled) in progress
    Cloning,
    /// Ready to serve as a job source
    Completed,
    /// Registration pipeline failed; directory kept for diagnostics
    Failed,
}

impl std::fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloneStatus::Cloning => "cloning",
            CloneStatus::Completed => "completed",
            CloneStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Nested per-repository settings carried into every workspace snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSettings {
    /// Commands run inside a fresh workspace before the assistant starts
    #[serde(default)]
    pub pre_commands: Vec<String>,

    /// Key/value configuration forwarded to the assistant environment
    #[serde(default)]
    pub assistant_config: HashMap<String, String>,

    /// Allow jobs to run directly in the source directory (no snapshot).
    /// Off by default; reserved for trusted maintenance repositories.
    #[serde(default)]
    pub direct_access: bool,
}

/// A registered source repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    /// Unique name; matches the on-disk directory name
    pub name: String,

    /// Remote origin URL the repository was cloned from
    pub git_url: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Clone pipeline state
    pub clone_status: CloneStatus,

    /// Whether the semantic index was bootstrapped for this repository
    #[serde(default)]
    pub cidx_aware: bool,

    /// Inactive repositories are hidden from job submission
    #[serde(default = "default_active")]
    pub active: bool,

    /// When the repository was registered
    pub registered_at: DateTime<Utc>,

    /// When the record was last written
    pub last_updated: DateTime<Utc>,

    /// Nested settings sub-record
    #[serde(default)]
    pub settings: RepoSettings,
}

fn default_active() -> bool {
    true
}

impl RepoRecord {
    /// Create a record in the `cloning` state
    pub fn new(name: String, git_url: String, description: String, cidx_aware: bool) -> Self {
        let now = Utc::now();
        Self {
            name,
            git_url,
            description,
            clone_status: CloneStatus::Cloning,
            cidx_aware,
            active: true,
            registered_at: now,
            last_updated: now,
            settings: RepoSettings::default(),
        }
    }

    /// A repository is eligible as a job source only when its clone completed
    pub fn is_ready(&self) -> bool {
        self.active && self.clone_status == CloneStatus::Completed
    }

    /// Path of the embedded settings file for a repository directory
    pub fn settings_path(repo_dir: &Path) -> PathBuf {
        repo_dir.join(SETTINGS_FILE)
    }

    /// Load the record embedded in a repository directory
    pub fn load(repo_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(repo_dir);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read repo settings from {}", path.display()))?;
        let record: RepoRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse repo settings at {}", path.display()))?;
        Ok(record)
    }

    /// Persist the record into the repository directory.
    ///
    /// Atomic write: the temp file also lives inside the repository
    /// directory, so no path outside it is ever touched.
    pub fn save(&mut self, repo_dir: &Path) -> Result<()> {
        self.last_updated = Utc::now();

        let path = Self::settings_path(repo_dir);
        let content = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize repo settings")?;

        let temp_path = repo_dir.join(format!("{}.tmp", SETTINGS_FILE));
        let mut temp_file = std::fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write repo settings")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync repo settings")?;

        std::fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename repo settings into {}", path.display()))?;

        Ok(())
    }
}
