//! Server configuration loading and management

mod io;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root of all persistent state; contains `repos/` and `jobs/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Worker pool size: jobs allowed in `running` simultaneously
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Fallback job timeout when the caller supplies none
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Terminal records and workspaces older than this are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// When true, `create` enqueues immediately; otherwise an explicit
    /// `start` call is required
    #[serde(default)]
    pub auto_start: bool,

    /// Queue depth beyond which the scheduler delays admissions.
    /// `create` itself never rejects.
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,

    /// Treat a source-pull failure as fatal (`git_failed`) instead of
    /// proceeding with the last-known source state
    #[serde(default)]
    pub strict_source_pull: bool,

    /// Assistant binary settings
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Semantic indexer settings
    #[serde(default)]
    pub cidx: CidxConfig,
}

/// Assistant binary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Executable invoked per job
    #[serde(default = "default_assistant_binary")]
    pub binary: String,

    /// Deadline for the one-shot title generation call
    #[serde(default = "default_title_timeout")]
    pub title_timeout_seconds: u64,
}

/// Semantic indexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidxConfig {
    /// Indexer executable
    #[serde(default = "default_cidx_binary")]
    pub binary: String,

    /// Use the long-lived watch strategy; off means reconcile-only
    #[serde(default = "default_true")]
    pub watch_enabled: bool,

    /// Warm-up window in which a dying watcher triggers the fallback
    #[serde(default = "default_watch_startup_timeout")]
    pub watch_startup_timeout: u64,

    /// Grace granted to the watcher at teardown before SIGKILL
    #[serde(default = "default_watch_termination_timeout")]
    pub watch_termination_timeout: u64,

    /// Fall back to one-shot reconcile when the watcher fails
    #[serde(default = "default_true")]
    pub fallback_on_watch_failure: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/claude-batch")
}

fn default_max_concurrent() -> usize {
    5
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

fn default_queue_high_water() -> usize {
    100
}

fn default_assistant_binary() -> String {
    "claude".to_string()
}

fn default_title_timeout() -> u64 {
    10
}

fn default_cidx_binary() -> String {
    "cidx".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_startup_timeout() -> u64 {
    30
}

fn default_watch_termination_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent: default_max_concurrent(),
            default_timeout_seconds: default_timeout_seconds(),
            retention_days: default_retention_days(),
            auto_start: false,
            queue_high_water: default_queue_high_water(),
            strict_source_pull: false,
            assistant: AssistantConfig::default(),
            cidx: CidxConfig::default(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: default_assistant_binary(),
            title_timeout_seconds: default_title_timeout(),
        }
    }
}

impl Default for CidxConfig {
    fn default() -> Self {
        Self {
            binary: default_cidx_binary(),
            watch_enabled: true,
            watch_startup_timeout: default_watch_startup_timeout(),
            watch_termination_timeout: default_watch_termination_timeout(),
            fallback_on_watch_failure: true,
        }
    }
}

impl ServerConfig {
    /// Directory holding registered source repositories
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    /// Directory holding job records and job workspaces
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// Default config file location under the data dir
    pub fn default_path(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.default_timeout_seconds, 300);
        assert_eq!(config.retention_days, 30);
        assert!(!config.auto_start);
        assert!(config.cidx.watch_enabled);
        assert_eq!(config.cidx.watch_startup_timeout, 30);
        assert_eq!(config.cidx.watch_termination_timeout, 10);
        assert!(config.cidx.fallback_on_watch_failure);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            data_dir = "/tmp/cb"
            max_concurrent = 2

            [cidx]
            watch_enabled = false
            "#,
        )
        .expect("parse");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/cb"));
        assert_eq!(config.max_concurrent, 2);
        assert!(!config.cidx.watch_enabled);
        assert_eq!(config.default_timeout_seconds, 300);
        assert_eq!(config.assistant.binary, "claude");
    }
}
