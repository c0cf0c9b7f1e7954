//! Configuration file I/O operations

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;

use super::ServerConfig;

impl ServerConfig {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration, creating a default file if none exists.
    ///
    /// Uses file locking so concurrent first starts don't race on the
    /// initial write.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let default_config = ServerConfig::default();
            default_config.save_to_file(path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            return Ok(default_config);
        }
        Self::from_file(path)
    }

    /// Save configuration to a file with atomic write and file locking.
    ///
    /// 1. Exclusive lock prevents concurrent writers
    /// 2. Write-temp + rename prevents corruption on crash
    /// 3. Parent directory is created if needed
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        // Separate lock file so the rename never invalidates the lock.
        let lock_path = path.with_extension("toml.lock");
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        lock_file
            .lock_exclusive()
            .with_context(|| "Failed to acquire config lock")?;

        let temp_path = path.with_extension("toml.tmp");
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write config content")?;

        temp_file
            .sync_all()
            .with_context(|| "Failed to sync config file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename config file: {}", path.display()))?;

        // Lock is released when lock_file is dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_init_creates_default_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");

        let config = ServerConfig::load_or_init(&path).expect("init");
        assert!(path.exists());
        assert_eq!(config.max_concurrent, 5);

        // Second load reads the file back.
        let reloaded = ServerConfig::load_or_init(&path).expect("reload");
        assert_eq!(reloaded.max_concurrent, config.max_concurrent);
    }

    #[test]
    fn save_round_trips_custom_values() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");

        let mut config = ServerConfig::default();
        config.max_concurrent = 9;
        config.cidx.watch_enabled = false;
        config.save_to_file(&path).expect("save");

        let loaded = ServerConfig::from_file(&path).expect("load");
        assert_eq!(loaded.max_concurrent, 9);
        assert!(!loaded.cidx.watch_enabled);
    }
}
