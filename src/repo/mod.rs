//! Repository registry
//!
//! Owns the `<repos>/` tree. Each registered repository is a directory
//! whose only metadata is the embedded settings file; the in-memory index
//! is rebuilt from those files on startup. Registration drives the
//! clone -> configure -> fully-index pipeline in the background.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cidx::Cidx;
use crate::domain::{CloneStatus, RepoRecord};
use crate::error::{EngineError, EngineResult};
use crate::fsutil::{self, validate};
use crate::git;

/// Registration request as received from the API layer
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub name: String,
    pub git_url: String,
    pub description: String,
    pub cidx_aware: bool,
}

struct RegistryInner {
    repos_dir: PathBuf,
    cidx: Cidx,
    records: RwLock<HashMap<String, RepoRecord>>,
    pull_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Registry over the repositories directory
pub struct RepoRegistry {
    inner: Arc<RegistryInner>,
}

impl RepoRegistry {
    pub fn new(repos_dir: impl Into<PathBuf>, cidx: Cidx) -> Result<Self> {
        let repos_dir = repos_dir.into();
        std::fs::create_dir_all(&repos_dir)
            .with_context(|| format!("Failed to create repos dir {}", repos_dir.display()))?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                repos_dir,
                cidx,
                records: RwLock::new(HashMap::new()),
                pull_locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Directory of a repository by name
    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.inner.repos_dir.join(name)
    }

    /// Rebuild the index by scanning embedded settings files.
    ///
    /// Directories without a settings file are clones the server died
    /// inside of; they are left on disk and reported, not adopted.
    pub fn scan(&self) -> Result<usize> {
        let mut records = self
            .inner
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner());
        records.clear();

        for entry in std::fs::read_dir(&self.inner.repos_dir)
            .with_context(|| format!("Failed to read {}", self.inner.repos_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            match RepoRecord::load(&dir) {
                Ok(record) => {
                    records.insert(record.name.clone(), record);
                }
                Err(e) => {
                    warn!(dir = %dir.display(), "directory has no readable settings: {:#}", e);
                }
            }
        }

        info!(count = records.len(), "scanned repository registry");
        Ok(records.len())
    }

    pub fn get(&self, name: &str) -> Option<RepoRecord> {
        let records = self.inner.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(name).cloned()
    }

    /// All repositories sorted by name
    pub fn list(&self) -> Vec<RepoRecord> {
        let records = self.inner.records.read().unwrap_or_else(|e| e.into_inner());
        let mut repos: Vec<_> = records.values().cloned().collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    }

    /// Whether the repository completed its index bootstrap
    pub fn is_cidx_ready(&self, name: &str) -> bool {
        self.get(name)
            .map(|r| r.is_ready() && r.cidx_aware)
            .unwrap_or(false)
    }

    /// Update the clone status, persisting the embedded settings file
    pub fn update_status(&self, name: &str, status: CloneStatus) -> EngineResult<RepoRecord> {
        let mut records = self
            .inner
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("repository {}", name)))?;
        record.clone_status = status;

        let dir = self.inner.repos_dir.join(name);
        if dir.is_dir() {
            record.save(&dir).map_err(EngineError::Fatal)?;
        }
        Ok(record.clone())
    }

    /// Exclusive lock guarding source pulls for one repository
    pub fn pull_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .pull_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Register a repository and launch the clone pipeline.
    ///
    /// Returns the record in the `cloning` state; callers poll `get` until
    /// it settles. Validation failures change no state.
    pub fn register(&self, req: RegisterRequest) -> EngineResult<RepoRecord> {
        validate::validate_name(&req.name)?;
        validate::validate_url(&req.git_url)?;

        {
            let records = self.inner.records.read().unwrap_or_else(|e| e.into_inner());
            if records.contains_key(&req.name) {
                return Err(EngineError::conflict(format!(
                    "repository {} already exists",
                    req.name
                )));
            }
        }
        if self.repo_dir(&req.name).exists() {
            return Err(EngineError::conflict(format!(
                "repository directory {} already exists",
                req.name
            )));
        }

        let record = RepoRecord::new(
            req.name.clone(),
            req.git_url,
            req.description,
            req.cidx_aware,
        );
        {
            let mut records = self
                .inner
                .records
                .write()
                .unwrap_or_else(|e| e.into_inner());
            records.insert(req.name.clone(), record.clone());
        }

        let inner = Arc::clone(&self.inner);
        let task_record = record.clone();
        tokio::spawn(async move {
            inner.run_registration(task_record).await;
        });

        Ok(record)
    }

    /// Remove a repository: directory, embedded record, and index entry
    pub async fn unregister(&self, name: &str) -> EngineResult<()> {
        validate::validate_name(name)?;

        let existed = {
            let mut records = self
                .inner
                .records
                .write()
                .unwrap_or_else(|e| e.into_inner());
            records.remove(name).is_some()
        };
        let dir = self.repo_dir(name);
        if !existed && !dir.exists() {
            return Err(EngineError::not_found(format!("repository {}", name)));
        }

        let removal = tokio::task::spawn_blocking(move || fsutil::rm_tree_as(&dir, 0))
            .await
            .map_err(|e| EngineError::Fatal(e.into()))?;
        removal.map_err(EngineError::Fatal)?;
        Ok(())
    }

    /// Poll until a registration settles (CLI and test helper)
    pub async fn wait_settled(&self, name: &str, timeout: Duration) -> EngineResult<RepoRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .get(name)
                .ok_or_else(|| EngineError::not_found(format!("repository {}", name)))?;
            if record.clone_status != CloneStatus::Cloning {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::transient(format!(
                    "repository {} still cloning after {:?}",
                    name, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

impl RegistryInner {
    async fn run_registration(self: Arc<Self>, mut record: RepoRecord) {
        let dir = self.repos_dir.join(&record.name);
        let outcome = self.registration_pipeline(&mut record, &dir).await;

        match outcome {
            Ok(()) => {
                record.clone_status = CloneStatus::Completed;
                info!(repo = %record.name, "repository registration completed");
            }
            Err(e) => {
                record.clone_status = CloneStatus::Failed;
                // Directory is kept for diagnostics; unregister is the recovery path.
                error!(repo = %record.name, "repository registration failed: {:#}", e);
            }
        }

        if dir.is_dir() {
            if let Err(e) = record.save(&dir) {
                error!(repo = %record.name, "failed to persist repo settings: {:#}", e);
            }
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.name.clone(), record);
    }

    async fn registration_pipeline(&self, record: &mut RepoRecord, dir: &Path) -> Result<()> {
        git::clone(&record.git_url, dir).await?;

        // The settings file lands as soon as the directory exists, so a
        // crash from here on leaves a scannable record.
        record.save(dir)?;

        if record.cidx_aware {
            self.cidx.start(dir, None).await?;
            self.cidx.fix_config(dir, None).await?;
            self.cidx.index(dir, None).await?;
        }
        Ok(())
    }
}
