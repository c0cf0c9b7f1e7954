//! Crash-safe on-disk job store
//!
//! Every job is one JSON file under the jobs directory. Writes go through
//! write-temp + fsync + rename, and the in-memory map is only updated after
//! the rename lands, so any observer that reads a status has that status
//! durable on disk already.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::{Job, JobId};

/// Owns all job records, on disk and in memory
pub struct JobStore {
    jobs_dir: PathBuf,
    inner: RwLock<HashMap<JobId, Job>>,
}

impl JobStore {
    /// Open (and create if needed) a store rooted at `jobs_dir`
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        std::fs::create_dir_all(&jobs_dir)
            .with_context(|| format!("Failed to create jobs dir {}", jobs_dir.display()))?;
        Ok(Self {
            jobs_dir,
            inner: RwLock::new(HashMap::new()),
        })
    }

    /// Path of the serialized record for a job
    pub fn record_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", id))
    }

    /// Private directory of a job (workspace, staging, output.log)
    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.jobs_dir.join(id.to_string())
    }

    /// Rehydrate in-memory state from disk. Corrupt records are skipped
    /// (and kept on disk for inspection), never deleted.
    pub fn load_all(&self) -> Result<usize> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.clear();

        for entry in std::fs::read_dir(&self.jobs_dir)
            .with_context(|| format!("Failed to read {}", self.jobs_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(job) => {
                    guard.insert(job.id, job);
                }
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable job record: {:#}", e);
                }
            }
        }

        debug!(count = guard.len(), "rehydrated job records");
        Ok(guard.len())
    }

    fn read_record(path: &Path) -> Result<Job> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Persist a brand-new job record
    pub fn create(&self, job: Job) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        self.persist(&job)?;
        guard.insert(job.id, job);
        Ok(())
    }

    /// Persist a full replacement of an existing record
    pub fn update(&self, job: Job) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        self.persist(&job)?;
        guard.insert(job.id, job);
        Ok(())
    }

    /// Apply a mutation to a job and persist the result atomically.
    ///
    /// Returns the updated record, or `None` when the job does not exist.
    /// The write lock is held across the disk write, which is what makes
    /// a `get` racing with this call return either the old durable state
    /// or the new durable state, never an unpersisted one.
    pub fn mutate(&self, id: JobId, f: impl FnOnce(&mut Job)) -> Result<Option<Job>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(current) = guard.get(&id) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        f(&mut updated);
        self.persist(&updated)?;
        guard.insert(id, updated.clone());
        Ok(Some(updated))
    }

    /// Get a copy of a job by id
    pub fn get(&self, id: JobId) -> Option<Job> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&id).cloned()
    }

    /// All jobs, unordered
    pub fn list(&self) -> Vec<Job> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.values().cloned().collect()
    }

    /// Jobs owned by a user
    pub fn list_for_user(&self, username: &str) -> Vec<Job> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard
            .values()
            .filter(|j| j.username == username)
            .cloned()
            .collect()
    }

    /// Remove a job record from disk and memory
    pub fn delete(&self, id: JobId) -> Result<Option<Job>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
        Ok(guard.remove(&id))
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    /// The rename is retried once; transient EBUSY-style failures on
    /// network filesystems resolve on the second attempt.
    fn persist(&self, job: &Job) -> Result<()> {
        let path = self.record_path(job.id);
        let temp_path = self.jobs_dir.join(format!(".{}.json.tmp", job.id));

        let content =
            serde_json::to_string_pretty(job).with_context(|| "Failed to serialize job")?;

        let mut temp_file = std::fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write job record")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync job record")?;
        drop(temp_file);

        if let Err(first) = std::fs::rename(&temp_path, &path) {
            warn!(job_id = %job.id, "rename failed ({}), retrying once", first);
            std::fs::rename(&temp_path, &path)
                .with_context(|| format!("Failed to rename into {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobOptions, JobStatus};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_job(id: JobId) -> Job {
        let user = crate::domain::UserIdentity {
            username: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/alice"),
        };
        Job::new(
            id,
            user,
            "prompt".to_string(),
            "title".to_string(),
            "demo".to_string(),
            PathBuf::from("/tmp/ws"),
            JobOptions::default(),
        )
    }

    #[test]
    fn create_persists_before_returning() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let id = Uuid::new_v4();

        store.create(test_job(id)).expect("create");

        let on_disk: Job =
            serde_json::from_str(&std::fs::read_to_string(store.record_path(id)).unwrap())
                .expect("parse");
        assert_eq!(on_disk.id, id);
        assert_eq!(on_disk.status, JobStatus::Created);
    }

    #[test]
    fn mutate_is_durable_before_visible() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let id = Uuid::new_v4();
        store.create(test_job(id)).expect("create");

        store
            .mutate(id, |j| j.set_status(JobStatus::Queued))
            .expect("mutate")
            .expect("exists");

        // Any observable status must match the on-disk record.
        let visible = store.get(id).expect("get").status;
        let on_disk: Job =
            serde_json::from_str(&std::fs::read_to_string(store.record_path(id)).unwrap())
                .expect("parse");
        assert_eq!(visible, on_disk.status);
        assert_eq!(on_disk.status, JobStatus::Queued);
    }

    #[test]
    fn mutate_missing_job_returns_none() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let out = store.mutate(Uuid::new_v4(), |_| {}).expect("mutate");
        assert!(out.is_none());
    }

    #[test]
    fn load_all_rehydrates_and_skips_corrupt() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(test_job(a)).expect("create");
        store.create(test_job(b)).expect("create");

        // A torn write from a crashed server.
        std::fs::write(tmp.path().join(format!("{}.json", Uuid::new_v4())), "{gar")
            .expect("write");

        let fresh = JobStore::new(tmp.path()).expect("store");
        let count = fresh.load_all().expect("load");
        assert_eq!(count, 2);
        assert!(fresh.get(a).is_some());
        assert!(fresh.get(b).is_some());
    }

    #[test]
    fn delete_removes_record_and_file() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let id = Uuid::new_v4();
        store.create(test_job(id)).expect("create");

        let removed = store.delete(id).expect("delete");
        assert!(removed.is_some());
        assert!(store.get(id).is_none());
        assert!(!store.record_path(id).exists());

        // Idempotent.
        assert!(store.delete(id).expect("delete again").is_none());
    }

    #[test]
    fn no_partial_writes_visible() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JobStore::new(tmp.path()).expect("store");
        let id = Uuid::new_v4();
        let mut job = test_job(id);
        job.output = "x".repeat(64 * 1024);
        store.create(job).expect("create");

        // The only json file present parses cleanly (temp files are dotted).
        for entry in std::fs::read_dir(tmp.path()).expect("read_dir") {
            let path = entry.expect("entry").path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let content = std::fs::read_to_string(&path).expect("read");
                serde_json::from_str::<Job>(&content).expect("coherent record");
            }
        }
    }
}
