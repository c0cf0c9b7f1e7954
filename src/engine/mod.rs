//! Job execution engine facade
//!
//! Explicit constructor wiring at the process entry point: the facade owns
//! the store, registry, and scheduler, and exposes the operations the
//! external API layer consumes. Every state transition visible through
//! `get`/`list` has been durably persisted first.

pub mod pipeline;
pub mod recovery;
pub mod scheduler;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::{self, AssistantRunner, ClaudeRunner};
use crate::cidx::Cidx;
use crate::config::ServerConfig;
use crate::domain::{Job, JobId, JobOptions, JobStatus, UserIdentity};
use crate::error::{EngineError, EngineResult};
use crate::fsutil::{self, validate};
use crate::job::JobStore;
use crate::process::registry;
use crate::repo::RepoRegistry;
use crate::workspace::{self, UploadedFile};

use scheduler::Scheduler;

/// How long `delete` waits for a cancelled job to settle
const DELETE_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra wait after the forceful kill during delete
const DELETE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Job creation parameters from the API layer
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub user: UserIdentity,
    pub prompt: String,
    pub repo: String,
    pub uploaded_files: Vec<UploadedFile>,
    pub options: CreateOptions,
}

/// Caller-supplied execution options; unset fields fall back to config
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub timeout_seconds: Option<u64>,
    pub auto_cleanup: bool,
    pub git_aware: bool,
    pub cidx_aware: bool,
    pub env: HashMap<String, String>,
}

/// Result of a delete call
#[derive(Debug, Clone, Copy)]
pub struct DeleteOutcome {
    /// A live assistant or watcher had to be terminated
    pub terminated: bool,
    /// The job directory (workspace included) was removed
    pub workspace_removed: bool,
}

/// The engine facade
pub struct Engine {
    config: Arc<ServerConfig>,
    store: Arc<JobStore>,
    repos: Arc<RepoRegistry>,
    scheduler: Scheduler,
}

impl Engine {
    /// Wire up an engine with the production assistant runner
    pub fn new(config: ServerConfig) -> Result<Self> {
        let runner = Arc::new(ClaudeRunner::new(&config.assistant.binary));
        Self::with_runner(config, runner)
    }

    /// Wire up an engine with a specific assistant runner (test seam)
    pub fn with_runner(config: ServerConfig, runner: Arc<dyn AssistantRunner>) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

        let store = Arc::new(JobStore::new(config.jobs_dir())?);
        let repos = Arc::new(RepoRegistry::new(
            config.repos_dir(),
            Cidx::new(&config.cidx.binary),
        )?);
        let scheduler = Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&repos),
            runner,
        );

        Ok(Self {
            config,
            store,
            repos,
            scheduler,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn repos(&self) -> &Arc<RepoRegistry> {
        &self.repos
    }

    /// Rehydrate state, run crash recovery, then start scheduling
    pub async fn start(&self) -> Result<()> {
        let jobs = self.store.load_all()?;
        let repos = self.repos.scan()?;
        info!(jobs, repos, "engine state rehydrated");

        recovery::recover(&self.store).await?;
        self.scheduler.start();
        Ok(())
    }

    /// Stop admitting work and drain in-flight jobs
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Create a job record. Returns once the record (with its generated
    /// title) is durable; the caller polls `get` for progress.
    pub async fn create(&self, req: CreateRequest) -> EngineResult<(JobId, JobStatus)> {
        validate::validate_name(&req.repo)?;
        for file in &req.uploaded_files {
            validate::validate_path(&file.name)?;
        }
        for key in req.options.env.keys() {
            validate::validate_env_key(key)?;
        }

        let repo = self
            .repos
            .get(&req.repo)
            .ok_or_else(|| EngineError::not_found(format!("repository {}", req.repo)))?;
        if !repo.is_ready() {
            return Err(EngineError::conflict(format!(
                "repository {} is not ready (status: {})",
                repo.name, repo.clone_status
            )));
        }

        let id = Uuid::new_v4();
        let job_dir = self.store.job_dir(id);
        std::fs::create_dir_all(&job_dir)
            .with_context(|| format!("Failed to create {}", job_dir.display()))
            .map_err(EngineError::Fatal)?;

        let uploaded = workspace::stage_uploads(&job_dir, &req.uploaded_files)
            .map_err(EngineError::Fatal)?;

        // Synchronous so clients immediately see a human-readable label.
        let title = agent::generate_title(
            &self.config.assistant.binary,
            &req.prompt,
            Duration::from_secs(self.config.assistant.title_timeout_seconds),
        )
        .await;

        let options = JobOptions {
            timeout_seconds: req
                .options
                .timeout_seconds
                .unwrap_or(self.config.default_timeout_seconds),
            auto_cleanup: req.options.auto_cleanup,
            git_aware: req.options.git_aware,
            cidx_aware: req.options.cidx_aware,
            env: req.options.env,
        };

        let mut job = Job::new(
            id,
            req.user,
            req.prompt,
            title,
            repo.name,
            job_dir.join("workspace"),
            options,
        );
        job.uploaded_files = uploaded;

        self.store.create(job).map_err(EngineError::Fatal)?;
        debug!(job_id = %id, "job created");

        if self.config.auto_start {
            self.enqueue(id)?;
            return Ok((id, JobStatus::Queued));
        }
        Ok((id, JobStatus::Created))
    }

    fn enqueue(&self, id: JobId) -> EngineResult<()> {
        self.store
            .mutate(id, |j| {
                if j.status == JobStatus::Created {
                    j.set_status(JobStatus::Queued);
                }
            })
            .map_err(EngineError::Fatal)?;
        self.scheduler.wake();
        Ok(())
    }

    /// Enqueue a created job; idempotent on already-queued jobs
    pub async fn start_job(&self, id: JobId) -> EngineResult<usize> {
        let job = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("job {}", id)))?;

        match job.status {
            JobStatus::Created => {
                self.enqueue(id)?;
            }
            JobStatus::Queued => {}
            status => {
                return Err(EngineError::conflict(format!(
                    "job {} cannot be started from status {}",
                    id, status
                )));
            }
        }

        Ok(self.scheduler.queue_position(id).unwrap_or(1))
    }

    /// Fetch a job, with a fresh queue position when queued
    pub fn get(&self, id: JobId) -> EngineResult<Job> {
        let mut job = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("job {}", id)))?;
        if job.status == JobStatus::Queued {
            job.queue_position = self.scheduler.queue_position(id);
        }
        Ok(job)
    }

    /// List jobs, newest first; optionally restricted to one user
    pub fn list(&self, username: Option<&str>) -> Vec<Job> {
        let mut jobs = match username {
            Some(user) => self.store.list_for_user(user),
            None => self.store.list(),
        };
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let positions: HashMap<JobId, usize> = self
            .scheduler
            .queued_snapshot()
            .iter()
            .enumerate()
            .map(|(i, j)| (j.id, i + 1))
            .collect();
        for job in &mut jobs {
            if job.status == JobStatus::Queued {
                job.queue_position = positions.get(&job.id).copied();
            }
        }
        jobs
    }

    /// Request cancellation. Idempotent; queued jobs cancel immediately,
    /// in-flight jobs pass through `cancelling` until their subprocesses
    /// are observed to exit.
    pub async fn cancel(&self, id: JobId) -> EngineResult<JobStatus> {
        let job = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("job {}", id)))?;

        match job.status {
            JobStatus::Cancelled => return Ok(JobStatus::Cancelled),
            JobStatus::Cancelling => return Ok(JobStatus::Cancelling),
            status if status.is_terminal() => {
                return Err(EngineError::conflict(format!(
                    "job {} already finished with status {}",
                    id, status
                )));
            }
            _ => {}
        }

        let flag = self.scheduler.cancel_flag(id);
        flag.request();

        let worker_owned = self.scheduler.is_active(id);
        if worker_owned || job.status == JobStatus::Running {
            let updated = self
                .store
                .mutate(id, |j| {
                    if j.status.may_transition_to(JobStatus::Cancelling) {
                        j.set_status(JobStatus::Cancelling);
                    }
                })
                .map_err(EngineError::Fatal)?;

            if !worker_owned {
                // Re-attached job: no worker to observe the flag, signal
                // the registered processes directly.
                registry::interrupt(id);
            }
            self.scheduler.wake();
            return Ok(updated.map(|j| j.status).unwrap_or(JobStatus::Cancelling));
        }

        // No worker owns the job: drop it from the queue right away.
        let updated = self
            .store
            .mutate(id, |j| {
                if !j.is_finished() {
                    if j.cancel_reason.is_none() {
                        j.cancel_reason = Some("cancelled by user".to_string());
                    }
                    j.queue_position = None;
                    j.set_status(JobStatus::Cancelled);
                }
            })
            .map_err(EngineError::Fatal)?;
        self.scheduler.wake();
        Ok(updated.map(|j| j.status).unwrap_or(JobStatus::Cancelled))
    }

    /// Cancel if needed, wait for subprocess exit, then remove the record
    /// and the job directory.
    pub async fn delete(&self, id: JobId) -> EngineResult<DeleteOutcome> {
        let job = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("job {}", id)))?;

        let mut terminated = false;
        if !job.is_finished() {
            terminated = true;
            let _ = self.cancel(id).await;

            if !self.wait_terminal(id, DELETE_SETTLE_TIMEOUT).await {
                // Graceful cancellation stalled; escalate.
                for pid in registry::interrupt(id) {
                    crate::process::send_signal(pid, crate::process::Signal::Kill);
                }
                self.wait_terminal(id, DELETE_KILL_TIMEOUT).await;
            }
        }

        let job_dir = self.store.job_dir(id);
        let had_dir = job_dir.exists();
        let workspace_removed = if had_dir {
            let dir = job_dir.clone();
            let outcome = tokio::task::spawn_blocking(move || fsutil::rm_tree_as(&dir, 0))
                .await
                .map_err(|e| EngineError::Fatal(e.into()))?;
            outcome.map_err(EngineError::Fatal)?;
            true
        } else {
            false
        };

        self.store.delete(id).map_err(EngineError::Fatal)?;
        registry::remove(id);
        info!(job_id = %id, terminated, workspace_removed, "job deleted");
        Ok(DeleteOutcome {
            terminated,
            workspace_removed,
        })
    }

    async fn wait_terminal(&self, id: JobId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.store.get(id) {
                Some(job) if !job.is_finished() => {}
                _ => return true,
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
