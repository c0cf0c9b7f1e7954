//! Pre-run pipeline
//!
//! Ordered preparation steps between dequeue and assistant launch. Each
//! step yields progress or a typed error; the scheduler reacts to the
//! error tag instead of unwinding through it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cidx::Cidx;
use crate::config::ServerConfig;
use crate::domain::{GitPhase, IndexPhase, Job, JobId, JobStatus, UserIdentity};
use crate::git;
use crate::job::JobStore;
use crate::process::{self, registry, ProcessHandle};
use crate::repo::RepoRegistry;
use crate::workspace;

use super::scheduler::CancelFlag;

/// Typed pipeline outcome the scheduler maps onto the state machine
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source pull failed and strict mode is on (`git_failed`)
    #[error("source pull failed: {0}")]
    SourcePull(String),

    /// Workspace snapshot could not be produced
    #[error("workspace snapshot failed: {0}")]
    Snapshot(String),

    /// Watcher failed and the fallback is disabled
    #[error("index watcher failed: {0}")]
    Watcher(String),

    /// One-shot reconcile failed after a watcher failure
    #[error("index reconcile failed: {0}")]
    Reconcile(String),

    /// Persisting a state transition failed
    #[error("state persistence failed: {0}")]
    Store(String),

    /// Cancel was requested between steps
    #[error("job cancelled")]
    Cancelled,
}

/// Workspace ready for the assistant, plus the watcher to tear down later
pub struct PreparedWorkspace {
    pub workspace: PathBuf,
    pub watcher: Option<ProcessHandle>,
}

/// The pre-run pipeline shared by all workers
pub struct PreRunPipeline {
    config: Arc<ServerConfig>,
    store: Arc<JobStore>,
    repos: Arc<RepoRegistry>,
    cidx: Cidx,
}

impl PreRunPipeline {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<JobStore>,
        repos: Arc<RepoRegistry>,
    ) -> Self {
        let cidx = Cidx::new(&config.cidx.binary);
        Self {
            config,
            store,
            repos,
            cidx,
        }
    }

    fn update(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job),
    ) -> Result<Option<Job>, PipelineError> {
        self.store
            .mutate(id, f)
            .map_err(|e| PipelineError::Store(format!("{:#}", e)))
    }

    /// Transition the job status if still legal; `None` means the job was
    /// cancelled or deleted underneath us and the worker must stop.
    fn transition(&self, id: JobId, next: JobStatus) -> Result<Option<Job>, PipelineError> {
        let mut applied = false;
        let updated = self.update(id, |job| {
            if job.status.may_transition_to(next) {
                job.set_status(next);
                applied = true;
            }
        })?;
        Ok(updated.filter(|_| applied))
    }

    /// Run steps 1-4 for a job. On success the workspace is provisioned,
    /// owned by the submitting user, and (when index-aware) covered by a
    /// live watcher or a completed reconcile.
    pub async fn prepare(
        &self,
        job: &Job,
        cancel: &CancelFlag,
    ) -> Result<PreparedWorkspace, PipelineError> {
        let user = &job.user;
        let repo = self
            .repos
            .get(&job.repo_name)
            .ok_or_else(|| PipelineError::Snapshot(format!("repository {} vanished", job.repo_name)))?;
        let repo_dir = self.repos.repo_dir(&repo.name);

        // Step 1: source pull under the per-repository exclusive lock.
        if cancel.is_requested() {
            return Err(PipelineError::Cancelled);
        }
        if self.transition(job.id, JobStatus::GitPulling)?.is_none() {
            return Err(PipelineError::Cancelled);
        }

        if job.options.git_aware && git::is_git_repo(&repo_dir) {
            self.update(job.id, |j| j.source_pull_status = GitPhase::Pulling)?;

            let lock = self.repos.pull_lock(&repo.name);
            let _guard = lock.lock().await;
            match git::fetch_fast_forward(&repo_dir).await {
                Ok(()) => {
                    self.update(job.id, |j| j.source_pull_status = GitPhase::Pulled)?;
                }
                Err(e) => {
                    self.update(job.id, |j| j.source_pull_status = GitPhase::Failed)?;
                    if self.config.strict_source_pull {
                        return Err(PipelineError::SourcePull(format!("{:#}", e)));
                    }
                    // Proceed with the last-known source state.
                    warn!(job_id = %job.id, repo = %repo.name, "source pull failed: {:#}", e);
                }
            }
        } else {
            self.update(job.id, |j| j.source_pull_status = GitPhase::Skipped)?;
        }

        // Step 2: CoW snapshot into the private job directory.
        if cancel.is_requested() {
            return Err(PipelineError::Cancelled);
        }
        let job_dir = self.store.job_dir(job.id);
        let workspace = workspace::provision(&repo_dir, &job_dir, user)
            .await
            .map_err(|e| PipelineError::Snapshot(format!("{:#}", e)))?;

        let ws_git = if git::is_git_repo(&workspace) {
            GitPhase::Pulled
        } else {
            GitPhase::Skipped
        };
        self.update(job.id, |j| j.workspace_git_status = ws_git)?;

        // Repository pre-commands run in the fresh workspace before any
        // index machinery. Failures are recorded but never fatal.
        for command in &repo.settings.pre_commands {
            if let Err(e) = run_pre_command(command, &workspace, user).await {
                warn!(job_id = %job.id, command = %command, "pre-command failed: {:#}", e);
                self.update(job.id, |j| {
                    j.append_output(&format!("\n[server] pre-command {:?} failed: {:#}\n", command, e));
                })?;
            }
        }

        // Steps 3+4: index watcher with reconcile fallback. Jobs that are
        // not index-aware still pass through the phase (instantaneously)
        // so every history follows the same status chain.
        if cancel.is_requested() {
            return Err(PipelineError::Cancelled);
        }
        if self.transition(job.id, JobStatus::CidxIndexing)?.is_none() {
            return Err(PipelineError::Cancelled);
        }

        let mut watcher = None;
        if job.options.cidx_aware && repo.cidx_aware {
            if self.config.cidx.watch_enabled {
                match self.start_watcher(job.id, &workspace, user).await {
                    Ok(handle) => {
                        self.update(job.id, |j| j.index_status = IndexPhase::Watching)?;
                        watcher = Some(handle);
                    }
                    Err(reason) => {
                        registry::clear_watcher(job.id);
                        if !self.config.cidx.fallback_on_watch_failure {
                            self.update(job.id, |j| j.index_status = IndexPhase::Failed)?;
                            return Err(PipelineError::Watcher(reason));
                        }
                        info!(job_id = %job.id, "watcher failed ({}), reconciling", reason);
                        self.reconcile_fallback(job.id, &workspace, user).await?;
                    }
                }
            } else {
                self.reconcile_once(job.id, &workspace, user).await?;
            }
        } else {
            self.update(job.id, |j| j.index_status = IndexPhase::Skipped)?;
        }

        if cancel.is_requested() || self.transition(job.id, JobStatus::CidxReady)?.is_none() {
            self.teardown(&workspace, watcher, job.id, user).await;
            return Err(PipelineError::Cancelled);
        }

        Ok(PreparedWorkspace { workspace, watcher })
    }

    /// Bootstrap the index service and launch the long-lived watcher.
    ///
    /// The watcher is considered up once it emits its first output line or
    /// survives the warm-up window; an exit inside the window is a failure.
    async fn start_watcher(
        &self,
        job_id: JobId,
        workspace: &Path,
        user: &UserIdentity,
    ) -> Result<ProcessHandle, String> {
        self.cidx
            .start(workspace, Some(user))
            .await
            .map_err(|e| format!("cidx start: {:#}", e))?;
        self.cidx
            .fix_config(workspace, Some(user))
            .await
            .map_err(|e| format!("cidx fix-config: {:#}", e))?;

        let spec = self.cidx.watch_spec(workspace, Some(user));
        let mut handle = process::spawn(spec).map_err(|e| e.to_string())?;
        registry::set_watcher(job_id, handle.pid);

        // Warm-up probe: an exit inside the window is a failure; the first
        // output line (or surviving the whole window) means the watcher is
        // up.
        let warmup = Duration::from_secs(self.config.cidx.watch_startup_timeout);
        let deadline = tokio::time::Instant::now() + warmup;
        let mut output = handle.take_output();
        let mut ready = false;

        while !ready && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), handle.wait()).await {
                Ok(status) => {
                    let status = status.map_err(|e| format!("{:#}", e))?;
                    return Err(format!("watcher exited during warm-up: {}", status));
                }
                Err(_) => {}
            }
            if let Some(rx) = output.as_mut() {
                if rx.try_recv().is_ok() {
                    ready = true;
                }
            }
        }

        // The watcher keeps talking for the whole assistant run; drain its
        // output so it never blocks on a full pipe.
        if let Some(mut rx) = output {
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
        }

        debug!(job_id = %job_id, pid = handle.pid, "watcher is up");
        Ok(handle)
    }

    async fn reconcile_fallback(
        &self,
        job_id: JobId,
        workspace: &Path,
        user: &UserIdentity,
    ) -> Result<(), PipelineError> {
        self.update(job_id, |j| j.index_status = IndexPhase::ReconcilingFallback)?;
        match self.cidx.reconcile(workspace, Some(user)).await {
            Ok(()) => {
                self.update(job_id, |j| j.index_status = IndexPhase::ReadyViaFallback)?;
                Ok(())
            }
            Err(e) => {
                self.update(job_id, |j| j.index_status = IndexPhase::Failed)?;
                Err(PipelineError::Reconcile(format!("{:#}", e)))
            }
        }
    }

    /// Watch strategy disabled: plain one-shot reconcile
    async fn reconcile_once(
        &self,
        job_id: JobId,
        workspace: &Path,
        user: &UserIdentity,
    ) -> Result<(), PipelineError> {
        match self.cidx.reconcile(workspace, Some(user)).await {
            Ok(()) => {
                self.update(job_id, |j| j.index_status = IndexPhase::Ready)?;
                Ok(())
            }
            Err(e) => {
                self.update(job_id, |j| j.index_status = IndexPhase::Failed)?;
                Err(PipelineError::Reconcile(format!("{:#}", e)))
            }
        }
    }

    /// Tear down per-job index machinery. Always safe to call; errors are
    /// logged, not propagated.
    pub async fn teardown(
        &self,
        workspace: &Path,
        watcher: Option<ProcessHandle>,
        job_id: JobId,
        user: &UserIdentity,
    ) {
        if let Some(mut handle) = watcher {
            let grace = Duration::from_secs(self.config.cidx.watch_termination_timeout);
            match handle.terminate(grace).await {
                Ok(status) => debug!(job_id = %job_id, "watcher stopped: {}", status),
                Err(e) => warn!(job_id = %job_id, "watcher termination failed: {:#}", e),
            }
            registry::clear_watcher(job_id);
        }

        // Best-effort indexer stop, but only when the index phase actually
        // ran in this workspace.
        let index_active = self
            .store
            .get(job_id)
            .map(|j| !matches!(j.index_status, IndexPhase::Skipped | IndexPhase::Pending))
            .unwrap_or(false);
        if index_active && workspace.is_dir() {
            let timeout = Duration::from_secs(self.config.cidx.watch_termination_timeout);
            self.cidx
                .stop_with_timeout(workspace, Some(user), timeout)
                .await;
        }
    }
}

/// Run one repository pre-command in the workspace.
///
/// The stored string is split on whitespace into an argument vector; there
/// is deliberately no shell in the path.
async fn run_pre_command(
    command: &str,
    workspace: &Path,
    user: &UserIdentity,
) -> anyhow::Result<()> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(());
    };
    let spec = process::ProcessSpec::new(program)
        .args(parts.map(str::to_string))
        .cwd(workspace)
        .run_as(Some(user.clone()));

    let mut handle = process::spawn(spec)?;
    let mut rx = handle.take_output();
    let drain = async {
        if let Some(rx) = rx.as_mut() {
            while rx.recv().await.is_some() {}
        }
    };
    let (status, ()) = tokio::join!(handle.wait(), drain);
    let status = status?;
    if !status.success() {
        anyhow::bail!("exited with {}", status);
    }
    Ok(())
}
