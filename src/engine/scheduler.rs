//! Scheduler loop and job workers
//!
//! A single cooperative loop dequeues jobs FIFO and hands each to a worker
//! task holding one of `max_concurrent` semaphore permits. Workers drive a
//! job end-to-end: pre-run pipeline, assistant supervision, terminal
//! persistence, teardown. Every transition is durable before it becomes
//! observable.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AssistantRequest, AssistantRunner};
use crate::config::ServerConfig;
use crate::domain::{Job, JobId, JobStatus};
use crate::fsutil;
use crate::job::JobStore;
use crate::process::{registry, ProcessHandle};
use crate::repo::RepoRegistry;

use super::pipeline::{PipelineError, PreRunPipeline, PreparedWorkspace};

/// Idle poll interval of the scheduler loop
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay inserted between admissions when the queue is over the high-water mark
const ADMISSION_DELAY: Duration = Duration::from_millis(250);

/// Grace between SIGTERM and SIGKILL for assistant termination
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Retention sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Output lines buffered before the job record is persisted again
const FLUSH_EVERY_LINES: usize = 32;

/// Cooperative cancellation handle shared between the facade and a worker
#[derive(Debug, Default)]
pub struct CancelFlag {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once a cancel has been requested
    pub async fn cancelled(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

struct SchedulerInner {
    config: Arc<ServerConfig>,
    store: Arc<JobStore>,
    runner: Arc<dyn AssistantRunner>,
    repos: Arc<RepoRegistry>,
    pipeline: PreRunPipeline,
    slots: Arc<Semaphore>,
    cancels: Mutex<HashMap<JobId, Arc<CancelFlag>>>,
    active: Mutex<HashSet<JobId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    wake: Notify,
    shutdown: CancelFlag,
    last_sweep: Mutex<Option<tokio::time::Instant>>,
}

/// The background scheduling task and its shared state
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<JobStore>,
        repos: Arc<RepoRegistry>,
        runner: Arc<dyn AssistantRunner>,
    ) -> Self {
        let pipeline = PreRunPipeline::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&repos),
        );
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                runner,
                repos,
                pipeline,
                slots,
                cancels: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
                wake: Notify::new(),
                shutdown: CancelFlag::new(),
                last_sweep: Mutex::new(None),
            }),
            loop_handle: Mutex::new(None),
        }
    }

    /// Launch the background loop
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner));
        let mut guard = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(handle);
    }

    /// Nudge the loop after enqueuing or finishing work
    pub fn wake(&self) {
        self.inner.wake.notify_waiters();
    }

    /// Whether a worker currently owns this job
    pub fn is_active(&self, id: JobId) -> bool {
        let guard = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        guard.contains(&id)
    }

    /// Get or create the cancel flag for a job
    pub fn cancel_flag(&self, id: JobId) -> Arc<CancelFlag> {
        let mut guard = self.inner.cancels.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(id).or_default())
    }

    /// Queued jobs in dispatch order: `created_at`, ties by id
    pub fn queued_snapshot(&self) -> Vec<Job> {
        self.inner.queued_snapshot()
    }

    /// 1-indexed position among queued jobs
    pub fn queue_position(&self, id: JobId) -> Option<usize> {
        self.inner
            .queued_snapshot()
            .iter()
            .position(|j| j.id == id)
            .map(|i| i + 1)
    }

    /// Remove expired terminal jobs (records and workspaces)
    pub async fn sweep_retention(&self) -> usize {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.sweep_blocking())
            .await
            .unwrap_or(0)
    }

    /// Stop admitting work and wait for in-flight workers
    pub async fn shutdown(&self) {
        self.inner.shutdown.request();
        self.inner.wake.notify_waiters();

        let loop_handle = {
            let mut guard = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }

        let workers: Vec<_> = {
            let mut guard = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        let _ = futures::future::join_all(workers).await;
        info!("scheduler drained");
    }
}

impl SchedulerInner {
    fn queued_snapshot(&self) -> Vec<Job> {
        let mut queued: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        queued.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        queued
    }

    fn cancel_flag(&self, id: JobId) -> Arc<CancelFlag> {
        let mut guard = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(id).or_default())
    }

    fn sweep_blocking(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let mut removed = 0;
        for job in self.store.list() {
            if !job.is_finished() {
                continue;
            }
            let Some(done) = job.completed_at else {
                continue;
            };
            if done >= cutoff {
                continue;
            }
            let dir = self.store.job_dir(job.id);
            if let Err(e) = fsutil::rm_tree_as(&dir, 0) {
                warn!(job_id = %job.id, "sweep could not remove {}: {:#}", dir.display(), e);
                continue;
            }
            if let Err(e) = self.store.delete(job.id) {
                warn!(job_id = %job.id, "sweep could not delete record: {:#}", e);
            } else {
                removed += 1;
            }
        }
        removed
    }
}

async fn maybe_sweep(inner: &Arc<SchedulerInner>) {
    let due = {
        let mut guard = inner.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        let now = tokio::time::Instant::now();
        match *guard {
            Some(last) if now.duration_since(last) < SWEEP_INTERVAL => false,
            _ => {
                *guard = Some(now);
                true
            }
        }
    };
    if due {
        let sweeper = Arc::clone(inner);
        let removed = tokio::task::spawn_blocking(move || sweeper.sweep_blocking())
            .await
            .unwrap_or(0);
        if removed > 0 {
            info!(removed, "retention sweep removed expired jobs");
        }
    }
}

async fn run_loop(inner: Arc<SchedulerInner>) {
    debug!(max_concurrent = inner.config.max_concurrent, "scheduler loop started");
    loop {
        if inner.shutdown.is_requested() {
            break;
        }

        maybe_sweep(&inner).await;

        let queued = inner.queued_snapshot();
        let over_high_water = queued.len() > inner.config.queue_high_water;

        for job in queued {
            if inner.shutdown.is_requested() {
                break;
            }
            {
                let active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
                if active.contains(&job.id) {
                    continue;
                }
            }
            let Ok(permit) = Arc::clone(&inner.slots).try_acquire_owned() else {
                // All workers busy; FIFO order resumes on the next pass.
                break;
            };
            {
                let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
                active.insert(job.id);
            }
            let worker_inner = Arc::clone(&inner);
            let handle = tokio::spawn(worker(worker_inner, job.id, permit));
            {
                let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
            }
            if over_high_water {
                tokio::time::sleep(ADMISSION_DELAY).await;
            }
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
    debug!("scheduler loop exited");
}

async fn worker(inner: Arc<SchedulerInner>, job_id: JobId, permit: OwnedSemaphorePermit) {
    let cancel = inner.cancel_flag(job_id);

    if let Err(e) = run_job(&inner, job_id, &cancel).await {
        error!(job_id = %job_id, "worker failed: {:#}", e);
        let _ = inner.store.mutate(job_id, |j| {
            if !j.is_finished() {
                j.fail(format!("internal error: {:#}", e));
            }
        });
    }

    {
        let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&job_id);
    }
    {
        let mut cancels = inner.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels.remove(&job_id);
    }
    registry::remove(job_id);
    drop(permit);
    inner.wake.notify_waiters();
}

async fn run_job(
    inner: &Arc<SchedulerInner>,
    job_id: JobId,
    cancel: &Arc<CancelFlag>,
) -> Result<()> {
    let Some(job) = inner.store.get(job_id) else {
        return Ok(());
    };
    // Cancel or delete may have raced the dequeue.
    if job.status != JobStatus::Queued {
        return Ok(());
    }
    if cancel.is_requested() {
        finish_cancelled(inner, job_id)?;
        return Ok(());
    }

    let prepared = match inner.pipeline.prepare(&job, cancel).await {
        Ok(p) => p,
        Err(PipelineError::Cancelled) => {
            finish_cancelled(inner, job_id)?;
            return Ok(());
        }
        Err(PipelineError::SourcePull(msg)) => {
            inner.store.mutate(job_id, |j| {
                j.append_output(&format!("\n[server] source pull failed: {}\n", msg));
                if j.status.may_transition_to(JobStatus::GitFailed) {
                    j.set_status(JobStatus::GitFailed);
                }
            })?;
            return Ok(());
        }
        Err(e) => {
            inner.store.mutate(job_id, |j| {
                if !j.is_finished() {
                    j.fail(e.to_string());
                }
            })?;
            return Ok(());
        }
    };
    let PreparedWorkspace {
        workspace,
        mut watcher,
    } = prepared;

    // Repository-level assistant config first, per-job overrides on top.
    let mut env = inner
        .repos
        .get(&job.repo_name)
        .map(|r| r.settings.assistant_config.clone())
        .unwrap_or_default();
    env.extend(job.options.env.clone());

    let request = AssistantRequest {
        job_id,
        prompt: job.prompt.clone(),
        workspace: workspace.clone(),
        env,
        run_as: Some(job.user.clone()),
    };

    let mut session = match inner.runner.start(&request).await {
        Ok(session) => session,
        Err(e) => {
            inner
                .pipeline
                .teardown(&workspace, watcher.take(), job_id, &job.user)
                .await;
            inner.store.mutate(job_id, |j| {
                if !j.is_finished() {
                    j.fail(format!("assistant spawn failed: {}", e));
                }
            })?;
            return Ok(());
        }
    };
    let pid = session.pid;

    // Commit running (with PID) before it can be observed anywhere. A
    // cancel that slipped in after the pipeline leaves the job in
    // cancelling, in which case the assistant is stopped right away.
    let mut launched = false;
    inner.store.mutate(job_id, |j| {
        if j.status.may_transition_to(JobStatus::Running) {
            j.set_status(JobStatus::Running);
            j.assistant_pid = Some(pid);
            j.queue_position = None;
            launched = true;
        }
    })?;
    if !launched {
        let _ = session.terminate(TERMINATE_GRACE).await;
        inner
            .pipeline
            .teardown(&workspace, watcher.take(), job_id, &job.user)
            .await;
        registry::clear_assistant(job_id);
        finish_cancelled(inner, job_id)?;
        return Ok(());
    }
    info!(job_id = %job_id, pid, "assistant started");

    let timeout = Duration::from_secs(job.options.timeout_seconds.max(1));
    let exit = supervise_assistant(inner, job_id, &mut session, cancel, timeout).await;

    inner
        .pipeline
        .teardown(&workspace, watcher.take(), job_id, &job.user)
        .await;
    registry::clear_assistant(job_id);
    let exit = exit?;

    let final_status = if exit.cancelled {
        JobStatus::Cancelled
    } else if exit.timed_out {
        JobStatus::Timeout
    } else if exit.status.success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };

    inner.store.mutate(job_id, |j| {
        if j.is_finished() {
            return;
        }
        match final_status {
            JobStatus::Cancelled => {
                if j.cancel_reason.is_none() {
                    j.cancel_reason = Some("cancelled by user".to_string());
                }
            }
            _ => {
                j.exit_code = Some(exit_code_of(&exit.status));
            }
        }
        j.queue_position = None;
        j.set_status(final_status);
    })?;
    info!(job_id = %job_id, status = %final_status, "job finished");

    if job.options.auto_cleanup {
        let ws = workspace.clone();
        let removed = tokio::task::spawn_blocking(move || fsutil::rm_tree_as(&ws, 0)).await;
        match removed {
            Ok(Ok(())) => debug!(job_id = %job_id, "workspace auto-cleaned"),
            Ok(Err(e)) => warn!(job_id = %job_id, "auto-cleanup failed: {:#}", e),
            Err(e) => warn!(job_id = %job_id, "auto-cleanup task failed: {:#}", e),
        }
    }

    Ok(())
}

fn finish_cancelled(inner: &Arc<SchedulerInner>, job_id: JobId) -> Result<()> {
    inner.store.mutate(job_id, |j| {
        if !j.is_finished() {
            if j.cancel_reason.is_none() {
                j.cancel_reason = Some("cancelled by user".to_string());
            }
            j.queue_position = None;
            j.set_status(JobStatus::Cancelled);
        }
    })?;
    Ok(())
}

struct SupervisedExit {
    status: ExitStatus,
    timed_out: bool,
    cancelled: bool,
}

/// Stream assistant output into the record and enforce cancel/timeout.
///
/// Output is mirrored line-by-line to `output.log` in the job directory
/// and flushed into the persisted record every [`FLUSH_EVERY_LINES`] lines.
async fn supervise_assistant(
    inner: &Arc<SchedulerInner>,
    job_id: JobId,
    session: &mut ProcessHandle,
    cancel: &Arc<CancelFlag>,
    timeout: Duration,
) -> Result<SupervisedExit> {
    let mut rx = session
        .take_output()
        .context("assistant output stream already taken")?;

    let log_path = inner.store.job_dir(job_id).join("output.log");
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .ok();

    let mut pending = String::new();
    let mut buffered_lines = 0usize;
    let mut timed_out = false;
    let mut cancelling = false;
    let mut final_status: Option<ExitStatus> = None;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if let Some(f) = log.as_mut() {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                    pending.push_str(&line);
                    pending.push('\n');
                    buffered_lines += 1;
                    if buffered_lines >= FLUSH_EVERY_LINES {
                        let chunk = std::mem::take(&mut pending);
                        buffered_lines = 0;
                        inner.store.mutate(job_id, |j| j.append_output(&chunk))?;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled(), if !cancelling && !timed_out => {
                cancelling = true;
                inner.store.mutate(job_id, |j| {
                    if j.status.may_transition_to(JobStatus::Cancelling) {
                        j.set_status(JobStatus::Cancelling);
                    }
                })?;
                match session.terminate(TERMINATE_GRACE).await {
                    Ok(status) => final_status = Some(status),
                    Err(e) => warn!(job_id = %job_id, "cancel termination failed: {:#}", e),
                }
            },
            _ = &mut deadline, if !timed_out && !cancelling => {
                timed_out = true;
                info!(job_id = %job_id, "job deadline exceeded, terminating assistant");
                match session.terminate(TERMINATE_GRACE).await {
                    Ok(status) => final_status = Some(status),
                    Err(e) => warn!(job_id = %job_id, "timeout termination failed: {:#}", e),
                }
            },
        }
    }

    let status = match final_status {
        Some(status) => status,
        None => session.wait().await?,
    };

    if !pending.is_empty() {
        inner.store.mutate(job_id, |j| j.append_output(&pending))?;
    }
    if let Some(f) = log.as_mut() {
        let _ = f.flush().await;
    }

    // Only a cancel the supervisor acted on counts; a request racing the
    // natural exit leaves the outcome to the exit status.
    Ok(SupervisedExit {
        status,
        timed_out,
        cancelled: cancelling,
    })
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}
