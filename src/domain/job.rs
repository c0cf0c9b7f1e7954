//! Job record and state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use super::UserIdentity;

/// Unique identifier for a job (server-assigned, opaque)
pub type JobId = Uuid;

/// Maximum bytes of assistant output kept on the job record.
/// Older output is evicted from the front; the full stream is mirrored to
/// the job's output.log on disk.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// The status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record exists but has not been queued yet
    Created,
    /// Waiting in the FIFO queue for a worker slot
    Queued,
    /// Pre-run: pulling the source repository
    GitPulling,
    /// Pre-run: source pull failed in strict mode
    GitFailed,
    /// Pre-run: starting the semantic index for the workspace
    CidxIndexing,
    /// Pre-run finished; about to launch the assistant
    CidxReady,
    /// Assistant process is running
    Running,
    /// Assistant exited with code 0
    Completed,
    /// Non-zero exit or pipeline error
    Failed,
    /// Exceeded the per-job deadline
    Timeout,
    /// Killed externally
    Terminated,
    /// Cancel requested; waiting for owned subprocesses to exit
    Cancelling,
    /// Cancelled at the user's request
    Cancelled,
}

impl JobStatus {
    /// Get the status marker string used in persisted records and logs
    pub fn as_marker(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::GitPulling => "git_pulling",
            JobStatus::GitFailed => "git_failed",
            JobStatus::CidxIndexing => "cidx_indexing",
            JobStatus::CidxReady => "cidx_ready",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Terminated => "terminated",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::GitFailed
                | JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Timeout
                | JobStatus::Terminated
                | JobStatus::Cancelled
        )
    }

    /// Check if this is one of the pre-run pipeline sub-phases
    pub fn is_pre_run(&self) -> bool {
        matches!(
            self,
            JobStatus::GitPulling | JobStatus::CidxIndexing | JobStatus::CidxReady
        )
    }

    /// Legal transitions of the job state machine.
    ///
    /// Cancelling is reachable from any non-terminal state; everything else
    /// follows the pipeline order.
    pub fn may_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelling || next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, GitPulling)
                | (Queued, Failed)
                | (GitPulling, GitFailed)
                | (GitPulling, CidxIndexing)
                | (GitPulling, Failed)
                | (CidxIndexing, CidxReady)
                | (CidxIndexing, Failed)
                | (CidxReady, Running)
                | (CidxReady, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Terminated)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_marker())
    }
}

/// Result of the source-repository git pull phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitPhase {
    /// Phase not reached yet
    Pending,
    /// Pull in progress
    Pulling,
    /// Fetch + fast-forward succeeded
    Pulled,
    /// Pull failed (non-fatal unless strict mode)
    Failed,
    /// Repository is not a git repository or the option was off
    Skipped,
}

/// Progress of the semantic-index phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    /// Phase not reached yet
    Pending,
    /// Watcher process starting up
    Starting,
    /// Long-lived watcher is maintaining the index
    Watching,
    /// Watcher failed; one-shot reconcile running
    ReconcilingFallback,
    /// Reconcile succeeded after a watcher failure
    ReadyViaFallback,
    /// Index is ready (watch strategy disabled, reconcile succeeded)
    Ready,
    /// Index phase failed
    Failed,
    /// Job or repository is not index-aware
    Skipped,
}

/// Per-job execution options resolved at create time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Deadline in seconds measured from `started_at`
    pub timeout_seconds: u64,

    /// Remove the workspace as soon as the job reaches a terminal state
    #[serde(default)]
    pub auto_cleanup: bool,

    /// Run the source-pull phase of the pre-run pipeline
    #[serde(default)]
    pub git_aware: bool,

    /// Run the index phase of the pre-run pipeline
    #[serde(default)]
    pub cidx_aware: bool,

    /// Environment overrides applied to the assistant process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            auto_cleanup: false,
            git_aware: false,
            cidx_aware: false,
            env: HashMap::new(),
        }
    }
}

/// A job: one queued assistant run in an isolated workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// Submitting user's login name
    pub username: String,

    /// Full identity used for impersonated subprocesses
    pub user: UserIdentity,

    /// Original prompt text
    pub prompt: String,

    /// Short human-readable label derived from the prompt
    pub title: String,

    /// Name of the source repository
    pub repo_name: String,

    /// Workspace-relative paths of uploaded auxiliary files
    #[serde(default)]
    pub uploaded_files: Vec<String>,

    /// Current status
    pub status: JobStatus,

    /// Accumulated assistant output (bounded; see [`MAX_OUTPUT_BYTES`])
    #[serde(default)]
    pub output: String,

    /// Exit code once the job reaches a post-execution terminal state
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Private workspace directory owned by this job
    pub workspace_path: PathBuf,

    /// 1-indexed position among queued jobs (informational)
    #[serde(default)]
    pub queue_position: Option<usize>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// When the assistant process was spawned
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// When cancellation completed
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Reason recorded with a cancellation
    #[serde(default)]
    pub cancel_reason: Option<String>,

    /// Execution options resolved at create time
    pub options: JobOptions,

    /// Result of the source-repository pull phase
    #[serde(default = "GitPhase::pending")]
    pub source_pull_status: GitPhase,

    /// Git state of the workspace snapshot
    #[serde(default = "GitPhase::pending")]
    pub workspace_git_status: GitPhase,

    /// Progress of the index phase
    #[serde(default = "IndexPhase::pending")]
    pub index_status: IndexPhase,

    /// PID of the assistant process while the job is running
    #[serde(default)]
    pub assistant_pid: Option<u32>,
}

impl GitPhase {
    fn pending() -> Self {
        GitPhase::Pending
    }
}

impl IndexPhase {
    fn pending() -> Self {
        IndexPhase::Pending
    }
}

impl Job {
    /// Create a new job record in the `created` state
    pub fn new(
        id: JobId,
        user: UserIdentity,
        prompt: String,
        title: String,
        repo_name: String,
        workspace_path: PathBuf,
        options: JobOptions,
    ) -> Self {
        Self {
            id,
            username: user.username.clone(),
            user,
            prompt,
            title,
            repo_name,
            uploaded_files: Vec::new(),
            status: JobStatus::Created,
            output: String::new(),
            exit_code: None,
            workspace_path,
            queue_position: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            options,
            source_pull_status: GitPhase::Pending,
            workspace_git_status: GitPhase::Pending,
            index_status: IndexPhase::Pending,
            assistant_pid: None,
        }
    }

    /// Update the job status, tracking the timestamp side effects.
    ///
    /// `started_at` is stamped on the first transition to running;
    /// `completed_at` on any terminal transition; `cancelled_at` when the
    /// terminal state is cancelled. The assistant PID is cleared on every
    /// terminal transition.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;

        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }

        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.assistant_pid = None;
            if status == JobStatus::Cancelled {
                self.cancelled_at = Some(Utc::now());
            }
        }
    }

    /// Record an error message and mark the job failed
    pub fn fail(&mut self, message: impl AsRef<str>) {
        self.append_output(&format!("\n[server] {}\n", message.as_ref()));
        if self.exit_code.is_none() {
            // Pipeline and recovery failures have no process exit status.
            self.exit_code = Some(-1);
        }
        self.set_status(JobStatus::Failed);
    }

    /// Check if the job is in a terminal state
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append assistant output, evicting from the front past the cap
    pub fn append_output(&mut self, chunk: &str) {
        self.output.push_str(chunk);
        if self.output.len() > MAX_OUTPUT_BYTES {
            let excess = self.output.len() - MAX_OUTPUT_BYTES;
            // Cut on a char boundary at or after the excess point.
            let cut = (excess..=self.output.len())
                .find(|i| self.output.is_char_boundary(*i))
                .unwrap_or(0);
            self.output.drain(..cut);
        }
    }

    /// Duration from start to completion, if both are set
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> UserIdentity {
        UserIdentity {
            username: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/alice"),
        }
    }

    fn test_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            test_user(),
            "List top-level files.".to_string(),
            "List files".to_string(),
            "demo".to_string(),
            PathBuf::from("/tmp/jobs/x/workspace"),
            JobOptions::default(),
        )
    }

    #[test]
    fn set_status_stamps_timestamps() {
        let mut job = test_job();
        assert!(job.started_at.is_none());

        job.set_status(JobStatus::Queued);
        job.set_status(JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        job.set_status(JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.cancelled_at.is_none());
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }

    #[test]
    fn cancelled_sets_cancelled_at() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued);
        job.set_status(JobStatus::Cancelled);
        assert!(job.cancelled_at.is_some());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn terminal_transition_clears_pid() {
        let mut job = test_job();
        job.set_status(JobStatus::Running);
        job.assistant_pid = Some(4242);
        job.set_status(JobStatus::Completed);
        assert_eq!(job.assistant_pid, None);
    }

    #[test]
    fn forbidden_jumps_rejected() {
        assert!(!JobStatus::Queued.may_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.may_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.may_transition_to(JobStatus::GitPulling));
        assert!(JobStatus::Running.may_transition_to(JobStatus::Cancelling));
        assert!(JobStatus::Cancelling.may_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn output_cap_evicts_from_front() {
        let mut job = test_job();
        job.append_output(&"a".repeat(MAX_OUTPUT_BYTES));
        job.append_output("TAIL");
        assert!(job.output.len() <= MAX_OUTPUT_BYTES);
        assert!(job.output.ends_with("TAIL"));
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued);
        let json = serde_json::to_string(&job).expect("serialize");
        assert!(json.contains("\"status\":\"queued\""));
        let back: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.status, JobStatus::Queued);
        assert_eq!(back.id, job.id);
    }
}
