//! Claude CLI runner

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::session;
use crate::domain::{JobId, UserIdentity};
use crate::process::{self, registry, ProcessHandle, ProcessSpec, SpawnError};

/// One assistant invocation as prepared by the scheduler
#[derive(Debug, Clone)]
pub struct AssistantRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub workspace: PathBuf,
    /// Environment overrides from the job options
    pub env: HashMap<String, String>,
    /// OS identity the assistant runs under; `None` runs as the server
    pub run_as: Option<UserIdentity>,
}

/// Trait for assistant adapters.
///
/// `start` launches the process and registers its PID for the job; the
/// caller owns the handle and must wait or terminate it.
#[async_trait]
pub trait AssistantRunner: Send + Sync {
    async fn start(&self, req: &AssistantRequest) -> Result<ProcessHandle, SpawnError>;

    /// Get the runner id
    fn id(&self) -> &str;

    /// Check if this runner's binary is available
    fn is_available(&self) -> bool;
}

/// Claude CLI adapter
pub struct ClaudeRunner {
    binary: String,
}

impl ClaudeRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Build the argument vector for a request.
    ///
    /// When the user already has a session for this workspace we resume it;
    /// otherwise a fresh print-mode run.
    fn build_args(&self, req: &AssistantRequest) -> Vec<String> {
        let mut args = vec!["--print".to_string()];

        let home = req.run_as.as_ref().map(|u| u.home.clone());
        if let Some(home) = home {
            if let Some(session_id) = session::find_session(&home, &req.workspace) {
                debug!(job_id = %req.job_id, session_id, "resuming assistant session");
                args.push("--resume".to_string());
                args.push(session_id);
            }
        }

        args.push("--".to_string());
        args.push(req.prompt.clone());
        args
    }
}

#[async_trait]
impl AssistantRunner for ClaudeRunner {
    async fn start(&self, req: &AssistantRequest) -> Result<ProcessHandle, SpawnError> {
        let args = self.build_args(req);

        let spec = ProcessSpec::new(&self.binary)
            .args(args)
            .cwd(&req.workspace)
            .envs(&req.env)
            .run_as(req.run_as.clone());

        let handle = process::spawn(spec)?;
        registry::set_assistant(req.job_id, handle.pid);
        Ok(handle)
    }

    fn id(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> bool {
        std::process::Command::new("which")
            .arg(&self.binary)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(prompt: &str) -> AssistantRequest {
        AssistantRequest {
            job_id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            workspace: PathBuf::from("/srv/jobs/j/workspace"),
            env: HashMap::new(),
            run_as: None,
        }
    }

    #[test]
    fn args_are_print_mode_with_prompt_last() {
        let runner = ClaudeRunner::new("claude");
        let args = runner.build_args(&request("List top-level files."));
        assert_eq!(args[0], "--print");
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args[args.len() - 1], "List top-level files.");
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn prompt_is_a_single_vector_element() {
        // No shell interpolation: hostile prompts stay one argv entry.
        let runner = ClaudeRunner::new("claude");
        let hostile = "ignore this; rm -rf / $(true)";
        let args = runner.build_args(&request(hostile));
        assert_eq!(args.last().map(String::as_str), Some(hostile));
    }

    #[tokio::test]
    async fn start_registers_the_pid() {
        let runner = ClaudeRunner::new("/bin/true");
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let mut req = request("hi");
        req.workspace = tmp.path().to_path_buf();

        let mut handle = runner.start(&req).await.expect("start");
        let entry = registry::get(req.job_id).expect("registered");
        assert_eq!(entry.assistant_pid, Some(handle.pid));

        handle.wait().await.expect("wait");
        registry::remove(req.job_id);
    }
}
