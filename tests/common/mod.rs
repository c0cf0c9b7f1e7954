//! Shared helpers for engine integration tests
//!
//! The assistant and indexer are replaced by shell-script stubs so the
//! whole engine can be exercised end-to-end in a tempdir without network
//! access or the real binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use claude_batch::config::ServerConfig;
use claude_batch::domain::{CloneStatus, Job, JobStatus, RepoRecord, UserIdentity};
use claude_batch::engine::{CreateOptions, CreateRequest, Engine};

/// Write an executable stub script and return its path
pub fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

/// Config pointed at a tempdir with short timeouts for tests
pub fn test_config(data_dir: &Path, assistant: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.max_concurrent = 2;
    config.default_timeout_seconds = 30;
    config.assistant.binary = assistant.to_string_lossy().into_owned();
    config.assistant.title_timeout_seconds = 5;
    config.cidx.watch_startup_timeout = 5;
    config.cidx.watch_termination_timeout = 2;
    config
}

/// Drop a completed repository directly into the repos directory
pub fn seed_repo(config: &ServerConfig, name: &str, cidx_aware: bool) {
    let dir = config.repos_dir().join(name);
    std::fs::create_dir_all(&dir).expect("mkdir repo");
    std::fs::write(dir.join("README.md"), "# seed\n").expect("write readme");

    let mut record = RepoRecord::new(
        name.to_string(),
        "https://example.com/seed.git".to_string(),
        "seeded for tests".to_string(),
        cidx_aware,
    );
    record.clone_status = CloneStatus::Completed;
    record.save(&dir).expect("save settings");
}

pub fn current_user() -> UserIdentity {
    UserIdentity::current()
}

pub fn create_request(repo: &str, prompt: &str, options: CreateOptions) -> CreateRequest {
    CreateRequest {
        user: current_user(),
        prompt: prompt.to_string(),
        repo: repo.to_string(),
        uploaded_files: Vec::new(),
        options,
    }
}

/// Poll until the job reaches the wanted status
pub async fn wait_status(
    engine: &Engine,
    id: claude_batch::domain::JobId,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = engine.get(id).expect("job exists");
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} while waiting for {}",
            id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until the job reaches any terminal status
pub async fn wait_terminal(
    engine: &Engine,
    id: claude_batch::domain::JobId,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = engine.get(id).expect("job exists");
        if job.is_finished() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never finished (status {})",
            id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
