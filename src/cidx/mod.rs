//! Semantic indexer CLI wrapper
//!
//! The indexer is an opaque external binary with `start`, `stop`,
//! `fix-config`, `index [--reconcile]`, and `watch` subcommands. One-shots
//! run through the process supervisor so they honor impersonation; `watch`
//! is long-lived and handed back to the caller as a spec to supervise.

use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

use crate::domain::UserIdentity;
use crate::process::{self, ProcessSpec};

/// Maximum lines of indexer output kept for error reporting
const ERROR_TAIL_LINES: usize = 20;

/// Handle on the external indexer binary
#[derive(Debug, Clone)]
pub struct Cidx {
    binary: String,
}

impl Cidx {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a one-shot indexer subcommand to completion
    async fn run(&self, args: &[&str], cwd: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        let spec = ProcessSpec::new(&self.binary)
            .args(args.iter().copied())
            .cwd(cwd)
            .run_as(run_as.cloned());

        let mut handle = process::spawn(spec)?;
        let mut rx = handle.take_output();

        let mut tail: Vec<String> = Vec::new();
        let drain = async {
            if let Some(rx) = rx.as_mut() {
                while let Some(line) = rx.recv().await {
                    if tail.len() >= ERROR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
        };

        let (status, ()) = tokio::join!(handle.wait(), drain);
        let status = status?;
        if !status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                status,
                tail.join(" | ")
            );
        }
        Ok(())
    }

    /// Start the indexer service in a directory
    pub async fn start(&self, dir: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        self.run(&["start"], dir, run_as).await
    }

    /// Stop the indexer service (best-effort teardown step)
    pub async fn stop(&self, dir: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        self.run(&["stop"], dir, run_as).await
    }

    /// Repair the indexer configuration after a directory move
    pub async fn fix_config(&self, dir: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        self.run(&["fix-config"], dir, run_as).await
    }

    /// Full index of a directory (registration bootstrap)
    pub async fn index(&self, dir: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        self.run(&["index"], dir, run_as).await
    }

    /// One-shot reconcile, the fallback when the watcher fails
    pub async fn reconcile(&self, dir: &Path, run_as: Option<&UserIdentity>) -> Result<()> {
        self.run(&["index", "--reconcile"], dir, run_as).await
    }

    /// Spec for the long-lived `watch` subprocess.
    ///
    /// The caller supervises it for the whole assistant run and terminates
    /// it during teardown.
    pub fn watch_spec(&self, dir: &Path, run_as: Option<&UserIdentity>) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .arg("watch")
            .cwd(dir)
            .run_as(run_as.cloned())
    }

    /// Check if the indexer binary is on PATH
    pub fn is_available(&self) -> bool {
        std::process::Command::new("which")
            .arg(&self.binary)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Graceful-stop helper used by teardown: bounded, errors logged only
    pub async fn stop_with_timeout(
        &self,
        dir: &Path,
        run_as: Option<&UserIdentity>,
        timeout: Duration,
    ) -> bool {
        match tokio::time::timeout(timeout, self.stop(dir, run_as)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(dir = %dir.display(), "cidx stop failed: {:#}", e);
                false
            }
            Err(_) => {
                tracing::warn!(dir = %dir.display(), "cidx stop timed out");
                false
            }
        }
    }
}
