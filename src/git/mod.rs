//! Git operations on registered repositories
//!
//! Plain `git` CLI invocations with argument vectors; the engine never
//! interprets anything through a shell. Inputs reaching these functions
//! have already passed the validators.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Clone `url` into `dest` (network fetch)
pub async fn clone(url: &str, dest: &Path) -> Result<()> {
    debug!(url, dest = %dest.display(), "cloning repository");
    let output = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest)
        .output()
        .await
        .context("Failed to run git clone")?;

    if !output.status.success() {
        bail!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Fetch the default remote and fast-forward the current branch.
///
/// Fast-forward only: a diverged branch fails rather than producing a
/// merge commit in the source repository.
pub async fn fetch_fast_forward(repo: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["pull", "--ff-only", "--prune"])
        .current_dir(repo)
        .output()
        .await
        .context("Failed to run git pull")?;
    if !output.status.success() {
        bail!(
            "git pull --ff-only failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Check whether a directory is a git repository
pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Current branch name, used for diagnostics in repo listings
pub async fn current_branch(repo: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo)
        .output()
        .await
        .context("Failed to run git rev-parse")?;

    if !output.status.success() {
        bail!(
            "git rev-parse failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
