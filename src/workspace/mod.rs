//! Workspace provisioner
//!
//! Turns a ready repository into a private per-job workspace: CoW snapshot
//! into `<jobs>/<id>/workspace`, uploaded files moved in, ownership handed
//! to the submitting user so impersonated writes succeed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::UserIdentity;
use crate::fsutil;

/// Subdirectory of the job dir where uploads wait for the snapshot
pub const STAGING_DIR: &str = "staging";

/// Subdirectory of the workspace where uploads are placed
pub const FILES_DIR: &str = "files";

/// An uploaded auxiliary file as received from the API layer
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Workspace-relative path (subdirectories allowed), already passed
    /// through the path validator
    pub name: String,
    pub contents: Vec<u8>,
}

/// Write uploaded files into the job's staging area.
///
/// Returns the workspace-relative paths the files will occupy after
/// provisioning. Paths must already be validated.
pub fn stage_uploads(job_dir: &Path, files: &[UploadedFile]) -> Result<Vec<String>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    let staging = job_dir.join(STAGING_DIR);

    let mut relative = Vec::with_capacity(files.len());
    for file in files {
        let dest = staging.join(&file.name);
        let parent = dest
            .parent()
            .with_context(|| format!("Upload path has no parent: {}", dest.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        std::fs::write(&dest, &file.contents)
            .with_context(|| format!("Failed to stage {}", dest.display()))?;
        relative.push(format!("{}/{}", FILES_DIR, file.name));
    }
    Ok(relative)
}

/// Provision the job workspace from a completed repository.
///
/// The snapshot is exclusively owned by this job from here on; the source
/// repository is never written.
pub async fn provision(
    repo_dir: &Path,
    job_dir: &Path,
    user: &UserIdentity,
) -> Result<PathBuf> {
    let workspace = job_dir.join("workspace");
    fsutil::cow_clone(repo_dir, &workspace).await?;

    let staging = job_dir.join(STAGING_DIR);
    if staging.is_dir() {
        let files_dir = workspace.join(FILES_DIR);
        tokio::fs::create_dir_all(&files_dir)
            .await
            .with_context(|| format!("Failed to create {}", files_dir.display()))?;
        let mut entries = tokio::fs::read_dir(&staging)
            .await
            .with_context(|| format!("Failed to read {}", staging.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let dest = files_dir.join(entry.file_name());
            tokio::fs::rename(entry.path(), &dest)
                .await
                .with_context(|| format!("Failed to place upload {}", dest.display()))?;
        }
        let _ = tokio::fs::remove_dir(&staging).await;
    }

    let ws = workspace.clone();
    let (uid, gid) = (user.uid, user.gid);
    tokio::task::spawn_blocking(move || fsutil::chown_tree(&ws, uid, gid))
        .await
        .context("chown task panicked")??;

    debug!(workspace = %workspace.display(), uid = user.uid, "workspace provisioned");
    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_user() -> UserIdentity {
        UserIdentity::current()
    }

    #[tokio::test]
    async fn provision_snapshots_repo_content() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).expect("mkdir");
        std::fs::write(repo.join("src/lib.rs"), "pub fn x() {}").expect("write");

        let job_dir = tmp.path().join("job");
        std::fs::create_dir_all(&job_dir).expect("mkdir");

        let ws = provision(&repo, &job_dir, &test_user()).await.expect("provision");
        assert_eq!(ws, job_dir.join("workspace"));
        assert!(ws.join("src/lib.rs").exists());

        // Writes in the workspace never reach the source.
        std::fs::write(ws.join("src/lib.rs"), "changed").expect("write");
        assert_eq!(
            std::fs::read_to_string(repo.join("src/lib.rs")).unwrap(),
            "pub fn x() {}"
        );
    }

    #[tokio::test]
    async fn staged_uploads_land_in_files_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");

        let job_dir = tmp.path().join("job");
        std::fs::create_dir_all(&job_dir).expect("mkdir");

        let rel = stage_uploads(
            &job_dir,
            &[
                UploadedFile {
                    name: "data.csv".to_string(),
                    contents: b"a,b\n1,2\n".to_vec(),
                },
                UploadedFile {
                    name: "fixtures/input.json".to_string(),
                    contents: b"{}".to_vec(),
                },
            ],
        )
        .expect("stage");
        assert_eq!(
            rel,
            vec![
                "files/data.csv".to_string(),
                "files/fixtures/input.json".to_string()
            ]
        );

        let ws = provision(&repo, &job_dir, &test_user()).await.expect("provision");
        assert_eq!(
            std::fs::read(ws.join("files/data.csv")).unwrap(),
            b"a,b\n1,2\n"
        );
        assert_eq!(std::fs::read(ws.join("files/fixtures/input.json")).unwrap(), b"{}");
        assert!(!job_dir.join(STAGING_DIR).exists());
    }
}
