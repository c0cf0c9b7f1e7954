//! Filesystem primitives: CoW clones, foreign-uid removal, ownership handover

pub mod validate;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

/// Clone `src` into `dst` so that writes in the clone never affect `src`.
///
/// Prefers a reflink copy (O(1) on btrfs/XFS/APFS); falls back to a deep
/// copy. Either way the content is staged next to `dst` and renamed into
/// place, so a crash mid-copy never leaves a half-populated `dst`.
pub async fn cow_clone(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("clone source is not a directory: {}", src.display());
    }
    if dst.exists() {
        bail!("clone destination already exists: {}", dst.display());
    }

    let parent = dst
        .parent()
        .with_context(|| format!("clone destination has no parent: {}", dst.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let staging = staging_path(dst);
    if staging.exists() {
        // Leftover from a previous crash; fresh staging dirs are per-pid.
        let _ = tokio::fs::remove_dir_all(&staging).await;
    }

    let reflink = Command::new("cp")
        .arg("-a")
        .arg("--reflink=always")
        .arg(src)
        .arg(&staging)
        .output()
        .await
        .with_context(|| "Failed to run cp")?;

    if !reflink.status.success() {
        debug!(
            src = %src.display(),
            "reflink unsupported ({}), deep-copying",
            String::from_utf8_lossy(&reflink.stderr).trim()
        );
        let _ = tokio::fs::remove_dir_all(&staging).await;

        let src = src.to_path_buf();
        let staging_clone = staging.clone();
        let copied = tokio::task::spawn_blocking(move || deep_copy_dir(&src, &staging_clone))
            .await
            .with_context(|| "deep copy task panicked")?;
        if let Err(e) = copied {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    }

    tokio::fs::rename(&staging, dst)
        .await
        .with_context(|| format!("Failed to move clone into {}", dst.display()))?;
    Ok(())
}

fn staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clone".to_string());
    dst.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// Recursive copy preserving permissions and symlinks
fn deep_copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create {}", dst.display()))?;
    let meta = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, meta.permissions())?;

    for entry in std::fs::read_dir(src)
        .with_context(|| format!("Failed to read {}", src.display()))?
    {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to link {}", target.display()))?;
        } else if file_type.is_dir() {
            deep_copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", target.display()))?;
        }
    }
    Ok(())
}

/// Remove a directory tree that may contain entries owned by another user.
///
/// Impersonated subprocesses leave files owned by the submitting user; when
/// a plain removal hits a permission error, ownership of the whole tree is
/// reclaimed for `uid` and the removal retried once.
pub fn rm_tree_as(path: &Path, uid: u32) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), "removal hit foreign ownership, reclaiming");
            reclaim_tree(path, uid)?;
            std::fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove {} after reclaim", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(unix)]
fn reclaim_tree(path: &Path, uid: u32) -> Result<()> {
    lchown(path, uid, uid)?;
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        for entry in std::fs::read_dir(path)? {
            reclaim_tree(&entry?.path(), uid)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn reclaim_tree(_path: &Path, _uid: u32) -> Result<()> {
    Ok(())
}

/// Recursively hand a directory tree over to `uid:gid`.
///
/// Used after workspace provisioning so that the impersonated assistant can
/// write into its CoW snapshot.
#[cfg(unix)]
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    lchown(path, uid, gid)?;
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
        {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn chown_tree(_path: &Path, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Path contains NUL: {}", path.display()))?;
    // lchown so symlink targets outside the tree are never touched.
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // EPERM just means we are not root; ownership stays as-is.
        if err.raw_os_error() == Some(libc::EPERM) {
            debug!(path = %path.display(), "chown skipped (not privileged)");
            return Ok(());
        }
        return Err(err).with_context(|| format!("Failed to chown {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn cow_clone_copies_content() {
        let tmp = TempDir::new().expect("tempdir");
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).expect("mkdir");
        std::fs::write(src.join("a.txt"), "hello").expect("write");
        std::fs::write(src.join("sub/b.txt"), "world").expect("write");

        let dst = tmp.path().join("dst");
        cow_clone(&src, &dst).await.expect("clone");

        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_to_string(dst.join("sub/b.txt")).unwrap(),
            "world"
        );
    }

    #[tokio::test]
    async fn clone_is_isolated_from_source() {
        let tmp = TempDir::new().expect("tempdir");
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::write(src.join("a.txt"), "original").expect("write");

        let dst = tmp.path().join("dst");
        cow_clone(&src, &dst).await.expect("clone");

        std::fs::write(dst.join("a.txt"), "modified").expect("write");
        assert_eq!(
            std::fs::read_to_string(src.join("a.txt")).unwrap(),
            "original"
        );
    }

    #[tokio::test]
    async fn clone_refuses_existing_destination() {
        let tmp = TempDir::new().expect("tempdir");
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::create_dir_all(&dst).expect("mkdir");

        assert!(cow_clone(&src, &dst).await.is_err());
    }

    #[test]
    fn rm_tree_handles_missing_path() {
        let tmp = TempDir::new().expect("tempdir");
        rm_tree_as(&tmp.path().join("nope"), 0).expect("noop");
    }

    #[test]
    fn rm_tree_removes_nested_dirs() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("tree");
        std::fs::create_dir_all(root.join("a/b/c")).expect("mkdir");
        std::fs::write(root.join("a/b/c/f.txt"), "x").expect("write");

        rm_tree_as(&root, 0).expect("remove");
        assert!(!root.exists());
    }
}
