//! Assistant session discovery
//!
//! The assistant keeps per-directory session data under
//! `~/.claude/projects/<encoded-cwd>/<session>.jsonl`. When a session
//! already exists for a workspace we resume it instead of starting fresh.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Encode an absolute working directory the way the assistant does:
/// `/`, `\` and `:` are replaced by `-`.
pub fn encode_workspace_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect()
}

/// Project storage directory for a workspace under a user's home
pub fn project_dir(home: &Path, workspace: &Path) -> PathBuf {
    home.join(".claude")
        .join("projects")
        .join(encode_workspace_path(workspace))
}

/// Find the most recent session id for a workspace, if any
pub fn find_session(home: &Path, workspace: &Path) -> Option<String> {
    let dir = project_dir(home, workspace);
    let pattern = format!("{}/*.jsonl", dir.display());

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in glob::glob(&pattern).ok()?.flatten() {
        let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }

    newest
        .and_then(|(_, path)| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
}
