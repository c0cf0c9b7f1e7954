//! Input hardening for names, paths, and URLs
//!
//! Everything that eventually reaches a subprocess argument vector passes
//! through here first. Rejection happens before any state change and before
//! any process is spawned.

use crate::error::{EngineError, EngineResult};

/// Maximum length of a repository or file name
pub const MAX_NAME_LEN: usize = 100;

/// Maximum length of a git URL
pub const MAX_URL_LEN: usize = 500;

/// Maximum length of a path accepted from a caller
pub const MAX_PATH_LEN: usize = 4096;

/// Characters that are never allowed in any validated input
const SHELL_META: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\'', '"', '\r', '\n', '\0',
];

fn contains_shell_meta(s: &str) -> bool {
    s.chars().any(|c| SHELL_META.contains(&c))
}

/// Validate a repository or uploaded-file name.
///
/// Names are single path components: `[A-Za-z0-9._-]`, no leading dash or
/// dot-dot, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(s: &str) -> EngineResult<()> {
    if s.is_empty() {
        return Err(EngineError::validation("name must not be empty"));
    }
    if s.len() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    if s.contains("..") {
        return Err(EngineError::validation("name must not contain '..'"));
    }
    if s.starts_with('-') || s.starts_with('.') {
        return Err(EngineError::validation(
            "name must not start with '-' or '.'",
        ));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(EngineError::validation(format!(
            "name contains invalid characters: {:?}",
            s
        )));
    }
    Ok(())
}

/// Validate a caller-supplied workspace-relative path (uploaded files may
/// target subdirectories of the workspace).
///
/// Rejects shell metacharacters, `..` segments, absolute paths, and
/// oversized input. Does not touch the filesystem.
pub fn validate_path(s: &str) -> EngineResult<()> {
    if s.is_empty() {
        return Err(EngineError::validation("path must not be empty"));
    }
    if s.len() > MAX_PATH_LEN {
        return Err(EngineError::validation(format!(
            "path exceeds {} characters",
            MAX_PATH_LEN
        )));
    }
    if contains_shell_meta(s) {
        return Err(EngineError::validation(format!(
            "path contains forbidden characters: {:?}",
            s
        )));
    }
    if s.contains("..") {
        return Err(EngineError::validation("path must not contain '..'"));
    }
    if std::path::Path::new(s).is_absolute() {
        return Err(EngineError::validation("path must be workspace-relative"));
    }
    Ok(())
}

/// Validate a git remote URL.
///
/// Accepts http(s), ssh and git schemes plus the scp-like
/// `user@host:path` form; rejects shell metacharacters, whitespace, `..`,
/// and oversized input.
pub fn validate_url(s: &str) -> EngineResult<()> {
    if s.is_empty() {
        return Err(EngineError::validation("url must not be empty"));
    }
    if s.len() > MAX_URL_LEN {
        return Err(EngineError::validation(format!(
            "url exceeds {} characters",
            MAX_URL_LEN
        )));
    }
    if contains_shell_meta(s) || s.chars().any(char::is_whitespace) {
        return Err(EngineError::validation(format!(
            "url contains forbidden characters: {:?}",
            s
        )));
    }
    if s.contains("..") {
        return Err(EngineError::validation("url must not contain '..'"));
    }
    let scheme_ok = s.starts_with("https://")
        || s.starts_with("http://")
        || s.starts_with("ssh://")
        || s.starts_with("git://")
        || s.starts_with("file://")
        || is_scp_like(s);
    if !scheme_ok {
        return Err(EngineError::validation(format!(
            "unsupported git url: {:?}",
            s
        )));
    }
    Ok(())
}

/// `user@host:path` without a scheme, e.g. `git@example.com:org/repo.git`
fn is_scp_like(s: &str) -> bool {
    match (s.find('@'), s.find(':')) {
        (Some(at), Some(colon)) => at > 0 && colon > at + 1,
        _ => false,
    }
}

/// Validate an environment-variable key from a job's env overrides
pub fn validate_env_key(s: &str) -> EngineResult<()> {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return Err(EngineError::validation("invalid environment key length"));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(EngineError::validation(format!(
            "environment key contains invalid characters: {:?}",
            s
        )));
    }
    Ok(())
}
