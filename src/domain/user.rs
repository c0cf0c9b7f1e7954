//! User identity as supplied by the external auth subsystem

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity of the submitting OS user.
///
/// The auth layer resolves the token to this record on every create/start
/// call; the engine never performs its own user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Login name, used for job ownership and listing
    pub username: String,

    /// Numeric user id the assistant process runs under
    pub uid: u32,

    /// Numeric group id the assistant process runs under
    pub gid: u32,

    /// Home directory, used for assistant session discovery
    pub home: PathBuf,
}

impl UserIdentity {
    /// Identity of the process we are running as.
    ///
    /// Used by the CLI and by tests; the server normally receives
    /// identities from the auth layer instead.
    #[cfg(unix)]
    pub fn current() -> Self {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let username = std::env::var("USER").unwrap_or_else(|_| format!("uid-{}", uid));
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self {
            username,
            uid,
            gid,
            home,
        }
    }
}
