//! Subprocess supervision: impersonated launch, output streaming,
//! graceful/forceful termination, and PID liveness probing.

pub mod registry;

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::UserIdentity;

/// Bounded window granted after a forceful kill before the supervisor
/// reports a fatal error.
const REAP_WINDOW: Duration = Duration::from_secs(10);

/// Launch failure, distinct from a non-zero exit of a launched process
#[derive(Debug, Error)]
#[error("failed to launch {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Signals the supervisor delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination request
    Term,
    /// Forceful kill
    Kill,
}

/// Description of a subprocess to launch.
///
/// Arguments are passed as a vector; nothing is ever interpreted by a shell.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// When set (on POSIX hosts), the child executes as this OS user
    pub run_as: Option<UserIdentity>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            run_as: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn run_as(mut self, user: Option<UserIdentity>) -> Self {
        self.run_as = user;
        self
    }
}

/// Handle to a supervised subprocess
pub struct ProcessHandle {
    pub pid: u32,
    child: Child,
    output: Option<mpsc::Receiver<String>>,
}

impl ProcessHandle {
    /// Take the merged stdout+stderr line receiver (once)
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.with_context(|| "wait failed")
    }

    /// Graceful termination with escalation.
    ///
    /// Sends SIGTERM, waits up to `grace`, escalates to SIGKILL, then waits
    /// a bounded reap window. A process that survives SIGKILL is a
    /// supervisor-fatal error.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        send_signal(self.pid, Signal::Term);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => return status.with_context(|| "wait after SIGTERM failed"),
            Err(_) => {
                debug!(pid = self.pid, "grace period expired, escalating to SIGKILL");
            }
        }

        send_signal(self.pid, Signal::Kill);
        match tokio::time::timeout(REAP_WINDOW, self.child.wait()).await {
            Ok(status) => status.with_context(|| "wait after SIGKILL failed"),
            Err(_) => {
                warn!(pid = self.pid, "process survived SIGKILL");
                bail!("process {} did not exit after SIGKILL", self.pid)
            }
        }
    }
}

/// Launch a subprocess with merged stdout+stderr streaming.
///
/// Every successful spawn must be matched by exactly one `wait` or
/// `terminate`; `kill_on_drop` backstops that invariant if a worker panics.
pub fn spawn(spec: ProcessSpec) -> Result<ProcessHandle, SpawnError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    if let Some(user) = &spec.run_as {
        // setgid before setuid happens inside the std pre-exec machinery.
        cmd.uid(user.uid).gid(user.gid);
        cmd.env("HOME", &user.home);
        cmd.env("USER", &user.username);
        cmd.env("LOGNAME", &user.username);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: spec.program.clone(),
        source,
    })?;

    let pid = child.id().unwrap_or(0);

    let (tx, rx) = mpsc::channel::<String>(256);

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }

    debug!(pid, program = %spec.program, "spawned subprocess");
    Ok(ProcessHandle {
        pid,
        child,
        output: Some(rx),
    })
}

/// Deliver a signal to a PID. Returns whether delivery succeeded.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        rc == 0
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        false
    }
}

/// OS-level liveness probe, used by crash recovery
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to another user.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Poll-based wait on a PID we did not spawn (crash-recovery reattach)
pub async fn wait_pid(pid: u32, poll: Duration) {
    loop {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}
