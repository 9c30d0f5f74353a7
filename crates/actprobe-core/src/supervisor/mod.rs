//! Target process supervision: launch with a controlled environment,
//! drain diagnostics, and guarantee teardown.
//!
//! ```text
//! start(spec) --> ProcessHandle { pid, stdin, stdout, stderr drain }
//!                     |
//!                     | take_transport() --> ChildTransport (stdin/stdout)
//!                     |
//! stop(handle, grace): close stdin -> SIGTERM -> wait(grace) -> SIGKILL -> reap
//! ```
//!
//! [`stop`] consumes the handle, so a process can only be stopped once.
//! The child is also spawned with `kill_on_drop`, which covers unwinding
//! paths that never reach `stop`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{ChildTransport, LineTransport};

/// Ambient variables copied into the child when present, unless overridden.
pub const DEFAULT_INHERIT_ENV: &[&str] = &["PATH", "HOME"];

/// Errors from launching, inspecting, or stopping the target process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn target '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("target process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("target process has no pid; it was already reaped")]
    NoPid,

    #[error("target process transport was already taken")]
    TransportTaken,

    #[error("target process exited unexpectedly ({0})")]
    Exited(ExitStatus),

    #[error("failed to query target process status: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to kill target process: {0}")]
    Kill(#[source] std::io::Error),
}

/// How to launch the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Variables set explicitly on the child.
    pub env: BTreeMap<String, String>,
    /// Names of ambient variables the child may inherit. Everything else in
    /// the harness's own environment is withheld.
    pub inherit_env: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            inherit_env: DEFAULT_INHERIT_ENV.iter().map(|s| (*s).to_string()).collect(),
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn inherit_env<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inherit_env = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The exact environment the child will see, given `ambient` as the
    /// harness's own environment.
    pub fn resolved_env<F>(&self, ambient: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = BTreeMap::new();
        for name in &self.inherit_env {
            if let Some(value) = ambient(name) {
                resolved.insert(name.clone(), value);
            }
        }
        for (key, value) in &self.env {
            resolved.insert(key.clone(), value.clone());
        }
        resolved
    }
}

/// Result of [`stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before stop was requested.
    AlreadyExited(ExitStatus),
    /// The process exited within the grace period.
    Exited(ExitStatus),
    /// The process was force-killed after the grace period.
    Killed,
}

/// A running target process and its three streams.
pub struct ProcessHandle {
    pid: u32,
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Hand the stdin/stdout pair to a [`ChildTransport`]. Only once.
    pub fn take_transport(&mut self) -> Result<ChildTransport, ProcessError> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok(LineTransport::new(stdin, stdout)),
            _ => Err(ProcessError::TransportTaken),
        }
    }

    /// `Some(status)` once the process has exited, without blocking.
    pub fn exit_status(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        self.child.try_wait().map_err(ProcessError::Wait)
    }

    /// Wait up to `limit` for the process to exit on its own.
    pub async fn wait_for_exit(
        &mut self,
        limit: Duration,
    ) -> Result<Option<ExitStatus>, ProcessError> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(status)),
            Ok(Err(e)) => Err(ProcessError::Wait(e)),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Launch the target with a fully specified environment and piped streams.
pub fn start(spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
    let env = spec.resolved_env(|name| std::env::var(name).ok());

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let pid = child_pid(&child)?;
    let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

    info!(
        pid,
        program = %spec.program,
        env_keys = ?env.keys().collect::<Vec<_>>(),
        "started target process"
    );

    Ok(ProcessHandle {
        pid,
        program: spec.program.clone(),
        child,
        stdin: Some(stdin),
        stdout: Some(stdout),
        stderr_drain: Some(drain_stderr(pid, stderr)),
    })
}

/// Forward the child's diagnostic stream to tracing so the pipe never fills.
fn drain_stderr(pid: u32, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        debug!(target: "actprobe::target", pid, "{line}");
                    }
                }
                Err(e) => {
                    warn!(pid, error = %e, "error reading target stderr");
                    break;
                }
            }
        }
    })
}

/// Fixed pause before the first request. Prefer the probe in
/// [`crate::readiness`], which does not race a slow-starting target.
pub async fn await_ready(delay: Duration) {
    if !delay.is_zero() {
        debug!(delay_ms = delay.as_millis() as u64, "waiting for target startup");
        tokio::time::sleep(delay).await;
    }
}

/// Stop the process: graceful first, forced after `grace`.
///
/// Closes stdin (many line servers exit on EOF), sends SIGTERM on Unix,
/// waits up to `grace`, then kills and reaps.
pub async fn stop(mut handle: ProcessHandle, grace: Duration) -> Result<StopOutcome, ProcessError> {
    let pid = handle.pid;
    drop(handle.stdin.take());
    drop(handle.stdout.take());

    let outcome = if let Some(status) = handle.exit_status()? {
        debug!(pid, %status, "target already exited");
        StopOutcome::AlreadyExited(status)
    } else {
        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, will force kill after grace period");
            }
        }

        match handle.wait_for_exit(grace).await? {
            Some(status) => {
                debug!(pid, %status, "target exited after termination request");
                StopOutcome::Exited(status)
            }
            None => {
                debug!(pid, "target did not exit within grace period, killing");
                handle.child.kill().await.map_err(ProcessError::Kill)?;
                StopOutcome::Killed
            }
        }
    };

    if let Some(drain) = handle.stderr_drain.take() {
        // The drain ends on EOF once the process is gone; don't wait on
        // grandchildren that may still hold the pipe.
        if tokio::time::timeout(Duration::from_millis(500), drain)
            .await
            .is_err()
        {
            debug!(pid, "stderr drain still open after stop");
        }
    }

    info!(pid, outcome = ?outcome, "stopped target process");
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// The OS pid of a child that has not been reaped yet.
fn child_pid(child: &Child) -> Result<u32, ProcessError> {
    child.id().ok_or(ProcessError::NoPid)
}
