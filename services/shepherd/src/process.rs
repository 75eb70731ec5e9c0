//! Child-process supervision for agent subprocesses.
//!
//! Spawning pipes all three standard streams; the supervisor never reads the
//! output streams itself; callers tee them into the parent's logging.  Exit
//! is observed lazily: a crashed child is only noticed on the next liveness
//! query or an explicit termination.  There is no auto-restart.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("argv must not be empty")]
    EmptyArgv,
    #[error("child stdio was not captured")]
    MissingStdio,
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// How to launch a child process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    /// Working directory; inherited when unset.
    pub dir: Option<PathBuf>,
    /// Environment additions, applied on top of the inherited (or cleared)
    /// environment.
    pub env: HashMap<String, String>,
    /// Inherit nothing before applying `env`.
    pub clear_env: bool,
}

/// A freshly spawned child with its captured streams.
///
/// The streams are handed out exactly once, at spawn; the handle keeps only
/// the process itself (plus stdin, so the pipe stays open until removal).
pub struct Spawned {
    pub handle: ProcessHandle,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

struct Inner {
    child: Child,
    status: Option<ExitStatus>,
    stdin: Option<ChildStdin>,
}

/// Owning handle to a live child process.
pub struct ProcessHandle {
    inner: Mutex<Inner>,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Launch the child described by `spec`.
    ///
    /// Spawn failure surfaces to the caller; nothing is tracked for a child
    /// that never started.
    pub fn spawn(spec: &SpawnSpec) -> Result<Spawned, ProcessError> {
        let (program, args) = spec.argv.split_first().ok_or(ProcessError::EmptyArgv)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(ProcessError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingStdio)?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingStdio)?;
        let pid = child.id();
        debug!(program = %program, pid, "child spawned");

        Ok(Spawned {
            handle: ProcessHandle {
                inner: Mutex::new(Inner {
                    child,
                    status: None,
                    stdin: Some(stdin),
                }),
                pid,
            },
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the child's stdin pipe, if nobody has yet.
    pub async fn take_stdin(&self) -> Option<ChildStdin> {
        self.inner.lock().await.stdin.take()
    }

    /// Whether the child is still running.  Exit is detected here, lazily.
    pub async fn alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.status.is_some() {
            return false;
        }
        match inner.child.try_wait() {
            Ok(Some(status)) => {
                inner.status = Some(status);
                false
            }
            Ok(None) => true,
            Err(error) => {
                warn!(pid = self.pid, %error, "liveness check failed; treating child as gone");
                false
            }
        }
    }

    /// Block up to `timeout` for exit.  Returns whether the child has exited.
    /// Safe to call repeatedly.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.status.is_some() {
            return true;
        }
        match tokio::time::timeout(timeout, inner.child.wait()).await {
            Ok(Ok(status)) => {
                inner.status = Some(status);
                true
            }
            Ok(Err(error)) => {
                warn!(pid = self.pid, %error, "wait on child failed");
                false
            }
            Err(_elapsed) => false,
        }
    }

    /// Bounded-time termination: wait up to `timeout` for a clean exit, then
    /// force-kill and reap.  Returns whether the exit was clean (before the
    /// kill).  Safe to call repeatedly.
    pub async fn terminate(&self, timeout: Duration) -> bool {
        if self.wait_timeout(timeout).await {
            return true;
        }
        let mut inner = self.inner.lock().await;
        if inner.status.is_none() {
            warn!(pid = self.pid, "child did not exit in time; force-killing");
            if let Err(error) = inner.child.start_kill() {
                debug!(pid = self.pid, %error, "kill failed; child already gone");
            }
            match inner.child.wait().await {
                Ok(status) => inner.status = Some(status),
                Err(error) => warn!(pid = self.pid, %error, "reaping killed child failed"),
            }
        }
        false
    }

    /// The exit status, if the child's exit has been observed.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().await.status
    }
}
