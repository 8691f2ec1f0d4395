//! Shell process supervisor.
//!
//! Each session gets a fresh working directory under the sessions root and a
//! shell started there with all three standard streams piped.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tempfile::TempDir;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ProcessGroup;

/// Shell program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellConfig {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::new("bash", ["-e"])
    }
}

/// The shell's standard streams.
#[derive(Debug)]
pub struct ShellPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A running session shell.
#[derive(Debug)]
pub struct ShellProcess {
    child: Child,
    group: ProcessGroup,
    working_dir: TempDir,
}

impl ShellProcess {
    /// Create a working directory under `sessions_dir` and start the shell in it.
    pub fn start(
        config: &ShellConfig,
        sessions_dir: &Path,
    ) -> Result<(Self, ShellPipes), SubprocessError> {
        std::fs::create_dir_all(sessions_dir).map_err(SubprocessError::WorkingDir)?;
        let working_dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(sessions_dir)
            .map_err(SubprocessError::WorkingDir)?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(working_dir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            reason: format!("{}: {e}", config.program),
        })?;

        let pipes = ShellPipes {
            stdin: child.stdin.take().ok_or(SubprocessError::MissingPipe("stdin"))?,
            stdout: child
                .stdout
                .take()
                .ok_or(SubprocessError::MissingPipe("stdout"))?,
            stderr: child
                .stderr
                .take()
                .ok_or(SubprocessError::MissingPipe("stderr"))?,
        };
        let group = ProcessGroup::new(child.id());

        info!(
            shell = %config.program,
            pid = ?child.id(),
            working_dir = %working_dir.path().display(),
            "Shell started"
        );

        Ok((
            Self {
                child,
                group,
                working_dir,
            },
            pipes,
        ))
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir.path()
    }

    pub const fn group(&self) -> ProcessGroup {
        self.group
    }

    /// Split into the exit waiter and the working directory, which is
    /// removed when the returned `TempDir` is closed or dropped.
    pub fn into_parts(self) -> (ExitWaiter, TempDir) {
        let waiter = ExitWaiter {
            child: self.child,
            group: self.group,
        };
        (waiter, self.working_dir)
    }
}

/// Waits for the shell to exit.
#[derive(Debug)]
pub struct ExitWaiter {
    child: Child,
    group: ProcessGroup,
}

impl ExitWaiter {
    /// Block until the shell exits.
    ///
    /// If `cancel` fires first, the shell's whole process group is killed
    /// while the leader is still unreaped, then the leader is reaped and
    /// [`SubprocessError::Cancelled`] is returned. A non-zero exit is an error.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<(), SubprocessError> {
        let status = tokio::select! {
            biased;
            status = self.child.wait() => status.map_err(SubprocessError::Wait)?,
            () = cancel.cancelled() => {
                // The unreaped leader keeps the group id reserved.
                if let Err(e) = self.group.kill() {
                    warn!(pgid = ?self.group.id(), error = %e, "Failed to kill shell process group");
                }
                if let Err(e) = self.child.start_kill() {
                    debug!(error = %e, "Shell already exited before kill");
                }
                let status = self.child.wait().await.map_err(SubprocessError::Wait)?;
                debug!(%status, "Shell terminated after cancellation");
                return Err(SubprocessError::Cancelled);
            }
        };
        exit_result(status)
    }
}

fn exit_result(status: ExitStatus) -> Result<(), SubprocessError> {
    if status.success() {
        debug!(%status, "Shell exited");
        Ok(())
    } else {
        Err(SubprocessError::Exited {
            status: status.to_string(),
        })
    }
}

/// Errors from the shell subprocess.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to create session working directory: {0}")]
    WorkingDir(#[source] std::io::Error),

    #[error("Failed to spawn shell: {reason}")]
    SpawnFailed { reason: String },

    #[error("Shell {0} was not captured")]
    MissingPipe(&'static str),

    #[error("Failed to wait for shell: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Shell exited unsuccessfully: {status}")]
    Exited { status: String },

    /// The session scope fired first and the shell's group was killed.
    #[error("Shell terminated by cancellation")]
    Cancelled,
}
