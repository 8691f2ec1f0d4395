//! Session error taxonomy.

use tonic::Status;

use crate::subprocess::SubprocessError;

/// Errors that can end a shell session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Send or receive failure on the duplex stream.
    #[error("Transport error: {0}")]
    Transport(Box<Status>),

    /// Shell could not be started, exited non-zero, or was killed.
    #[error("Process error: {reason}")]
    Process { reason: String },

    /// Local pipe I/O failure.
    #[error("Pipe error: {0}")]
    Pipe(#[from] std::io::Error),

    /// The session scope fired before the shell finished.
    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn transport(status: Status) -> Self {
        Self::Transport(Box::new(status))
    }

    pub fn process(reason: impl Into<String>) -> Self {
        Self::Process {
            reason: reason.into(),
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<SubprocessError> for SessionError {
    fn from(e: SubprocessError) -> Self {
        match e {
            SubprocessError::Cancelled => Self::Cancelled,
            other => Self::process(other.to_string()),
        }
    }
}

impl From<SessionError> for Status {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Transport(status) => *status,
            SessionError::Process { reason } => Self::aborted(reason),
            SessionError::Pipe(e) => Self::internal(e.to_string()),
            SessionError::Cancelled => Self::cancelled("session cancelled"),
        }
    }
}
