//! Local command execution.
//!
//! Commands are registered explicitly by name with a fixed-shape handler
//! ([`CommandHandler`]); names that are not registered fall back to an external
//! program. The [`pipeline`] module chains several invocations through
//! in-memory pipes.

pub mod pipeline;
pub mod registry;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use pipeline::Pipeline;
pub use registry::CommandRegistry;

/// Boxed readable endpoint of a stage.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writable endpoint of a stage.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Future returned by a [`CommandHandler`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send + 'a>>;

/// Errors from local command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),

    #[error("unable to start {name} due to dependency error: {source}")]
    Dependency {
        name: String,
        #[source]
        source: Box<CommandError>,
    },

    #[error("command {command:?} at index {index} failed: {source}")]
    Stage {
        index: usize,
        command: Vec<String>,
        #[source]
        source: Box<CommandError>,
    },

    #[error("cancelled")]
    Cancelled,
}

/// A command name plus its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Name followed by arguments, as one argv vector.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// The three byte streams a command reads from and writes to.
pub struct StageIo {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

impl StageIo {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Empty input, discarded output.
    pub fn null() -> Self {
        Self::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink())
    }
}

impl std::fmt::Debug for StageIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageIo").finish_non_exhaustive()
    }
}

/// A locally registered command.
///
/// Handlers receive the stage's I/O and the positional arguments; they must
/// not close `io.stdout`, the caller does that once the handler returns.
pub trait CommandHandler: Send + Sync {
    fn call<'a>(&'a self, io: &'a mut StageIo, args: &'a [String]) -> HandlerFuture<'a>;
}
