//! Local pipeline composer.
//!
//! Runs a list of invocations concurrently, each stage's stdout wired into the
//! next stage's stdin through an in-memory pipe. The first stage reads the
//! caller's stdin, the last one writes the caller's stdout, and every stage
//! shares the caller's stderr.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxReader, BoxWriter, CommandError, CommandRegistry, Invocation, StageIo};

/// Default buffer size of the pipes between stages.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Chains invocations through in-memory pipes.
#[derive(Debug, Clone)]
pub struct Pipeline {
    registry: Arc<CommandRegistry>,
    pipe_capacity: usize,
}

impl Pipeline {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            registry,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    #[must_use]
    pub const fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Run `stages` to completion.
    ///
    /// Every intermediate pipe's write end is shut down as soon as the stage
    /// producing into it returns, whether it succeeded or not, so the consumer
    /// always reaches end of input. Returns the error of the lowest-indexed
    /// failing stage, or [`CommandError::Cancelled`] when `cancel` fires first;
    /// in that case all stages are aborted.
    pub async fn run(
        &self,
        stages: &[Invocation],
        io: StageIo,
        cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        if stages.is_empty() {
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        let StageIo {
            stdin,
            stdout,
            stderr,
        } = io;
        let stderr = SharedWriter::new(stderr);
        let (producers, consumer) = stages.split_at(stages.len() - 1);

        let mut tasks = JoinSet::new();
        let mut indices = HashMap::new();
        let mut next_stdin: BoxReader = stdin;

        for (index, invocation) in producers.iter().enumerate() {
            let (writer, reader) = tokio::io::duplex(self.pipe_capacity);
            let stage_io = StageIo {
                stdin: std::mem::replace(&mut next_stdin, Box::new(reader)),
                stdout: Box::new(writer),
                stderr: Box::new(stderr.clone()),
            };
            let handle = tasks.spawn(run_stage(
                self.registry.clone(),
                invocation.clone(),
                stage_io,
                true,
            ));
            indices.insert(handle.id(), index);
        }

        let stage_io = StageIo {
            stdin: next_stdin,
            stdout,
            stderr: Box::new(stderr),
        };
        let handle = tasks.spawn(run_stage(
            self.registry.clone(),
            consumer[0].clone(),
            stage_io,
            false,
        ));
        indices.insert(handle.id(), producers.len());

        let mut outcomes: Vec<Option<CommandError>> = stages.iter().map(|_| None).collect();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(stages = stages.len(), "Pipeline cancelled, aborting stages");
                    tasks.abort_all();
                    return Err(CommandError::Cancelled);
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (index, result) = match joined {
                        Ok((id, result)) => (indices.get(&id).copied(), result),
                        Err(e) => (
                            indices.get(&e.id()).copied(),
                            Err(CommandError::Failed(format!("stage task failed: {e}"))),
                        ),
                    };
                    if let (Some(index), Err(e)) = (index, result) {
                        outcomes[index] = Some(e);
                    }
                }
            }
        }

        let mut failures = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.map(|e| (index, e)));
        let Some((index, source)) = failures.next() else {
            return Ok(());
        };
        for (later, e) in failures {
            warn!(index = later, error = %e, "Discarding later pipeline stage error");
        }
        Err(CommandError::Stage {
            index,
            command: stages[index].argv(),
            source: Box::new(source),
        })
    }
}

/// Run one stage, then close its output.
///
/// Intermediate outputs are shut down so the next stage observes end of input;
/// the caller's own stdout is only flushed.
async fn run_stage(
    registry: Arc<CommandRegistry>,
    invocation: Invocation,
    mut io: StageIo,
    close_stdout: bool,
) -> Result<(), CommandError> {
    let result = registry
        .invoke(&invocation.name, &invocation.args, &mut io)
        .await;
    let closed = if close_stdout {
        io.stdout.shutdown().await
    } else {
        io.stdout.flush().await
    };
    if let Err(e) = closed {
        debug!(command = %invocation.name, error = %e, "Failed to close stage output");
    }
    drop(io);
    result
}

/// A writer shared by every stage of a pipeline.
#[derive(Clone)]
struct SharedWriter {
    inner: Arc<Mutex<BoxWriter>>,
}

impl SharedWriter {
    fn new(writer: BoxWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    fn poll_with<T>(
        &self,
        f: impl FnOnce(Pin<&mut BoxWriter>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match self.inner.lock() {
            Ok(mut guard) => f(Pin::new(&mut *guard)),
            Err(_) => Poll::Ready(Err(io::Error::other("shared writer poisoned"))),
        }
    }
}

impl AsyncWrite for SharedWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_with(|w| w.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_with(|w| w.poll_flush(cx))
    }

    // Stages never close the shared stream, only flush it.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_with(|w| w.poll_flush(cx))
    }
}
