//! Interactive session driver.
//!
//! Forwards local input lines to the remote shell and writes every line the
//! shell produces to local output.

use std::io;

use remsh_proto::v1::Message;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, RemoteConnection, ShellStream};

/// Line counts of a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub sent: usize,
    pub received: usize,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Remote session failed: {}: {}", .0.code(), .0.message())]
    Remote(Box<Status>),

    #[error("Failed to read input: {0}")]
    Input(#[source] io::Error),

    #[error("Failed to write output: {0}")]
    Output(#[source] io::Error),
}

impl SessionError {
    /// The status the server ended the session with, if that is the failure.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Remote(status) => Some(status.code()),
            _ => None,
        }
    }
}

/// Run one shell session over `conn`.
///
/// Input ending half-closes the call; output keeps flowing until the server
/// ends the stream. When the server ends it first, input is no longer read.
pub async fn run<R, W>(
    conn: &mut RemoteConnection,
    input: R,
    output: W,
) -> Result<SessionReport, SessionError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let stream = conn.shell_session().await?;
    drive(stream, input, output).await
}

/// Drive an already open call to completion.
pub async fn drive<R, W>(
    stream: ShellStream,
    input: R,
    mut output: W,
) -> Result<SessionReport, SessionError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let ShellStream {
        outbound,
        mut inbound,
    } = stream;

    let stop_input = CancellationToken::new();
    let mut reader = tokio::spawn(forward_input(input, outbound, stop_input.clone()));
    let mut reader_done = false;
    let mut report = SessionReport::default();

    let outcome = loop {
        tokio::select! {
            message = inbound.message() => match message {
                Ok(Some(message)) => {
                    report.received += 1;
                    if let Err(e) = write_line(&mut output, &message.text).await {
                        break Err(SessionError::Output(e));
                    }
                }
                Ok(None) => {
                    info!("Remote session ended");
                    break Ok(());
                }
                Err(status) => break Err(SessionError::Remote(Box::new(status))),
            },
            joined = &mut reader, if !reader_done => {
                reader_done = true;
                match joined {
                    Ok(Ok(sent)) => {
                        report.sent = sent;
                        debug!(sent, "Input ended, send direction closed");
                    }
                    Ok(Err(e)) => break Err(SessionError::Input(e)),
                    Err(e) => break Err(SessionError::Input(io::Error::other(e))),
                }
            }
        }
    };

    if !reader_done {
        stop_input.cancel();
        match reader.await {
            Ok(Ok(sent)) => report.sent = sent,
            Ok(Err(e)) => debug!(error = %e, "Input reader stopped with error"),
            Err(e) => warn!(error = %e, "Input reader task failed"),
        }
    }

    outcome.map(|()| report)
}

/// Send every input line, terminator stripped, until end of input or `stop`.
///
/// Bytes that are not UTF-8 become U+FFFD rather than ending the session.
///
/// Returns the number of lines sent. The sender is dropped on return, which
/// half-closes the call.
async fn forward_input<R>(
    mut input: R,
    outbound: mpsc::Sender<Message>,
    stop: CancellationToken,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut sent = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(sent),
            read = input.read_until(b'\n', &mut buf) => read?,
        };
        if read == 0 {
            return Ok(sent);
        }

        let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = String::from_utf8_lossy(line);
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(sent),
            delivered = outbound.send(Message::line(line)) => {
                if delivered.is_err() {
                    debug!("Send direction closed by the call");
                    return Ok(sent);
                }
            }
        }
        sent += 1;
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
