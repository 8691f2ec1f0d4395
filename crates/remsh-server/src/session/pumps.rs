//! Line pumps between the duplex stream and the shell's pipes.
//!
//! Each pump returns exactly one outcome; the session turns it into a
//! [`PumpEvent`] for the coordinator.

use std::time::Duration;

use remsh_proto::v1::Message;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, trace, warn};

use super::{PumpKind, SessionError};
use crate::subprocess::ProcessGroup;

/// Sender half of the response stream.
pub type Outbound = mpsc::Sender<Result<Message, Status>>;

/// Written to the shell's stdin when input ends, however it ends.
pub const EXIT_DIRECTIVE: &[u8] = b"exit\n";

/// Terminal report of one session unit.
#[derive(Debug)]
pub struct PumpEvent {
    pub kind: PumpKind,
    pub outcome: Result<(), SessionError>,
}

/// Receive pump tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveSettings {
    /// Wake-up period while no message arrives.
    pub poll_interval: Duration,
    /// Send `SIGCONT` to the shell's group on every wake-up.
    pub resume_on_idle: bool,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            resume_on_idle: false,
        }
    }
}

/// Forward inbound messages to the shell's stdin, one line each.
///
/// A frame is one line: frames carrying a line break are logged and skipped.
///
/// Stops on peer end of stream (`Ok`), on a receive error, on a stdin write
/// failure, or when `cancel` fires. In every case the exit directive is
/// written last and stdin is closed when `stdin` is dropped on return.
pub async fn receive_pump<S, W>(
    mut inbound: S,
    mut stdin: W,
    group: ProcessGroup,
    settings: ReceiveSettings,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, Status>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Err(SessionError::Cancelled),
            next = inbound.next() => match next {
                Some(Ok(message)) if message.text.contains(['\n', '\r']) => {
                    warn!(len = message.text.len(), "Dropping input frame with an embedded line break");
                }
                Some(Ok(message)) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break Err(SessionError::Cancelled),
                        written = write_line(&mut stdin, message.text.as_bytes()) => {
                            if let Err(e) = written {
                                break Err(SessionError::Pipe(e));
                            }
                        }
                    }
                }
                Some(Err(status)) => break Err(SessionError::transport(status)),
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                trace!("Receive poll tick");
                if settings.resume_on_idle
                    && let Err(e) = group.resume()
                {
                    debug!(error = %e, "Failed to resume shell process group");
                }
            }
        }
    };

    close_input(&mut stdin, settings.poll_interval).await;
    outcome
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Best-effort exit directive, bounded by `limit`.
async fn close_input<W: AsyncWrite + Unpin>(stdin: &mut W, limit: Duration) {
    let finish = async {
        stdin.write_all(EXIT_DIRECTIVE).await?;
        stdin.flush().await?;
        stdin.shutdown().await
    };
    match tokio::time::timeout(limit, finish).await {
        Ok(Ok(())) => debug!("Exit directive written"),
        Ok(Err(e)) => debug!(error = %e, "Could not write exit directive"),
        Err(_) => debug!("Timed out writing exit directive"),
    }
}

/// Forward every line read from `reader` as an outbound message.
///
/// Ends with `Ok` at end of stream. A closed response stream is reported as a
/// transport error and stops only this pump. Once `cancel` has fired, each
/// send may wait at most `drain_grace` for the peer to make room; a peer that
/// stopped reading ends the pump with a transport error.
pub async fn output_pump<R>(
    reader: R,
    outbound: Outbound,
    cancel: CancellationToken,
    drain_grace: Duration,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let message = Message::line(decode_line(&buf));
        send_line(&outbound, message, &cancel, drain_grace).await?;
    }
}

async fn send_line(
    outbound: &Outbound,
    message: Message,
    cancel: &CancellationToken,
    drain_grace: Duration,
) -> Result<(), SessionError> {
    let send = outbound.send(Ok(message));
    tokio::pin!(send);
    let sent = tokio::select! {
        biased;
        sent = &mut send => sent,
        () = cancel.cancelled() => match tokio::time::timeout(drain_grace, &mut send).await {
            Ok(sent) => sent,
            Err(_) => {
                debug!(?drain_grace, "Peer stopped reading output after cancellation");
                return Err(SessionError::transport(Status::deadline_exceeded(
                    "peer stopped reading output",
                )));
            }
        },
    };
    sent.map_err(|_| SessionError::transport(Status::unavailable("response stream closed")))
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
