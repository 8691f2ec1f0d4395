//! Shutdown coordinator.
//!
//! Consumes the single terminal event of every session unit and decides when
//! the session is over and which error, if any, it reports.
//!
//! On cancellation the exit waiter kills the shell's process group before it
//! reaps the leader. The coordinator only signals the group after a natural
//! exit, and only while an output pipe is still open, which means some
//! member still holds it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pumps::PumpEvent;
use super::state::{PumpKind, PumpStates};
use super::SessionError;
use crate::subprocess::ProcessGroup;

pub(super) struct Coordinator {
    cancel: CancellationToken,
    group: ProcessGroup,
    exit_grace: Duration,
    states: PumpStates,
    group_killed: bool,
}

impl Coordinator {
    pub(super) fn new(cancel: CancellationToken, group: ProcessGroup, exit_grace: Duration) -> Self {
        Self {
            cancel,
            group,
            exit_grace,
            states: PumpStates::new(),
            group_killed: false,
        }
    }

    /// Drive the session to its terminal state.
    ///
    /// Terminal means both output pumps and the process have reported; the
    /// receive pump may still be running and is stopped by the scope, which is
    /// always cancelled on return. Every unit observes the scope, so once it
    /// fires the remaining events arrive in bounded time.
    pub(super) async fn run(
        mut self,
        events: &mut mpsc::Receiver<PumpEvent>,
    ) -> Result<(), SessionError> {
        let grace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(grace);
        let mut grace_armed = false;

        while !self.states.is_terminal() {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Session units ended without reporting");
                        break;
                    };
                    if self.on_event(event) && !grace_armed {
                        grace.as_mut().reset(Instant::now() + self.exit_grace);
                        grace_armed = true;
                    }
                }
                () = &mut grace, if grace_armed => {
                    grace_armed = false;
                    if !self.states.get(PumpKind::ProcessExit).is_done() {
                        warn!(
                            grace_secs = self.exit_grace.as_secs_f64(),
                            "Shell still running after input ended, terminating"
                        );
                        self.record(
                            PumpKind::ProcessExit,
                            SessionError::process(format!(
                                "shell did not exit within {:?} after input ended",
                                self.exit_grace
                            )),
                        );
                        self.cancel.cancel();
                    }
                }
            }
        }

        self.cancel.cancel();
        self.states.take_fatal().map_or(Ok(()), Err)
    }

    /// Apply one terminal event. Returns `true` when the exit grace timer
    /// should be armed.
    fn on_event(&mut self, event: PumpEvent) -> bool {
        let PumpEvent { kind, outcome } = event;
        if !self.states.complete(kind, outcome.is_err()) {
            warn!(pump = %kind, "Ignoring repeated completion");
            return false;
        }

        match kind {
            PumpKind::Receive => {
                match &outcome {
                    Ok(()) => info!("Peer closed input"),
                    Err(SessionError::Transport(status)) => {
                        error!(code = ?status.code(), message = status.message(), "Receive failed");
                    }
                    Err(SessionError::Cancelled) => debug!("Receive pump stopped by cancellation"),
                    Err(e) => warn!(error = %e, "Receive pump stopped"),
                }
                !self.states.get(PumpKind::ProcessExit).is_done()
            }
            PumpKind::Stdout | PumpKind::Stderr => {
                match outcome {
                    Ok(()) => debug!(pump = %kind, "Output drained"),
                    Err(e) => {
                        self.cancel.cancel();
                        self.record(kind, e);
                    }
                }
                false
            }
            PumpKind::ProcessExit => {
                self.cancel.cancel();
                let close_outputs = self.should_kill_group(&outcome);
                match outcome {
                    Ok(()) => debug!("Shell exited cleanly"),
                    Err(e) => self.record(kind, e),
                }
                if close_outputs {
                    self.force_close();
                }
                false
            }
        }
    }

    /// Whether the group must be killed after the process-exit event.
    ///
    /// A cancelled waiter already killed the group before reaping, and with
    /// both outputs drained no member can be holding a pipe.
    fn should_kill_group(&self, outcome: &Result<(), SessionError>) -> bool {
        let outputs_open = !(self.states.get(PumpKind::Stdout).is_done()
            && self.states.get(PumpKind::Stderr).is_done());
        !self.group_killed && outputs_open && !matches!(outcome, Err(SessionError::Cancelled))
    }

    fn record(&mut self, kind: PumpKind, error: SessionError) {
        match self.states.record_fatal(error) {
            Ok(()) => {
                if let Some(e) = self.states.fatal() {
                    debug!(pump = %kind, error = %e, "Recorded session error");
                }
            }
            Err(discarded) if discarded.is_cancelled() => {
                debug!(pump = %kind, "Cancellation after session error");
            }
            Err(discarded) => {
                warn!(pump = %kind, error = %discarded, "Discarding secondary session error");
            }
        }
    }

    /// Kill what is left of the shell's group (background jobs) so every
    /// holder of the output pipes' write ends is gone and the output pumps
    /// reach end of stream.
    fn force_close(&mut self) {
        self.group_killed = true;
        match self.group.kill() {
            Ok(()) => debug!(pgid = ?self.group.id(), "Shell process group killed"),
            Err(e) => warn!(pgid = ?self.group.id(), error = %e, "Failed to kill shell process group"),
        }
    }
}
