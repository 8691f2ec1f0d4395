//! Shell sessions.
//!
//! A session connects one duplex message stream to one shell subprocess.
//! Four independently scheduled units do the work:
//!
//! - the receive pump writes inbound lines to the shell's stdin,
//! - two output pumps turn stdout and stderr lines into outbound messages,
//! - the exit waiter reaps the shell.
//!
//! Each unit pushes exactly one [`PumpEvent`] into a queue owned by the
//! coordinator, which cancels the session scope, kills the shell's process
//! group when the scope fires, and reports at most one error.

mod coordinator;
mod error;
pub mod pumps;
mod state;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use remsh_proto::v1::Message;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::subprocess::{ShellConfig, ShellPipes, ShellProcess};
use coordinator::Coordinator;
pub use error::SessionError;
pub use pumps::{Outbound, PumpEvent, ReceiveSettings};
pub use state::{PumpKind, PumpState, PumpStates};

/// Settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: ShellConfig,
    /// Parent of the per-session working directories.
    pub sessions_dir: PathBuf,
    pub recv_poll_interval: Duration,
    /// How long the shell may keep running once input has ended, and how
    /// long a cancelled session waits on a peer that stopped reading.
    pub exit_grace: Duration,
    pub resume_on_idle: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            sessions_dir: PathBuf::from("sessions"),
            recv_poll_interval: Duration::from_millis(500),
            exit_grace: Duration::from_secs(5),
            resume_on_idle: false,
        }
    }
}

impl SessionSettings {
    const fn receive(&self) -> ReceiveSettings {
        ReceiveSettings {
            poll_interval: self.recv_poll_interval,
            resume_on_idle: self.resume_on_idle,
        }
    }
}

/// One remote shell interaction.
#[derive(Debug)]
pub struct ShellSession {
    id: Uuid,
    settings: Arc<SessionSettings>,
    cancel: CancellationToken,
}

impl ShellSession {
    /// Create a session whose scope is a child of `parent`; cancelling the
    /// parent cancels the session.
    pub fn new(settings: Arc<SessionSettings>, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            cancel: parent.child_token(),
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Token for the session scope. Cancelling it, any number of times,
    /// terminates the shell.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session until the shell has exited and both of its output
    /// streams are drained.
    ///
    /// The working directory is removed before returning. The error, if any,
    /// is the first fatal one: an output pump failure or the shell's own
    /// failure, in the order observed.
    pub async fn run<S>(self, inbound: S, outbound: Outbound) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Message, Status>> + Send + Unpin + 'static,
    {
        let span = info_span!("session", session_id = %self.id);
        self.run_inner(inbound, outbound).instrument(span).await
    }

    async fn run_inner<S>(self, inbound: S, outbound: Outbound) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Message, Status>> + Send + Unpin + 'static,
    {
        let (process, pipes) =
            ShellProcess::start(&self.settings.shell, &self.settings.sessions_dir)?;
        let group = process.group();
        info!(
            pgid = ?group.id(),
            working_dir = %process.working_dir().display(),
            "Session opened"
        );

        let (waiter, working_dir) = process.into_parts();
        let ShellPipes {
            stdin,
            stdout,
            stderr,
        } = pipes;

        let (events_tx, mut events) = mpsc::channel::<PumpEvent>(4);
        spawn_unit(
            PumpKind::Receive,
            &events_tx,
            pumps::receive_pump(
                inbound,
                stdin,
                group,
                self.settings.receive(),
                self.cancel.clone(),
            ),
        );
        spawn_unit(
            PumpKind::Stdout,
            &events_tx,
            pumps::output_pump(
                stdout,
                outbound.clone(),
                self.cancel.clone(),
                self.settings.exit_grace,
            ),
        );
        spawn_unit(
            PumpKind::Stderr,
            &events_tx,
            pumps::output_pump(
                stderr,
                outbound,
                self.cancel.clone(),
                self.settings.exit_grace,
            ),
        );
        let cancel = self.cancel.clone();
        spawn_unit(PumpKind::ProcessExit, &events_tx, async move {
            waiter.wait(&cancel).await.map_err(SessionError::from)
        });
        drop(events_tx);

        let result = Coordinator::new(self.cancel.clone(), group, self.settings.exit_grace)
            .run(&mut events)
            .await;

        let dir = working_dir.path().to_path_buf();
        if let Err(e) = working_dir.close() {
            warn!(working_dir = %dir.display(), error = %e, "Failed to remove session working directory");
        }
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => info!(error = %e, "Session closed with error"),
        }
        result
    }
}

/// Run a session unit on its own task; its outcome becomes its one event.
fn spawn_unit<F>(kind: PumpKind, events: &mpsc::Sender<PumpEvent>, unit: F)
where
    F: Future<Output = Result<(), SessionError>> + Send + 'static,
{
    let events = events.clone();
    tokio::spawn(
        async move {
            let outcome = unit.await;
            // The coordinator stops listening once the session is terminal.
            let _ = events.send(PumpEvent { kind, outcome }).await;
        }
        .in_current_span(),
    );
}
