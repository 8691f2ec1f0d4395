//! `Remote` gRPC service implementation.

use std::pin::Pin;
use std::sync::Arc;

use remsh_proto::v1::Message;
use remsh_proto::v1::remote_server::Remote;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{Instrument, debug, info, instrument, warn};

use crate::session::{SessionSettings, ShellSession};

/// Buffered outbound messages per session.
const OUTBOUND_CAPACITY: usize = 128;

/// `Remote` implementation: one shell per `ShellSession` stream.
#[derive(Debug, Clone)]
pub struct RemoteServiceImpl {
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
}

impl RemoteServiceImpl {
    /// Sessions are cancelled when `shutdown` fires.
    pub const fn new(settings: Arc<SessionSettings>, shutdown: CancellationToken) -> Self {
        Self { settings, shutdown }
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, Status>> + Send>>;

#[tonic::async_trait]
impl Remote for RemoteServiceImpl {
    type ShellSessionStream = MessageStream;

    #[instrument(skip(self, request), fields(rpc = "ShellSession"))]
    async fn shell_session(
        &self,
        request: Request<Streaming<Message>>,
    ) -> Result<Response<Self::ShellSessionStream>, Status> {
        let peer = request.remote_addr();
        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<Message, Status>>(OUTBOUND_CAPACITY);

        let session = ShellSession::new(Arc::clone(&self.settings), &self.shutdown);
        info!(session_id = %session.id(), ?peer, "Shell session requested");

        let status_tx = tx.clone();
        let grace = self.settings.exit_grace;
        tokio::spawn(
            async move {
                // A failed session ends the response stream with its status.
                if let Err(e) = session.run(in_stream, tx).await {
                    let status = Status::from(e);
                    match tokio::time::timeout(grace, status_tx.send(Err(status))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => debug!("Peer left before the session status was sent"),
                        Err(_) => warn!("Peer stopped reading, session status dropped"),
                    }
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
