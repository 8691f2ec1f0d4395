//! gRPC server for remsh.

mod config;
mod shell_svc;

pub use config::ServerConfig;
pub use shell_svc::RemoteServiceImpl;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use remsh_proto::v1::remote_server::RemoteServer;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use crate::tls::TlsConfigError;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// gRPC server handle.
#[derive(Debug)]
pub struct GrpcServer {
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl GrpcServer {
    /// Create a server that stops accepting, and cancels every live session,
    /// once `shutdown` fires.
    pub const fn new(config: ServerConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Get the server configuration.
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve_tcp(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr: SocketAddr = listener.local_addr()?;
        let remote = RemoteServiceImpl::new(
            Arc::clone(&self.config.session),
            self.shutdown.clone(),
        );

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<RemoteServer<RemoteServiceImpl>>()
            .await;

        let mut builder = Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(30)))
            .http2_keepalive_timeout(Some(Duration::from_secs(10)));
        if let Some(tls) = self.config.tls.to_server_tls_config()? {
            builder = builder.tls_config(tls)?;
        }

        info!(
            %addr,
            tls = self.config.tls.is_enabled(),
            shell = %self.config.session.shell.program,
            sessions_dir = %self.config.session.sessions_dir.display(),
            "Starting gRPC server on TCP"
        );

        builder
            .add_service(health_service)
            .add_service(RemoteServer::new(remote))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                self.shutdown.cancelled_owned(),
            )
            .await?;

        info!(%addr, "gRPC server stopped");
        Ok(())
    }
}
