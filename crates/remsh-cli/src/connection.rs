//! Server connection client.
//!
//! Manages the gRPC channel to a `remsh-server`, plaintext or TLS.

use std::path::PathBuf;
use std::time::Duration;

use remsh_core::config::ClientSettings;
use remsh_proto::v1::Message;
use remsh_proto::v1::remote_client::RemoteClient;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// Buffered outbound lines before the input reader is paused.
const OUTBOUND_CAPACITY: usize = 32;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address as `host:port` (a full URI is accepted too).
    pub server_addr: String,
    /// Connect with TLS.
    pub tls: bool,
    /// Extra CA certificate (PEM) trusted besides the system roots.
    pub ca_file: Option<PathBuf>,
    /// Server name checked during the TLS handshake, instead of the host.
    pub server_host_override: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_addr: "localhost:10000".to_string(),
            tls: false,
            ca_file: None,
            server_host_override: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ClientSettings> for ConnectionConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            server_addr: settings.server_addr.clone(),
            tls: settings.tls,
            ca_file: settings.ca_file.clone(),
            server_host_override: settings.server_host_override.clone(),
            ..Self::default()
        }
    }
}

impl ConnectionConfig {
    /// The endpoint URI; the scheme follows `tls` unless one is given.
    pub fn uri(&self) -> String {
        if self.server_addr.contains("://") {
            return self.server_addr.clone();
        }
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.server_addr)
    }

    fn tls_config(&self) -> Result<ClientTlsConfig, ConnectionError> {
        let mut tls_config = ClientTlsConfig::new().with_enabled_roots();
        if let Some(ca_path) = &self.ca_file {
            let ca_pem = std::fs::read_to_string(ca_path).map_err(|e| {
                ConnectionError::Tls(format!("Failed to read CA cert {}: {e}", ca_path.display()))
            })?;
            tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_pem));
        }
        if let Some(name) = &self.server_host_override {
            tls_config = tls_config.domain_name(name.clone());
        }
        Ok(tls_config)
    }
}

/// The two halves of an open `ShellSession` call.
pub struct ShellStream {
    /// Lines to send. Dropping it half-closes the call.
    pub outbound: mpsc::Sender<Message>,
    /// Lines from the remote shell, ended by the server's status.
    pub inbound: Streaming<Message>,
}

/// Client connection to the server.
pub struct RemoteConnection {
    config: ConnectionConfig,
    client: Option<RemoteClient<Channel>>,
}

impl RemoteConnection {
    /// Create a new connection (not yet connected).
    pub const fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Connect to the server.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let uri = self.config.uri();
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));

        if uri.starts_with("https://") {
            endpoint = endpoint
                .tls_config(self.config.tls_config()?)
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;
        self.client = Some(RemoteClient::new(channel));

        info!(addr = %uri, tls = self.config.tls, "Connected");
        Ok(())
    }

    /// Open a `ShellSession` call.
    pub async fn shell_session(&mut self) -> Result<ShellStream, ConnectionError> {
        let client = self.client.as_mut().ok_or(ConnectionError::NotConnected)?;

        let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let response = client
            .shell_session(ReceiverStream::new(outbound_rx))
            .await
            .map_err(|e| ConnectionError::RpcFailed(e.to_string()))?;
        debug!("Shell session opened");

        Ok(ShellStream {
            outbound,
            inbound: response.into_inner(),
        })
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected to server")]
    NotConnected,

    #[error("RPC call failed: {0}")]
    RpcFailed(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.uri(), "http://localhost:10000");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(!config.tls);
    }

    #[test]
    fn tls_selects_https() {
        let config = ConnectionConfig {
            server_addr: "example.com:443".into(),
            tls: true,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.uri(), "https://example.com:443");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let config = ConnectionConfig {
            server_addr: "http://10.0.0.1:9000".into(),
            tls: true,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.uri(), "http://10.0.0.1:9000");
    }

    #[test]
    fn from_client_settings() {
        let settings = ClientSettings {
            server_addr: "remote:2222".into(),
            tls: true,
            server_host_override: Some("shell.test".into()),
            ..ClientSettings::default()
        };
        let config = ConnectionConfig::from(&settings);
        assert_eq!(config.uri(), "https://remote:2222");
        assert_eq!(config.server_host_override.as_deref(), Some("shell.test"));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let mut conn = RemoteConnection::new(ConnectionConfig {
            server_addr: "not a host".into(),
            ..ConnectionConfig::default()
        });
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidAddress(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn missing_ca_file_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = RemoteConnection::new(ConnectionConfig {
            server_addr: "localhost:1".into(),
            tls: true,
            ca_file: Some(dir.path().join("missing.pem")),
            ..ConnectionConfig::default()
        });
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Tls(ref m) if m.contains("missing.pem")));
    }

    #[tokio::test]
    async fn session_requires_connection() {
        let mut conn = RemoteConnection::new(ConnectionConfig::default());
        assert!(matches!(
            conn.shell_session().await,
            Err(ConnectionError::NotConnected)
        ));
    }
}
