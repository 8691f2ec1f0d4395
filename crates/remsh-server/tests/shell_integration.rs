//! End-to-end tests: a real server on a loopback port, driven by the generated
//! client.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use remsh_proto::v1::Message;
use remsh_proto::v1::remote_client::RemoteClient;
use remsh_server::server::{GrpcServer, ServerConfig};
use remsh_server::session::SessionSettings;
use remsh_server::tls::{TlsMode, generate_dev_bundle, write_dev_certs};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(sessions_dir: &Path, tls: TlsMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session = SessionSettings {
            sessions_dir: sessions_dir.to_path_buf(),
            recv_poll_interval: Duration::from_millis(50),
            exit_grace: Duration::from_millis(500),
            ..SessionSettings::default()
        };
        let config = ServerConfig::tcp(addr)
            .with_tls(tls)
            .with_session_settings(session);
        let shutdown = CancellationToken::new();
        let server = GrpcServer::new(config, shutdown.clone());
        let handle = tokio::spawn(async move {
            server.serve_with_listener(listener).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn client(&self) -> RemoteClient<Channel> {
        RemoteClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not drain")
            .unwrap();
    }
}

/// Send `input`, close the send direction, and collect the response stream.
async fn converse(
    client: &mut RemoteClient<Channel>,
    input: &[&str],
) -> (Vec<String>, Result<(), tonic::Status>) {
    let outbound: Vec<Message> = input.iter().map(|l| Message::line(*l)).collect();
    let response = client
        .shell_session(tokio_stream::iter(outbound))
        .await
        .unwrap();
    let mut inbound = response.into_inner();

    let mut lines = Vec::new();
    let mut status = Ok(());
    while let Some(item) = tokio::time::timeout(Duration::from_secs(10), inbound.next())
        .await
        .expect("response stream stalled")
    {
        match item {
            Ok(message) => lines.push(message.text),
            Err(s) => {
                status = Err(s);
                break;
            }
        }
    }
    (lines, status)
}

#[tokio::test]
async fn echo_over_grpc() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), TlsMode::Disabled).await;
    let mut client = server.client().await;

    let (lines, status) = converse(&mut client, &["echo hello"]).await;
    status.unwrap();
    assert_eq!(lines, vec!["hello"]);

    server.stop().await;
}

#[tokio::test]
async fn failing_shell_ends_stream_with_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), TlsMode::Disabled).await;
    let mut client = server.client().await;

    let (lines, status) = converse(&mut client, &["echo before", "false", "echo after"]).await;
    assert_eq!(lines, vec!["before"]);
    assert_eq!(status.unwrap_err().code(), Code::Aborted);

    server.stop().await;
}

#[tokio::test]
async fn sessions_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), TlsMode::Disabled).await;
    let mut first = server.client().await;
    let mut second = server.client().await;

    let (a, b) = tokio::join!(
        converse(&mut first, &["X=first", "echo $X; pwd"]),
        converse(&mut second, &["echo ${X:-unset}; pwd"]),
    );
    a.1.unwrap();
    b.1.unwrap();
    assert_eq!(a.0[0], "first");
    assert_eq!(b.0[0], "unset");
    assert_ne!(a.0[1], b.0[1], "sessions share a working directory");

    server.stop().await;
}

#[tokio::test]
async fn shutdown_cancels_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), TlsMode::Disabled).await;
    let mut client = server.client().await;

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tx.send(Message::line("sleep 30")).await.unwrap();
    let mut inbound = client
        .shell_session(tokio_stream::wrappers::ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    tokio::time::sleep(Duration::from_millis(200)).await;
    server.stop().await;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = inbound.next().await {}
    })
    .await;
    assert!(ended.is_ok(), "session outlived server shutdown");
    drop(tx);
}

#[tokio::test]
async fn tls_session_with_custom_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let certs = dir.path().join("certs");
    let bundle = generate_dev_bundle(&["localhost"]).unwrap();
    write_dev_certs(&certs, &bundle).unwrap();

    let tls = TlsMode::Custom {
        cert_path: certs.join("server.pem"),
        key_path: certs.join("server-key.pem"),
    };
    let server = TestServer::start(&dir.path().join("sessions"), tls).await;

    let tls_config = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&bundle.ca_cert_pem))
        .domain_name("localhost");
    let channel = Endpoint::from_shared(format!("https://{}", server.addr))
        .unwrap()
        .tls_config(tls_config)
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = RemoteClient::new(channel);

    let (lines, status) = converse(&mut client, &["echo secure"]).await;
    status.unwrap();
    assert_eq!(lines, vec!["secure"]);

    server.stop().await;
}
