//! `remsh` Server
//!
//! Serves the `Remote` gRPC service: every `ShellSession` stream gets its own
//! shell in a private working directory.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use remsh_core::config::{ServerSettings, load_config};
use remsh_core::tracing_init::{default_filter, init_tracing};
use remsh_server::server::{GrpcServer, ServerConfig};
use remsh_server::tls::TlsMode;

#[derive(Parser, Debug)]
#[command(name = "remsh-server")]
#[command(version, about = "remsh server - remote shell sessions over gRPC")]
struct Args {
    /// Configuration file (defaults to `$XDG_CONFIG_HOME/remsh/config.toml`)
    #[arg(long, env = "REMSH_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host (IP address)
    #[arg(long, env = "REMSH_HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long, env = "REMSH_PORT")]
    port: Option<u16>,

    /// Path to PEM-encoded TLS certificate
    #[arg(long, env = "REMSH_TLS_CERT", requires = "tls_key", conflicts_with = "dev_tls")]
    tls_cert: Option<PathBuf>,

    /// Path to PEM-encoded TLS private key
    #[arg(long, env = "REMSH_TLS_KEY", requires = "tls_cert", conflicts_with = "dev_tls")]
    tls_key: Option<PathBuf>,

    /// Generate a throwaway self-signed CA and server certificate
    #[arg(long, env = "REMSH_DEV_TLS")]
    dev_tls: bool,

    /// Where `--dev-tls` writes its certificates
    #[arg(long, env = "REMSH_DEV_CERT_DIR", default_value = "certs")]
    dev_cert_dir: PathBuf,

    /// Shell program started for each session
    #[arg(long, env = "REMSH_SHELL")]
    shell: Option<String>,

    /// Parent directory of the per-session working directories
    #[arg(long, env = "REMSH_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Seconds the shell may keep running after its input has ended
    #[arg(long, env = "REMSH_EXIT_GRACE_SECS")]
    exit_grace_secs: Option<u64>,

    /// Send SIGCONT to the shell's process group on every receive poll tick
    #[arg(long, env = "REMSH_RESUME_ON_IDLE")]
    resume_on_idle: bool,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "REMSH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "REMSH_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Apply flags and environment over the file settings.
    fn merge_into(&self, settings: &mut ServerSettings) {
        if let Some(host) = &self.host {
            settings.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(shell) = &self.shell {
            settings.shell.clone_from(shell);
        }
        if let Some(dir) = &self.sessions_dir {
            settings.sessions_dir = Some(dir.clone());
        }
        if let Some(secs) = self.exit_grace_secs {
            settings.exit_grace_secs = secs;
        }
        if let Some(level) = &self.log_level {
            settings.log_level.clone_from(level);
        }
        settings.resume_on_idle |= self.resume_on_idle;
        settings.log_json |= self.log_json;
    }

    fn tls_mode(&self) -> TlsMode {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => TlsMode::Custom {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            },
            _ if self.dev_tls => TlsMode::DevSelfSigned {
                cert_dir: self.dev_cert_dir.clone(),
            },
            _ => TlsMode::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_config(args.config.as_deref())?.server;
    args.merge_into(&mut settings);

    init_tracing(
        &default_filter("remsh_server", &settings.log_level),
        settings.log_json,
    );

    let config = ServerConfig::from_settings(&settings)?.with_tls(args.tls_mode());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr,
        shell = %settings.shell,
        exit_grace_secs = settings.exit_grace_secs,
        resume_on_idle = settings.resume_on_idle,
        "Starting remsh-server"
    );

    let shutdown = CancellationToken::new();
    let server = GrpcServer::new(config, shutdown.clone());
    let serve = tokio::spawn(server.serve_tcp());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so session shells cannot notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Cancels every live session, then lets the server drain.
    shutdown.cancel();
    serve.await??;

    info!("Server stopped");
    Ok(())
}
