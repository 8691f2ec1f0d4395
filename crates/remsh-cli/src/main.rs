//! `remsh` Client
//!
//! Opens one remote shell session: stdin lines go to the shell, the shell's
//! output lines come back on stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::info;

use remsh_cli::connection::{ConnectionConfig, RemoteConnection};
use remsh_cli::session;
use remsh_core::config::{ClientSettings, load_config};
use remsh_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "remsh")]
#[command(version, about = "remsh - interactive remote shell over gRPC")]
struct Args {
    /// Configuration file (defaults to `$XDG_CONFIG_HOME/remsh/config.toml`)
    #[arg(long, env = "REMSH_CONFIG")]
    config: Option<PathBuf>,

    /// Server address as host:port
    #[arg(long, env = "REMSH_SERVER_ADDR")]
    server_addr: Option<String>,

    /// Connect with TLS
    #[arg(long, env = "REMSH_TLS")]
    tls: bool,

    /// CA certificate (PEM) to trust in addition to the system roots
    #[arg(long, env = "REMSH_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Server name verified during the TLS handshake
    #[arg(long, env = "REMSH_SERVER_HOST_OVERRIDE")]
    server_host_override: Option<String>,

    /// Deadline for the whole session, in seconds
    #[arg(long, env = "REMSH_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Log level filter (logs go to stderr)
    #[arg(long, env = "REMSH_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn merge_into(&self, settings: &mut ClientSettings) {
        if let Some(addr) = &self.server_addr {
            settings.server_addr.clone_from(addr);
        }
        if let Some(ca_file) = &self.ca_file {
            settings.ca_file = Some(ca_file.clone());
        }
        if let Some(name) = &self.server_host_override {
            settings.server_host_override = Some(name.clone());
        }
        if let Some(secs) = self.timeout_secs {
            settings.timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            settings.log_level.clone_from(level);
        }
        settings.tls |= self.tls;
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_config(args.config.as_deref())?.client;
    args.merge_into(&mut settings);
    init_tracing(&default_filter("remsh_cli", &settings.log_level), false);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(&settings));
    // A read blocked on the terminal must not hold the process open.
    runtime.shutdown_background();
    result
}

async fn run(settings: &ClientSettings) -> anyhow::Result<()> {
    let deadline = Duration::from_secs(settings.timeout_secs);
    let mut conn = RemoteConnection::new(ConnectionConfig::from(settings));

    let session = async {
        conn.connect().await?;
        let input = BufReader::new(tokio::io::stdin());
        let report = session::run(&mut conn, input, tokio::io::stdout()).await?;
        Ok::<_, anyhow::Error>(report)
    };

    let report = tokio::time::timeout(deadline, session)
        .await
        .with_context(|| format!("Session timed out after {}s", deadline.as_secs()))??;

    info!(sent = report.sent, received = report.received, "Session finished");
    Ok(())
}
