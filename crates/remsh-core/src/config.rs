//! Configuration resolution for remsh.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. TOML file (`--config <path>`, else `$XDG_CONFIG_HOME/remsh/config.toml`)
//! 3. Environment variables (`REMSH_*`, read by the binaries' clap parsers)
//! 4. CLI arguments (highest priority)
//!
//! Layers 3 and 4 are applied by the binaries on top of what [`load_config`]
//! returns.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete remsh configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub client: ClientSettings,
}

/// Server-side configuration (`[server]` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Shell executable started for each session.
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Parent of the per-session working directories. `None` means
    /// `<cwd>/sessions`.
    pub sessions_dir: Option<PathBuf>,
    /// How often the receive pump wakes up to re-check the session scope.
    pub recv_poll_interval_ms: u64,
    /// How long the shell may keep running after its input has ended.
    pub exit_grace_secs: u64,
    /// Send `SIGCONT` to the shell on every receive-poll tick.
    pub resume_on_idle: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10000,
            shell: "bash".to_string(),
            shell_args: vec!["-e".to_string()],
            sessions_dir: None,
            recv_poll_interval_ms: 500,
            exit_grace_secs: 5,
            resume_on_idle: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ServerSettings {
    /// Directory under which session working directories are created.
    pub fn resolved_sessions_dir(&self) -> Result<PathBuf> {
        match &self.sessions_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?.join("sessions")),
        }
    }
}

/// Client-side configuration (`[client]` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    /// `host:port` of the server.
    pub server_addr: String,
    pub tls: bool,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_file: Option<PathBuf>,
    /// Name checked against the server certificate instead of the host in
    /// `server_addr`.
    pub server_host_override: Option<String>,
    /// Deadline for the whole session.
    pub timeout_secs: u64,
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_addr: "localhost:10000".to_string(),
            tls: false,
            ca_file: None,
            server_host_override: None,
            timeout_secs: 120,
            log_level: "warn".to_string(),
        }
    }
}

/// Load configuration from defaults and an optional TOML file.
///
/// An explicitly given path must exist. Without one, the global config file is
/// read when present and silently skipped otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config_file(path);
    }

    match global_config_path() {
        Some(path) if path.exists() => load_config_file(&path),
        _ => Ok(Config::default()),
    }
}

/// Get the global config file path (`<config dir>/remsh/config.toml`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("remsh").join("config.toml"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Parse a TOML document into a [`Config`], filling omitted keys with defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}
