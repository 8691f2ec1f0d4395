//! Server configuration.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use remsh_core::config::ServerSettings;

use crate::session::SessionSettings;
use crate::subprocess::ShellConfig;
use crate::tls::TlsMode;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub addr: SocketAddr,

    /// Listener security.
    pub tls: TlsMode,

    /// Settings applied to every shell session.
    pub session: Arc<SessionSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            tls: TlsMode::Disabled,
            session: Arc::new(SessionSettings::default()),
        }
    }
}

impl ServerConfig {
    /// Create a new server config bound to `addr`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }

    /// Build from resolved `[server]` settings.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, super::ServerError> {
        let ip: IpAddr = settings.host.parse().map_err(|e| {
            super::ServerError::Config(format!("Invalid host {:?}: {e}", settings.host))
        })?;
        let sessions_dir = settings
            .resolved_sessions_dir()
            .map_err(|e| super::ServerError::Config(e.to_string()))?;

        let session = SessionSettings {
            shell: ShellConfig::new(settings.shell.clone(), settings.shell_args.clone()),
            sessions_dir,
            recv_poll_interval: std::time::Duration::from_millis(settings.recv_poll_interval_ms),
            exit_grace: std::time::Duration::from_secs(settings.exit_grace_secs),
            resume_on_idle: settings.resume_on_idle,
        };

        Ok(Self {
            addr: SocketAddr::new(ip, settings.port),
            tls: TlsMode::Disabled,
            session: Arc::new(session),
        })
    }

    /// Set listener security.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set session settings.
    #[must_use]
    pub fn with_session_settings(mut self, session: SessionSettings) -> Self {
        self.session = Arc::new(session);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), 10000);
        assert!(!config.tls.is_enabled());
    }

    #[test]
    fn from_settings_maps_every_field() {
        let settings = ServerSettings {
            host: "0.0.0.0".into(),
            port: 4000,
            shell: "sh".into(),
            shell_args: vec![],
            sessions_dir: Some(PathBuf::from("/var/lib/remsh")),
            recv_poll_interval_ms: 250,
            exit_grace_secs: 2,
            resume_on_idle: true,
            ..ServerSettings::default()
        };
        let config = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.addr, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(config.session.shell.program, "sh");
        assert!(config.session.shell.args.is_empty());
        assert_eq!(config.session.sessions_dir, PathBuf::from("/var/lib/remsh"));
        assert_eq!(config.session.recv_poll_interval.as_millis(), 250);
        assert_eq!(config.session.exit_grace.as_secs(), 2);
        assert!(config.session.resume_on_idle);
    }

    #[test]
    fn hostname_is_rejected() {
        let settings = ServerSettings {
            host: "not an address".into(),
            ..ServerSettings::default()
        };
        assert!(ServerConfig::from_settings(&settings).is_err());
    }
}
