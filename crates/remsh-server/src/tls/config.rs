//! Listener security for the shell server.
//!
//! The server either serves plaintext, serves a throwaway self-signed chain
//! for local use, or serves an operator supplied certificate. Clients trust
//! the dev chain by pointing `remsh --ca-file` at the `ca.pem` written here,
//! so no certificate material ships with the binaries.

use std::path::{Path, PathBuf};

use tonic::transport::{Identity, ServerTlsConfig};
use tracing::info;

use super::certs::{CertError, generate_dev_bundle, write_dev_certs};

/// Names the dev certificate is valid for. Clients must dial one of these.
pub const DEV_SERVER_NAMES: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0"];

const CERT_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const KEY_MARKER: &str = "PRIVATE KEY-----";

/// How the server secures its listener.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    #[default]
    Disabled,
    /// Mint a fresh CA and server certificate at every start.
    ///
    /// `ca.pem`, `server.pem` and `server-key.pem` are rewritten in
    /// `cert_dir`, so a client pinned to an older `ca.pem` stops trusting the
    /// server after a restart.
    DevSelfSigned { cert_dir: PathBuf },
    /// PEM files provided by the operator, read once at start.
    Custom { cert_path: PathBuf, key_path: PathBuf },
}

impl TlsMode {
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// The tonic TLS settings for this mode, `None` when serving plaintext.
    ///
    /// Fails before the listener is bound if the dev chain cannot be written
    /// or the custom files are unreadable or lack the expected PEM blocks.
    pub fn to_server_tls_config(&self) -> Result<Option<ServerTlsConfig>, TlsConfigError> {
        let identity = match self {
            Self::Disabled => return Ok(None),
            Self::DevSelfSigned { cert_dir } => dev_identity(cert_dir)?,
            Self::Custom {
                cert_path,
                key_path,
            } => {
                let cert_pem = read_pem(cert_path, "certificate", CERT_MARKER)?;
                let key_pem = read_pem(key_path, "private key", KEY_MARKER)?;
                info!(cert = %cert_path.display(), key = %key_path.display(), "Serving operator certificate");
                Identity::from_pem(cert_pem, key_pem)
            }
        };
        Ok(Some(ServerTlsConfig::new().identity(identity)))
    }
}

fn dev_identity(cert_dir: &Path) -> Result<Identity, TlsConfigError> {
    let bundle = generate_dev_bundle(DEV_SERVER_NAMES)?;
    write_dev_certs(cert_dir, &bundle)?;
    info!(
        ca = %cert_dir.join("ca.pem").display(),
        names = ?DEV_SERVER_NAMES,
        "Serving self-signed dev certificate, pass the CA to remsh --ca-file"
    );
    Ok(Identity::from_pem(
        &bundle.server_cert_pem,
        &bundle.server_key_pem,
    ))
}

fn read_pem(path: &Path, what: &'static str, marker: &'static str) -> Result<String, TlsConfigError> {
    let pem = std::fs::read_to_string(path).map_err(|source| TlsConfigError::Read {
        what,
        path: path.to_path_buf(),
        source,
    })?;
    if !pem.contains(marker) {
        return Err(TlsConfigError::NotPem {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(pem)
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Dev certificate setup failed: {0}")]
    DevCerts(#[from] CertError),

    #[error("Failed to read {what} {}: {source}", path.display())]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} holds no PEM {what}", path.display())]
    NotPem { what: &'static str, path: PathBuf },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn disabled_serves_plaintext() {
        let mode = TlsMode::default();
        assert!(!mode.is_enabled());
        assert!(mode.to_server_tls_config().unwrap().is_none());
    }

    #[test]
    fn dev_mode_leaves_a_ca_for_clients() {
        let dir = tempfile::tempdir().unwrap();
        let cert_dir = dir.path().join("nested/certs");
        let mode = TlsMode::DevSelfSigned {
            cert_dir: cert_dir.clone(),
        };
        assert!(mode.to_server_tls_config().unwrap().is_some());

        let ca = std::fs::read_to_string(cert_dir.join("ca.pem")).unwrap();
        assert!(ca.contains(CERT_MARKER));
        let key = std::fs::read_to_string(cert_dir.join("server-key.pem")).unwrap();
        assert!(key.contains(KEY_MARKER));
    }

    #[test]
    fn dev_mode_mints_a_new_ca_per_start() {
        let dir = tempfile::tempdir().unwrap();
        let mode = TlsMode::DevSelfSigned {
            cert_dir: dir.path().to_path_buf(),
        };
        mode.to_server_tls_config().unwrap();
        let first = std::fs::read_to_string(dir.path().join("ca.pem")).unwrap();
        mode.to_server_tls_config().unwrap();
        let second = std::fs::read_to_string(dir.path().join("ca.pem")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_certificate_names_the_file() {
        let mode = TlsMode::Custom {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        let Err(err) = mode.to_server_tls_config() else {
            panic!("missing certificate accepted");
        };
        assert!(matches!(err, TlsConfigError::Read { what: "certificate", .. }));
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn key_file_without_a_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(DEV_SERVER_NAMES).unwrap();
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server-key.pem");
        std::fs::write(&cert_path, &bundle.server_cert_pem).unwrap();
        // Certificate where the key belongs.
        std::fs::write(&key_path, &bundle.server_cert_pem).unwrap();

        let mode = TlsMode::Custom {
            cert_path,
            key_path,
        };
        assert!(matches!(
            mode.to_server_tls_config(),
            Err(TlsConfigError::NotPem { what: "private key", .. })
        ));
    }

    #[test]
    fn operator_certificate_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(DEV_SERVER_NAMES).unwrap();
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server-key.pem");
        std::fs::write(&cert_path, &bundle.server_cert_pem).unwrap();
        std::fs::write(&key_path, &bundle.server_key_pem).unwrap();

        let mode = TlsMode::Custom {
            cert_path,
            key_path,
        };
        assert!(mode.is_enabled());
        assert!(mode.to_server_tls_config().unwrap().is_some());
    }
}
