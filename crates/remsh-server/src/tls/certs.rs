//! Development certificate generation using rcgen.
//!
//! Generates a throwaway CA and a server certificate signed by it, for local
//! development and testing. NOT suitable for production use.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tracing::info;

/// Generated certificate bundle (PEM-encoded).
pub struct CertBundle {
    /// CA certificate PEM. Clients trust this via `--ca-file`.
    pub ca_cert_pem: String,
    /// Server certificate PEM.
    pub server_cert_pem: String,
    /// Server private key PEM.
    pub server_key_pem: String,
}

struct CaBundle {
    params: CertificateParams,
    key_pair: KeyPair,
    ca_cert_pem: String,
}

fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Generate a server certificate signed by the given CA.
fn generate_server_cert(
    ca: &CaBundle,
    server_names: &[&str],
) -> Result<(String, String), CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CertError::Generation(e.to_string()))?;

    params
        .distinguished_name
        .push(DnType::CommonName, "remsh server");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let server_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let server_cert = params
        .signed_by(&server_key, &issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok((server_cert.pem(), server_key.serialize_pem()))
}

/// Generate a full dev certificate bundle (CA + server).
pub fn generate_dev_bundle(server_names: &[&str]) -> Result<CertBundle, CertError> {
    let ca = generate_ca("remsh Dev")?;
    let (server_cert_pem, server_key_pem) = generate_server_cert(&ca, server_names)?;

    Ok(CertBundle {
        ca_cert_pem: ca.ca_cert_pem,
        server_cert_pem,
        server_key_pem,
    })
}

/// Write a dev certificate bundle to `dir` as `ca.pem`, `server.pem` and
/// `server-key.pem`.
pub fn write_dev_certs(dir: &Path, bundle: &CertBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    let ca_path = dir.join("ca.pem");
    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server-key.pem");

    std::fs::write(&ca_path, &bundle.ca_cert_pem)
        .map_err(|e| CertError::Io(format!("Failed to write CA cert: {e}")))?;
    std::fs::write(&cert_path, &bundle.server_cert_pem)
        .map_err(|e| CertError::Io(format!("Failed to write server cert: {e}")))?;
    std::fs::write(&key_path, &bundle.server_key_pem)
        .map_err(|e| CertError::Io(format!("Failed to write server key: {e}")))?;

    info!(
        ca = %ca_path.display(),
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Dev certificates written"
    );

    Ok(())
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}
