//! TLS configuration and development certificate generation.

pub mod certs;
pub mod config;

pub use certs::{CertBundle, CertError, generate_dev_bundle, write_dev_certs};
pub use config::{DEV_SERVER_NAMES, TlsConfigError, TlsMode};
