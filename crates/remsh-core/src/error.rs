//! Error types for `remsh` core library.

use thiserror::Error;

/// Result type alias using `remsh` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `remsh` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML decoding error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
