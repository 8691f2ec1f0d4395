//! `remsh` Core Library
//!
//! Shared functionality for `remsh` components:
//! - Configuration resolution (defaults, TOML file)
//! - Tracing initialisation
//! - Local command registry and the in-process pipeline composer
//! - Common error types

pub mod commands;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
