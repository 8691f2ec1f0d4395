//! `remsh` Client Library
//!
//! Connects to a `remsh-server` and bridges local stdin/stdout to a remote
//! shell session.

pub mod connection;
pub mod session;
