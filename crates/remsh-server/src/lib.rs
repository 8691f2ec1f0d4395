//! `remsh` server library.
//!
//! Runs one shell subprocess per gRPC `ShellSession` stream:
//! - `subprocess` starts the shell and waits for it
//! - `session` pumps lines between the stream and the shell and decides how
//!   the session ends
//! - `server` exposes the `Remote` service over TCP, optionally with TLS

pub mod server;
pub mod session;
pub mod subprocess;
pub mod tls;
