//! Shell subprocess lifecycle.
//!
//! Starts the per-session shell in a private working directory and process
//! group, and waits for it to exit.

mod group;
mod supervisor;

pub use group::ProcessGroup;
pub use supervisor::{ExitWaiter, ShellConfig, ShellPipes, ShellProcess, SubprocessError};
