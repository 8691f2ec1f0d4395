//! remsh Protocol Buffers
//!
//! Generated protobuf code for the remsh gRPC API.
//!
//! This crate contains:
//! - `Message`, a single line of text
//! - `Remote` service with the bidirectional `ShellSession` stream

#![allow(clippy::derive_partial_eq_without_eq)]

/// remsh v1 API definitions.
pub mod v1 {
    tonic::include_proto!("remsh.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

impl v1::Message {
    /// Builds a message from one line of text.
    pub fn line(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}
