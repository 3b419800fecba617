//! Common error types for Peerlink.

use thiserror::Error;

/// Result type alias using Peerlink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Peerlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer connection is closed; the frame was not queued.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }
}
