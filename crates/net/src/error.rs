//! Network error types

use std::io;

use crate::protocol::Rejection;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request rejected: {0}")]
    Rejected(Rejection),

    #[error("Not connected")]
    NotConnected,

    #[error("No response from server")]
    Timeout,

    #[error("Server full")]
    ServerFull,

    #[error(transparent)]
    Core(#[from] herald_core::Error),

    /// Audio sent before the preparation delay elapsed or after the session ended
    #[error("Session is not live")]
    NotLive,
}

impl Error {
    /// Whether the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rejected(rejection) if rejection.is_retryable())
    }
}
