//! Network error types

use std::io;

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

    /// The relay refused a request it could not map to a core error
    #[error("Request rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Core(#[from] duet_core::Error),
}

impl Error {
    /// The core error behind this one, if any
    pub fn as_core(&self) -> Option<&duet_core::Error> {
        match self {
            Error::Core(e) => Some(e),
            _ => None,
        }
    }
}
