//! Error types for Duet Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Room already full")]
    RoomFull,

    #[error("Access denied")]
    AccessDenied,

    #[error("Channel not ready")]
    ChannelNotReady,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Negotiation step failed: {0}")]
    Negotiation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Status code for control-plane rejections, `None` for everything else
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::RoomNotFound => Some(404),
            Error::RoomFull | Error::AccessDenied => Some(403),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
