//! Transfer frames and their channel encoding

use super::FileMetadata;
use crate::error::{Error, Result};
use crate::transport::ChannelMessage;

/// Text value that closes a transfer
pub const TERMINATOR: &str = "EOF";

/// One frame of the transfer protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Metadata(FileMetadata),
    Chunk(Vec<u8>),
    End,
}

impl Frame {
    /// Encode for the channel. Metadata and the terminator travel as text,
    /// chunks as binary.
    pub fn encode(self) -> Result<ChannelMessage> {
        Ok(match self {
            Frame::Metadata(meta) => ChannelMessage::Text(serde_json::to_string(&meta)?),
            Frame::Chunk(bytes) => ChannelMessage::Binary(bytes),
            Frame::End => ChannelMessage::Text(TERMINATOR.to_string()),
        })
    }

    /// Decode the first frame of a session, which is always metadata
    pub fn decode_metadata(message: ChannelMessage) -> Result<FileMetadata> {
        match message {
            ChannelMessage::Text(text) => serde_json::from_str(&text)
                .map_err(|e| Error::Protocol(format!("Invalid metadata frame: {}", e))),
            ChannelMessage::Binary(bytes) => Err(Error::Protocol(format!(
                "Expected metadata frame, got {} binary bytes",
                bytes.len()
            ))),
        }
    }

    /// Decode a frame that follows metadata. `None` is the terminator;
    /// any other frame is file data.
    pub fn decode_chunk(message: ChannelMessage) -> Option<Vec<u8>> {
        match message {
            ChannelMessage::Text(text) if text == TERMINATOR => None,
            ChannelMessage::Text(text) => Some(text.into_bytes()),
            ChannelMessage::Binary(bytes) => Some(bytes),
        }
    }
}
