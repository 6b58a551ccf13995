//! Relay protocol message types
//!
//! All messages are JSON objects tagged by `type` and travel as
//! length-prefixed frames. The first frame on a connection picks its
//! mode: `attach` makes it a signaling connection, any control request
//! makes it a control connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use duet_core::{Error as CoreError, IdentityId, Role, RoomId, Signal};

/// Control-plane failures that cross the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlError {
    RoomNotFound,
    RoomFull,
    AccessDenied,
}

impl ControlError {
    pub fn from_core(error: &CoreError) -> Option<Self> {
        match error {
            CoreError::RoomNotFound => Some(ControlError::RoomNotFound),
            CoreError::RoomFull => Some(ControlError::RoomFull),
            CoreError::AccessDenied => Some(ControlError::AccessDenied),
            _ => None,
        }
    }
}

impl From<ControlError> for CoreError {
    fn from(error: ControlError) -> Self {
        match error {
            ControlError::RoomNotFound => CoreError::RoomNotFound,
            ControlError::RoomFull => CoreError::RoomFull,
            ControlError::AccessDenied => CoreError::AccessDenied,
        }
    }
}

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Create a room with the caller as its first member
    CreateRoom,

    RoomCreated {
        room_id: RoomId,
        identity: IdentityId,
    },

    /// Join an existing room as its second member
    JoinRoom { room_id: RoomId },

    RoomJoined {
        room_id: RoomId,
        identity: IdentityId,
    },

    /// Check that an identity belongs to a room
    Verify {
        room_id: RoomId,
        identity: IdentityId,
    },

    Verified,

    /// A control request failed
    Rejected {
        code: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ControlError>,
        reason: String,
    },

    /// Turn this connection into the identity's signaling connection
    Attach { identity: IdentityId },

    /// Reply to `attach`
    Welcome {
        room_id: RoomId,
        role: Role,
        peer_connected: bool,
    },

    /// The other member of the room attached
    UserJoined { identity: IdentityId },

    /// Relayed untouched
    Offer { description: Value },

    /// Relayed untouched
    Answer { description: Value },

    /// Relayed untouched
    IceCandidate { candidate: Value },

    Ping,

    Pong,
}

impl Message {
    /// Rejection reply for a failed control operation
    pub fn rejection(error: &CoreError) -> Self {
        Message::Rejected {
            code: error.status_code().unwrap_or(500),
            error: ControlError::from_core(error),
            reason: error.to_string(),
        }
    }

    /// Wire name of the message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CreateRoom => "create-room",
            Message::RoomCreated { .. } => "room-created",
            Message::JoinRoom { .. } => "join-room",
            Message::RoomJoined { .. } => "room-joined",
            Message::Verify { .. } => "verify",
            Message::Verified => "verified",
            Message::Rejected { .. } => "rejected",
            Message::Attach { .. } => "attach",
            Message::Welcome { .. } => "welcome",
            Message::UserJoined { .. } => "user-joined",
            Message::Offer { .. } => "offer",
            Message::Answer { .. } => "answer",
            Message::IceCandidate { .. } => "ice-candidate",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    /// Offer, answer and candidate messages are forwarded to the peer
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Message::Offer { .. } | Message::Answer { .. } | Message::IceCandidate { .. }
        )
    }

    pub fn from_signal(signal: &Signal) -> Result<Self, serde_json::Error> {
        Ok(match signal {
            Signal::Offer(description) => Message::Offer {
                description: serde_json::to_value(description)?,
            },
            Signal::Answer(description) => Message::Answer {
                description: serde_json::to_value(description)?,
            },
            Signal::IceCandidate(candidate) => Message::IceCandidate {
                candidate: serde_json::to_value(candidate)?,
            },
        })
    }

    /// Parse a relayed payload. `Ok(None)` for messages that carry no
    /// signal.
    pub fn into_signal(self) -> Result<Option<Signal>, serde_json::Error> {
        Ok(Some(match self {
            Message::Offer { description } => Signal::Offer(serde_json::from_value(description)?),
            Message::Answer { description } => {
                Signal::Answer(serde_json::from_value(description)?)
            }
            Message::IceCandidate { candidate } => {
                Signal::IceCandidate(serde_json::from_value(candidate)?)
            }
            _ => return Ok(None),
        }))
    }
}
