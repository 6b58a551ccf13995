//! Duet Core Library
//!
//! Room pairing, peer negotiation, transports, and chunked file transfer
//! for two-party direct file sharing.

pub mod error;
pub mod invariants;
pub mod models;
pub mod negotiation;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};
pub use models::*;
pub use negotiation::{EngineEvent, EngineInput, NegotiationEngine, PairPhase, CHANNEL_LABEL};
pub use session::{MemoryStore, PeerLink, SessionStore, StoreStats, ROOM_CAPACITY};
pub use transfer::{
    format_size, FileMetadata, Progress, ReceivedFile, TransferConfig, TransferEvent,
};
pub use transport::{ChannelMessage, DataChannel, PeerTransport, TransportEvent};
