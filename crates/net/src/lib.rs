//! Duet Network Library
//!
//! TCP relay and clients for pairing two peers.
//!
//! # Architecture
//!
//! - **Relay**: serves the control surface (create, join, verify) and
//!   relays negotiation signals between the two members of a room
//! - **Clients**: a control client and a per-identity signaling client
//! - **Peer**: drives negotiation and file transfer on the client side
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let relay = RelayServer::start(addr, Arc::new(MemoryStore::new())).await?;
//!
//! let mut control = ControlClient::connect(relay.addr()).await?;
//! let (room_id, identity) = control.create_room().await?;
//!
//! let mut peer = Peer::connect(relay.addr(), room_id, identity, transport, events, config).await?;
//! while let Some(event) = peer.next_event().await {
//!     if let PeerEvent::FileReceived(file) = event {
//!         file.save_into(&downloads).await?;
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod peer;
pub mod protocol;
pub mod server;

pub use client::{ControlClient, SignalSender, SignalingClient, SignalingEvent, Welcome};
pub use error::{Error, Result};
pub use peer::{Peer, PeerEvent};
pub use protocol::{ControlError, Message};
pub use server::{handle_control, Outbox, RelayServer};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8080;
