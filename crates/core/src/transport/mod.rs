//! External transport abstraction
//!
//! The point-to-point stack (candidate gathering, DTLS, SCTP) lives outside
//! this crate. Negotiation and transfer only program against these traits,
//! so a browser bridge, a native WebRTC stack or the in-memory pair can sit
//! underneath.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IceCandidate, SessionDescription};

/// A message on an ordered, reliable channel.
///
/// Text and binary are distinct framing kinds, so a binary payload can never
/// be mistaken for a text control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(s) => s.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of waiting for the outstanding byte count to drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowWatermark {
    /// Outstanding bytes dropped to the threshold
    Drained,
    /// The channel closed while waiting
    Closed,
    /// The channel cannot signal; callers must poll `buffered_amount`
    Unsupported,
}

/// Ordered, reliable message channel between the two peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Queue a message for delivery
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    /// Next message from the peer, `None` once the channel is closed
    async fn recv(&self) -> Option<ChannelMessage>;

    fn is_open(&self) -> bool;

    /// Bytes handed to `send` that have not left the local buffer yet
    fn buffered_amount(&self) -> usize;

    /// Wait until `buffered_amount` is at or below `threshold`
    async fn wait_low_watermark(&self, _threshold: usize) -> LowWatermark {
        LowWatermark::Unsupported
    }

    async fn close(&self);
}

/// Signaling state of the local side of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Connectivity state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events the transport raises; they are fed into the negotiation engine
#[derive(Clone)]
pub enum TransportEvent {
    /// The transport wants a new offer (e.g. after a channel was requested)
    NegotiationNeeded,
    /// A local candidate was gathered and should reach the peer
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    /// A data channel opened, created locally or by the peer
    ChannelOpened(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            TransportEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            TransportEvent::Connectivity(s) => write!(f, "Connectivity({:?})", s),
            TransportEvent::ChannelOpened(ch) => write!(f, "ChannelOpened({})", ch.label()),
        }
    }
}

/// Peer connection capabilities the negotiation engine needs
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the peer's description. Applying an offer while holding a local
    /// offer rolls the local one back.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Request a data channel; the transport answers with `NegotiationNeeded`
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn close(&self);
}

// Blanket implementations so Arc-wrapped transports can be passed directly

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        (**self).send(message).await
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        (**self).recv().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn buffered_amount(&self) -> usize {
        (**self).buffered_amount()
    }

    async fn wait_low_watermark(&self, threshold: usize) -> LowWatermark {
        (**self).wait_low_watermark(threshold).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
