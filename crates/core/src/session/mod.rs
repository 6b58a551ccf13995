//! Room membership and connection bindings
//!
//! The store pairs at most two identities per room and remembers which live
//! signaling connection belongs to each identity. The connection handle type
//! is left to the caller; the relay stores its outbound queue there.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::models::{ConnectionId, IdentityId, RoomId, Role};

/// Maximum members per room
pub const ROOM_CAPACITY: usize = 2;

/// The other member of a room together with its live connection
#[derive(Debug, Clone)]
pub struct PeerLink<H> {
    pub identity: IdentityId,
    pub connection_id: ConnectionId,
    pub handle: H,
}

/// Store counters, used for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub rooms: usize,
    pub identities: usize,
    pub connections: usize,
}

/// Session store operations
///
/// Implementations must serialize `join_room` and `bind_connection` so the
/// room capacity holds under racing callers.
pub trait SessionStore: Send + Sync {
    /// Handle used to reach a bound connection
    type Handle: Clone + Send;

    /// Create a room with a fresh identity as its sole member
    fn create_room(&self) -> (RoomId, IdentityId);

    /// Add a fresh identity to an existing room
    fn join_room(&self, room_id: &RoomId) -> Result<IdentityId>;

    /// Check that `identity` is a member of `room_id`
    fn verify_membership(&self, room_id: &RoomId, identity: &IdentityId) -> bool;

    /// Room an identity belongs to
    fn room_of(&self, identity: &IdentityId) -> Option<RoomId>;

    /// Negotiation role derived from join order
    fn role_of(&self, identity: &IdentityId) -> Option<Role>;

    /// Bind a live connection to an identity, returning the replaced handle.
    ///
    /// Last writer wins.
    fn bind_connection(
        &self,
        identity: &IdentityId,
        connection_id: ConnectionId,
        handle: Self::Handle,
    ) -> Result<Option<Self::Handle>>;

    /// Clear the binding if it still points at `connection_id`
    fn unbind_connection(&self, identity: &IdentityId, connection_id: ConnectionId) -> bool;

    /// The other member of the identity's room, if it is connected
    fn peer_of(&self, identity: &IdentityId) -> Option<PeerLink<Self::Handle>>;

    fn stats(&self) -> StoreStats;
}
