//! In-process session store guarded by a single mutex

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument};

use super::{PeerLink, SessionStore, StoreStats, ROOM_CAPACITY};
use crate::error::{Error, Result};
use crate::invariants::assert_room_capacity;
use crate::models::{ConnectionId, IdentityId, Role, RoomId, TokenGenerator};

struct Binding<H> {
    connection_id: ConnectionId,
    handle: H,
}

struct Tables<H> {
    /// Room members in join order
    rooms: HashMap<RoomId, Vec<IdentityId>>,
    identities: HashMap<IdentityId, RoomId>,
    connections: HashMap<IdentityId, Binding<H>>,
}

/// Session store kept in memory for the lifetime of the process.
///
/// One lock guards every table. Rooms are tiny and operations never await
/// while holding it.
pub struct MemoryStore<H> {
    tokens: TokenGenerator,
    tables: Mutex<Tables<H>>,
}

impl<H> MemoryStore<H> {
    pub fn new() -> Self {
        Self::with_tokens(TokenGenerator::default())
    }

    pub fn with_tokens(tokens: TokenGenerator) -> Self {
        Self {
            tokens,
            tables: Mutex::new(Tables {
                rooms: HashMap::new(),
                identities: HashMap::new(),
                connections: HashMap::new(),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables<H>> {
        // A panic while holding the lock cannot leave a room above capacity,
        // so the data is still usable.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Members of a room in join order
    pub fn members(&self, room_id: &RoomId) -> Option<Vec<IdentityId>> {
        self.tables().rooms.get(room_id).cloned()
    }

    /// Identity token that does not collide with an existing one
    fn fresh_identity(&self, tables: &Tables<H>) -> IdentityId {
        loop {
            let identity = self.tokens.identity();
            if !tables.identities.contains_key(&identity) {
                return identity;
            }
        }
    }
}

impl<H> Default for MemoryStore<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone + Send> SessionStore for MemoryStore<H> {
    type Handle = H;

    #[instrument(skip(self))]
    fn create_room(&self) -> (RoomId, IdentityId) {
        let mut tables = self.tables();
        let room_id = loop {
            let candidate = self.tokens.room_id();
            if !tables.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let identity = self.fresh_identity(&tables);

        tables.rooms.insert(room_id.clone(), vec![identity.clone()]);
        tables.identities.insert(identity.clone(), room_id.clone());

        info!(room_id = %room_id, "Room created");
        (room_id, identity)
    }

    #[instrument(skip(self), fields(room_id = %room_id))]
    fn join_room(&self, room_id: &RoomId) -> Result<IdentityId> {
        let mut tables = self.tables();
        let size = tables
            .rooms
            .get(room_id)
            .map(Vec::len)
            .ok_or(Error::RoomNotFound)?;
        if size >= ROOM_CAPACITY {
            debug!("Join rejected, room full");
            return Err(Error::RoomFull);
        }

        let identity = self.fresh_identity(&tables);
        let members = tables
            .rooms
            .get_mut(room_id)
            .ok_or(Error::RoomNotFound)?;
        members.push(identity.clone());
        assert_room_capacity(room_id, members);
        tables.identities.insert(identity.clone(), room_id.clone());

        info!("Identity joined room");
        Ok(identity)
    }

    fn verify_membership(&self, room_id: &RoomId, identity: &IdentityId) -> bool {
        self.tables()
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains(identity))
    }

    fn room_of(&self, identity: &IdentityId) -> Option<RoomId> {
        self.tables().identities.get(identity).cloned()
    }

    fn role_of(&self, identity: &IdentityId) -> Option<Role> {
        let tables = self.tables();
        let room_id = tables.identities.get(identity)?;
        let index = tables
            .rooms
            .get(room_id)?
            .iter()
            .position(|member| member == identity)?;
        Some(Role::from_join_index(index))
    }

    fn bind_connection(
        &self,
        identity: &IdentityId,
        connection_id: ConnectionId,
        handle: H,
    ) -> Result<Option<H>> {
        let mut tables = self.tables();
        if !tables.identities.contains_key(identity) {
            return Err(Error::AccessDenied);
        }
        let previous = tables.connections.insert(
            identity.clone(),
            Binding {
                connection_id,
                handle,
            },
        );

        if let Some(previous) = &previous {
            debug!(
                identity = %identity,
                replaced = %previous.connection_id,
                "Connection binding replaced"
            );
        }
        Ok(previous.map(|binding| binding.handle))
    }

    fn unbind_connection(&self, identity: &IdentityId, connection_id: ConnectionId) -> bool {
        let mut tables = self.tables();
        let current = tables
            .connections
            .get(identity)
            .map(|binding| binding.connection_id);
        if current == Some(connection_id) {
            tables.connections.remove(identity);
            true
        } else {
            false
        }
    }

    fn peer_of(&self, identity: &IdentityId) -> Option<PeerLink<H>> {
        let tables = self.tables();
        let room_id = tables.identities.get(identity)?;
        let peer = tables
            .rooms
            .get(room_id)?
            .iter()
            .find(|member| *member != identity)?;
        let binding = tables.connections.get(peer)?;
        Some(PeerLink {
            identity: peer.clone(),
            connection_id: binding.connection_id,
            handle: binding.handle.clone(),
        })
    }

    fn stats(&self) -> StoreStats {
        let tables = self.tables();
        StoreStats {
            rooms: tables.rooms.len(),
            identities: tables.identities.len(),
            connections: tables.connections.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> MemoryStore<u32> {
        MemoryStore::new()
    }

    #[test]
    fn test_create_room_makes_sole_member() {
        let store = store();
        let (room, identity) = store.create_room();
        assert!(store.verify_membership(&room, &identity));
        assert_eq!(store.members(&room).unwrap(), vec![identity.clone()]);
        assert_eq!(store.room_of(&identity), Some(room));
    }

    #[test]
    fn test_join_missing_room_is_not_found() {
        let store = store();
        let err = store.join_room(&RoomId::from("NOPE0000")).unwrap_err();
        assert!(matches!(err, Error::RoomNotFound));
    }

    #[test]
    fn test_third_join_is_full() {
        let store = store();
        let (room, _) = store.create_room();
        store.join_room(&room).unwrap();
        assert!(matches!(store.join_room(&room), Err(Error::RoomFull)));
        assert!(matches!(store.join_room(&room), Err(Error::RoomFull)));
        assert_eq!(store.members(&room).unwrap().len(), 2);
    }

    #[test]
    fn test_membership_is_room_scoped() {
        let store = store();
        let (room_a, alice) = store.create_room();
        let (room_b, bob) = store.create_room();
        assert!(!store.verify_membership(&room_a, &bob));
        assert!(!store.verify_membership(&room_b, &alice));
        assert!(!store.verify_membership(&RoomId::from("MISSING1"), &alice));
    }

    #[test]
    fn test_roles_follow_join_order() {
        let store = store();
        let (room, first) = store.create_room();
        let second = store.join_room(&room).unwrap();
        assert_eq!(store.role_of(&first), Some(Role::Polite));
        assert_eq!(store.role_of(&second), Some(Role::Impolite));
        assert_eq!(store.role_of(&IdentityId::from("STRANGER")), None);
    }

    #[test]
    fn test_peer_of_requires_connection() {
        let store = store();
        let (room, alice) = store.create_room();
        let bob = store.join_room(&room).unwrap();

        assert!(store.peer_of(&alice).is_none());

        let bob_conn = ConnectionId::new();
        store.bind_connection(&bob, bob_conn, 7).unwrap();
        let link = store.peer_of(&alice).unwrap();
        assert_eq!(link.identity, bob);
        assert_eq!(link.handle, 7);
        assert!(store.peer_of(&bob).is_none());
    }

    #[test]
    fn test_rebind_replaces_and_stale_unbind_is_ignored() {
        let store = store();
        let (room, alice) = store.create_room();
        let bob = store.join_room(&room).unwrap();

        let old = ConnectionId::new();
        let new = ConnectionId::new();
        assert_eq!(store.bind_connection(&bob, old, 1).unwrap(), None);
        assert_eq!(store.bind_connection(&bob, new, 2).unwrap(), Some(1));

        assert!(!store.unbind_connection(&bob, old));
        assert_eq!(store.peer_of(&alice).unwrap().handle, 2);

        assert!(store.unbind_connection(&bob, new));
        assert!(store.peer_of(&alice).is_none());
        // Membership survives disconnect
        assert!(store.verify_membership(&room, &bob));
    }

    #[test]
    fn test_bind_unknown_identity_is_denied() {
        let store = store();
        let result = store.bind_connection(&IdentityId::from("GHOST123"), ConnectionId::new(), 1);
        assert!(matches!(result, Err(Error::AccessDenied)));
    }

    #[test]
    fn test_concurrent_joins_respect_capacity() {
        let store: Arc<MemoryStore<u32>> = Arc::new(MemoryStore::new());
        let (room, _) = store.create_room();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let room = room.clone();
                std::thread::spawn(move || store.join_room(&room).is_ok())
            })
            .collect();

        let joined = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(joined, 1);
        assert_eq!(store.members(&room).unwrap().len(), 2);
    }

    #[test]
    fn test_stats() {
        let store = store();
        let (room, alice) = store.create_room();
        store.join_room(&room).unwrap();
        store.bind_connection(&alice, ConnectionId::new(), 0).unwrap();
        assert_eq!(
            store.stats(),
            StoreStats {
                rooms: 1,
                identities: 2,
                connections: 1
            }
        );
    }
}
