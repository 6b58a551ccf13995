//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::models::{IdentityId, RoomId};
use crate::negotiation::PairPhase;
use crate::session::ROOM_CAPACITY;

/// Validate that a room never exceeds two members and holds no duplicates
pub fn assert_room_capacity(room_id: &RoomId, members: &[IdentityId]) {
    debug_assert!(
        members.len() <= ROOM_CAPACITY,
        "Room {} has {} members, capacity is {}",
        room_id,
        members.len(),
        ROOM_CAPACITY
    );

    debug_assert!(
        !(members.len() == 2 && members[0] == members[1]),
        "Room {} lists identity {} twice",
        room_id,
        members[0]
    );
}

/// Validate a pair phase transition
pub fn assert_phase_transition(from: PairPhase, to: PairPhase) {
    let allowed = matches!(
        (from, to),
        (PairPhase::Idle, PairPhase::Negotiating)
            | (PairPhase::Idle, PairPhase::Connected)
            | (PairPhase::Negotiating, PairPhase::Connected)
            | (PairPhase::Negotiating, PairPhase::Failed)
            | (PairPhase::Connected, PairPhase::Failed)
    );
    debug_assert!(allowed, "Illegal pair transition {:?} -> {:?}", from, to);
}

/// Once a remote description is applied, no candidate may stay queued
pub fn assert_candidates_flushed(remote_applied: bool, queued: usize) {
    debug_assert!(
        !remote_applied || queued == 0,
        "{} candidates still queued after remote description was applied",
        queued
    );
}
