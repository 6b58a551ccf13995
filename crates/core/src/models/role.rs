//! Negotiation roles

use serde::{Deserialize, Serialize};

/// Role a peer plays when resolving offer collisions.
///
/// Assigned by join order: the room's first member is polite, the second is
/// impolite and initiates the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    /// Role for the member at `index` in room join order
    pub fn from_join_index(index: usize) -> Self {
        if index == 0 {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Polite)
    }

    /// Impolite peers open the channel and send the first offer
    pub fn initiates(self) -> bool {
        matches!(self, Role::Impolite)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Polite => write!(f, "polite"),
            Role::Impolite => write!(f, "impolite"),
        }
    }
}
