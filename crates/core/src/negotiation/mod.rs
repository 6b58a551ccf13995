//! Peer-connection negotiation
//!
//! Implements perfect negotiation: the impolite peer initiates and persists
//! through collisions, the polite peer yields, and remote candidates are
//! held back until a remote description exists.

mod engine;
mod state;

pub use engine::{EngineEvent, EngineInput, NegotiationEngine, CHANNEL_LABEL};
pub use state::{CandidateRoute, NegotiationState, OfferDecision, OfferFlow, PairPhase};
