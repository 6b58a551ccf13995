//! Perfect-negotiation state for one peer pair
//!
//! The `makingOffer` / `ignoreOffer` pair of flags becomes a single
//! [`OfferFlow`] value, and the candidate queue only exists until the first
//! remote description is applied.

use std::collections::VecDeque;

use crate::invariants::{assert_candidates_flushed, assert_phase_transition};
use crate::models::{IceCandidate, Role};

/// Lifecycle of the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    Idle,
    Negotiating,
    Connected,
    Failed,
}

/// Offer bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferFlow {
    /// Neither making an offer nor ignoring one
    Stable,
    /// A local offer is being synthesized and sent
    MakingOffer,
    /// An incoming offer was dropped because of a collision; answers are
    /// discarded until the next offer is evaluated
    IgnoringOffer,
}

/// What to do with an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept { collision: bool },
    Ignore,
}

/// Where an incoming candidate goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRoute {
    Queued,
    Apply(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Candidates {
    /// No remote description yet
    Pending(VecDeque<IceCandidate>),
    /// A remote description was applied; candidates go straight through
    Live,
}

/// Negotiation state owned by one engine
#[derive(Debug, Clone)]
pub struct NegotiationState {
    role: Role,
    phase: PairPhase,
    flow: OfferFlow,
    candidates: Candidates,
    channel_requested: bool,
}

impl NegotiationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: PairPhase::Idle,
            flow: OfferFlow::Stable,
            candidates: Candidates::Pending(VecDeque::new()),
            channel_requested: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> PairPhase {
        self.phase
    }

    pub fn flow(&self) -> OfferFlow {
        self.flow
    }

    pub fn remote_applied(&self) -> bool {
        matches!(self.candidates, Candidates::Live)
    }

    pub fn queued_candidates(&self) -> usize {
        match &self.candidates {
            Candidates::Pending(queue) => queue.len(),
            Candidates::Live => 0,
        }
    }

    /// Whether this side should request the channel now.
    ///
    /// True exactly once, and only for the impolite side.
    pub fn claim_channel_request(&mut self) -> bool {
        if !self.role.initiates() || self.channel_requested || self.phase == PairPhase::Failed {
            return false;
        }
        self.channel_requested = true;
        true
    }

    /// Move to `to`, returning false if the phase did not change
    pub fn advance(&mut self, to: PairPhase) -> bool {
        if self.phase == to {
            return false;
        }
        assert_phase_transition(self.phase, to);
        self.phase = to;
        true
    }

    /// Start negotiating if still idle
    pub fn touch(&mut self) -> bool {
        if self.phase == PairPhase::Idle {
            self.advance(PairPhase::Negotiating)
        } else {
            false
        }
    }

    pub fn begin_offer(&mut self) {
        self.flow = OfferFlow::MakingOffer;
    }

    /// Clear the making-offer flag; runs on success and failure alike
    pub fn end_offer(&mut self) {
        if self.flow == OfferFlow::MakingOffer {
            self.flow = OfferFlow::Stable;
        }
    }

    /// Decide on an incoming offer given whether the local side is stable
    pub fn evaluate_offer(&mut self, locally_stable: bool) -> OfferDecision {
        let collision = self.flow == OfferFlow::MakingOffer || !locally_stable;
        if collision && !self.role.is_polite() {
            self.flow = OfferFlow::IgnoringOffer;
            OfferDecision::Ignore
        } else {
            self.flow = OfferFlow::Stable;
            OfferDecision::Accept { collision }
        }
    }

    /// Answers are dropped while an offer is being ignored
    pub fn accepts_answer(&self) -> bool {
        self.flow != OfferFlow::IgnoringOffer
    }

    pub fn route_candidate(&mut self, candidate: IceCandidate) -> CandidateRoute {
        match &mut self.candidates {
            Candidates::Pending(queue) => {
                queue.push_back(candidate);
                CandidateRoute::Queued
            }
            Candidates::Live => CandidateRoute::Apply(candidate),
        }
    }

    /// Record a successful remote description and hand back queued
    /// candidates in arrival order. Later calls return nothing.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        let drained = match std::mem::replace(&mut self.candidates, Candidates::Live) {
            Candidates::Pending(queue) => queue.into_iter().collect(),
            Candidates::Live => Vec::new(),
        };
        assert_candidates_flushed(self.remote_applied(), self.queued_candidates());
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_impolite_requests_channel_once() {
        let mut polite = NegotiationState::new(Role::Polite);
        assert!(!polite.claim_channel_request());

        let mut impolite = NegotiationState::new(Role::Impolite);
        assert!(impolite.claim_channel_request());
        assert!(!impolite.claim_channel_request());
    }

    #[test]
    fn test_impolite_ignores_colliding_offer() {
        let mut state = NegotiationState::new(Role::Impolite);
        state.begin_offer();
        assert_eq!(state.evaluate_offer(true), OfferDecision::Ignore);
        assert_eq!(state.flow(), OfferFlow::IgnoringOffer);
        assert!(!state.accepts_answer());
    }

    #[test]
    fn test_impolite_ignores_offer_when_not_stable() {
        let mut state = NegotiationState::new(Role::Impolite);
        assert_eq!(state.evaluate_offer(false), OfferDecision::Ignore);
    }

    #[test]
    fn test_polite_yields_on_collision() {
        let mut state = NegotiationState::new(Role::Polite);
        state.begin_offer();
        assert_eq!(
            state.evaluate_offer(false),
            OfferDecision::Accept { collision: true }
        );
        assert_eq!(state.flow(), OfferFlow::Stable);
    }

    #[test]
    fn test_next_clean_offer_clears_ignore() {
        let mut state = NegotiationState::new(Role::Impolite);
        assert_eq!(state.evaluate_offer(false), OfferDecision::Ignore);
        assert_eq!(
            state.evaluate_offer(true),
            OfferDecision::Accept { collision: false }
        );
        assert!(state.accepts_answer());
    }

    #[test]
    fn test_end_offer_keeps_ignore_flag() {
        let mut state = NegotiationState::new(Role::Impolite);
        state.evaluate_offer(false);
        state.end_offer();
        assert_eq!(state.flow(), OfferFlow::IgnoringOffer);
    }

    #[test]
    fn test_candidates_queue_until_remote_then_flow() {
        let mut state = NegotiationState::new(Role::Polite);
        for i in 0..3 {
            let route = state.route_candidate(IceCandidate::new(format!("c{}", i)));
            assert_eq!(route, CandidateRoute::Queued);
        }
        assert_eq!(state.queued_candidates(), 3);

        let flushed: Vec<String> = state
            .remote_description_applied()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(flushed, vec!["c0", "c1", "c2"]);
        assert!(state.remote_description_applied().is_empty());

        assert_eq!(
            state.route_candidate(IceCandidate::new("c3")),
            CandidateRoute::Apply(IceCandidate::new("c3"))
        );
    }

    #[test]
    fn test_phase_transitions() {
        let mut state = NegotiationState::new(Role::Polite);
        assert!(state.touch());
        assert!(!state.touch());
        assert!(state.advance(PairPhase::Connected));
        assert!(!state.advance(PairPhase::Connected));
        assert!(state.advance(PairPhase::Failed));
        assert_eq!(state.phase(), PairPhase::Failed);
    }
}
