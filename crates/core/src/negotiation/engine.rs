//! Negotiation engine actor
//!
//! One engine per peer pair. It owns the [`NegotiationState`] and is driven
//! by two queues: signaling input from the relay and events raised by the
//! transport. Nothing outside the engine mutates negotiation state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::state::{CandidateRoute, NegotiationState, OfferDecision, PairPhase};
use crate::error::{Error, Result};
use crate::models::{IceCandidate, Role, SessionDescription, Signal};
use crate::transport::{
    ConnectivityState, DataChannel, PeerTransport, SignalingState, TransportEvent,
};

/// Label of the channel the impolite peer requests
pub const CHANNEL_LABEL: &str = "fileTransfer";

/// Input delivered to the engine from the signaling side
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// The other member of the room is connected to signaling
    PeerPresent,
    Signal(Signal),
    Shutdown,
}

/// Notifications emitted by the engine
#[derive(Clone)]
pub enum EngineEvent {
    Phase(PairPhase),
    ChannelOpen(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Phase(phase) => write!(f, "Phase({:?})", phase),
            EngineEvent::ChannelOpen(ch) => write!(f, "ChannelOpen({})", ch.label()),
        }
    }
}

/// Perfect-negotiation driver for one peer pair
pub struct NegotiationEngine<T: PeerTransport + ?Sized> {
    transport: Arc<T>,
    state: NegotiationState,
    outbound: mpsc::Sender<Signal>,
    events: mpsc::Sender<EngineEvent>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl<T: PeerTransport + ?Sized> NegotiationEngine<T> {
    /// Create an engine.
    ///
    /// `outbound` carries signals for the relay, `events` carries phase
    /// changes and the opened channel to the owner.
    pub fn new(
        role: Role,
        transport: Arc<T>,
        outbound: mpsc::Sender<Signal>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            transport,
            state: NegotiationState::new(role),
            outbound,
            events,
            channel: None,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Drive the engine until shutdown or transport failure.
    ///
    /// Returns the final phase.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<EngineInput>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> PairPhase {
        info!(role = %self.state.role(), "Negotiation engine started");

        loop {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(EngineInput::Shutdown) | None => {
                        debug!("Negotiation engine shutting down");
                        break;
                    }
                    Some(input) => self.handle_input(input).await,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        debug!("Transport event stream ended");
                        break;
                    }
                },
            }

            if self.state.phase() == PairPhase::Failed {
                break;
            }
        }

        // Cleanup
        self.teardown().await;
        self.state.phase()
    }

    /// Handle one signaling-side input
    pub async fn handle_input(&mut self, input: EngineInput) {
        if self.state.phase() == PairPhase::Failed {
            debug!(?input, "Pair failed, ignoring input");
            return;
        }
        match input {
            EngineInput::PeerPresent => self.on_peer_present().await,
            EngineInput::Signal(Signal::Offer(offer)) => self.on_offer(offer).await,
            EngineInput::Signal(Signal::Answer(answer)) => self.on_answer(answer).await,
            EngineInput::Signal(Signal::IceCandidate(candidate)) => {
                self.on_remote_candidate(candidate).await
            }
            EngineInput::Shutdown => {}
        }
    }

    /// Handle one transport event
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.relay(Signal::IceCandidate(candidate)).await {
                    debug!(error = %e, "Could not relay local candidate");
                }
            }
            TransportEvent::Connectivity(state) => self.on_connectivity(state).await,
            TransportEvent::ChannelOpened(channel) => {
                info!(label = %channel.label(), "Data channel open");
                self.channel = Some(channel.clone());
                self.emit(EngineEvent::ChannelOpen(channel)).await;
            }
        }
    }

    async fn on_peer_present(&mut self) {
        if self.state.claim_channel_request() {
            info!("Peer present, requesting data channel");
            if let Err(e) = self.transport.create_data_channel(CHANNEL_LABEL).await {
                warn!(error = %e, "Failed to request data channel");
            }
        } else {
            debug!(role = %self.state.role(), "Peer present, waiting for offer");
        }
    }

    async fn on_negotiation_needed(&mut self) {
        if self.state.phase() == PairPhase::Failed {
            return;
        }
        self.enter_negotiating().await;

        // Flag stays set only while the offer is in flight
        self.state.begin_offer();
        let result = self.make_offer().await;
        self.state.end_offer();

        if let Err(e) = result {
            warn!(error = %e, "Error during negotiation needed");
        }
    }

    async fn make_offer(&mut self) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.relay(Signal::Offer(offer)).await?;
        debug!("Offer sent");
        Ok(())
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        let locally_stable = self.transport.signaling_state() == SignalingState::Stable;
        match self.state.evaluate_offer(locally_stable) {
            OfferDecision::Ignore => {
                warn!(role = %self.state.role(), "Offer collision detected and ignored");
            }
            OfferDecision::Accept { collision } => {
                // Polite side rolls back its own offer
                if collision {
                    warn!(role = %self.state.role(), "Offer collision, yielding to remote offer");
                }
                self.enter_negotiating().await;
                if let Err(e) = self.accept_offer(offer).await {
                    warn!(error = %e, "Error handling offer");
                }
            }
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await;

        // Answer
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.relay(Signal::Answer(answer)).await?;
        debug!("Answer sent");
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !self.state.accepts_answer() {
            debug!("Discarding answer while ignoring a colliding offer");
            return;
        }
        match self.transport.set_remote_description(answer).await {
            Ok(()) => self.flush_candidates().await,
            Err(e) => warn!(error = %e, "Error handling answer"),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.state.route_candidate(candidate) {
            CandidateRoute::Queued => {
                trace!(
                    queued = self.state.queued_candidates(),
                    "Queued candidate until remote description"
                );
            }
            CandidateRoute::Apply(candidate) => {
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    warn!(error = %e, "Failed to add candidate");
                }
            }
        }
    }

    /// Apply queued candidates once, in arrival order
    async fn flush_candidates(&mut self) {
        let queued = self.state.remote_description_applied();
        if queued.is_empty() {
            return;
        }
        debug!(count = queued.len(), "Applying queued candidates");
        for candidate in queued {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(error = %e, "Error applying queued candidate");
            }
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        match state {
            ConnectivityState::Connected => {
                if self.state.advance(PairPhase::Connected) {
                    info!("Peer connected");
                    self.emit(EngineEvent::Phase(PairPhase::Connected)).await;
                }
            }
            ConnectivityState::Failed | ConnectivityState::Disconnected => {
                if matches!(
                    self.state.phase(),
                    PairPhase::Negotiating | PairPhase::Connected
                ) {
                    warn!(?state, "Transport failed");
                    self.state.advance(PairPhase::Failed);
                    self.close_channel().await;
                    self.emit(EngineEvent::Phase(PairPhase::Failed)).await;
                } else {
                    debug!(?state, phase = ?self.state.phase(), "Ignoring transport state");
                }
            }
            other => trace!(state = ?other, "Connectivity state"),
        }
    }

    async fn enter_negotiating(&mut self) {
        if self.state.touch() {
            self.emit(EngineEvent::Phase(PairPhase::Negotiating)).await;
        }
    }

    async fn relay(&self, signal: Signal) -> Result<()> {
        let kind = signal.kind();
        self.outbound
            .send(signal)
            .await
            .map_err(|_| Error::SendFailed(format!("signaling closed, dropped {}", kind)))
    }

    async fn emit(&self, event: EngineEvent) {
        if self.events.send(event).await.is_err() {
            trace!("No listener for engine events");
        }
    }

    async fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    async fn teardown(&mut self) {
        self.close_channel().await;
        self.transport.close().await;
    }
}
