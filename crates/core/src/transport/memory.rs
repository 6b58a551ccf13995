//! In-memory transport for tests and same-process pairing
//!
//! `MemoryChannel` keeps a real outstanding-byte count: bytes stay counted
//! against the sender until the receiving end reads them, which makes
//! backpressure observable. `MemoryTransport` models the offer/answer
//! signaling states and, when linked with a partner, opens a channel pair
//! once both sides have completed an exchange.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace};

use super::{
    ChannelMessage, ConnectivityState, DataChannel, LowWatermark, PeerTransport, SignalingState,
    TransportEvent,
};
use crate::error::{Error, Result};
use crate::models::{IceCandidate, SdpKind, SessionDescription};

/// Bytes sent by one end and not yet read by the other
#[derive(Default)]
struct Outstanding {
    bytes: AtomicUsize,
    drained: Notify,
}

impl Outstanding {
    fn add(&self, len: usize) {
        self.bytes.fetch_add(len, Ordering::SeqCst);
    }

    fn release(&self, len: usize) {
        self.bytes.fetch_sub(len, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    fn get(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

/// One end of an in-memory channel pair
pub struct MemoryChannel {
    label: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    outgoing: Arc<Outstanding>,
    incoming: Arc<Outstanding>,
    closed: Arc<watch::Sender<bool>>,
    low_signal: bool,
}

impl MemoryChannel {
    /// Connected pair that supports the low-watermark signal
    pub fn pair(label: &str) -> (Self, Self) {
        Self::build(label, true)
    }

    /// Connected pair whose senders must poll `buffered_amount`
    pub fn pair_without_low_signal(label: &str) -> (Self, Self) {
        Self::build(label, false)
    }

    fn build(label: &str, low_signal: bool) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a_to_b = Arc::new(Outstanding::default());
        let b_to_a = Arc::new(Outstanding::default());
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let a = Self {
            label: label.to_string(),
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
            closed: closed.clone(),
            low_signal,
        };
        let b = Self {
            label: label.to_string(),
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
            outgoing: b_to_a,
            incoming: a_to_b,
            closed,
            low_signal,
        };
        (a, b)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotReady);
        }
        let len = message.len();
        self.outgoing.add(len);
        self.tx.send(message).map_err(|_| {
            self.outgoing.release(len);
            Error::SendFailed("peer end dropped".into())
        })
    }

    /// Messages queued before the channel closed are still delivered;
    /// `None` once closed and drained.
    async fn recv(&self) -> Option<ChannelMessage> {
        let closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;

        let message = match rx.try_recv() {
            Ok(message) => Some(message),
            Err(_) if *closed.borrow() => None,
            Err(_) => {
                let woken = tokio::select! {
                    message = rx.recv() => Some(message),
                    _ = wait_closed(closed) => None,
                };
                match woken {
                    Some(message) => message,
                    // Closed while waiting; something may have landed first
                    None => rx.try_recv().ok(),
                }
            }
        }?;

        self.incoming.release(message.len());
        Some(message)
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    fn buffered_amount(&self) -> usize {
        self.outgoing.get()
    }

    async fn wait_low_watermark(&self, threshold: usize) -> LowWatermark {
        if !self.low_signal {
            return LowWatermark::Unsupported;
        }
        loop {
            let drained = self.outgoing.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if !self.is_open() {
                return LowWatermark::Closed;
            }
            if self.outgoing.get() <= threshold {
                return LowWatermark::Drained;
            }

            tokio::select! {
                _ = &mut drained => {}
                _ = wait_closed(self.closed.subscribe()) => return LowWatermark::Closed,
            }
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(label = %self.label, "Memory channel closed");
        }
    }
}

struct Side {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    channel_label: Option<String>,
    descriptions_made: u32,
    candidates_made: u32,
}

struct Link {
    events: [mpsc::UnboundedSender<TransportEvent>; 2],
    negotiated: [bool; 2],
    label: Option<String>,
    connected: bool,
}

/// Peer transport backed by in-process state
pub struct MemoryTransport {
    name: String,
    side: usize,
    state: Mutex<Side>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Option<Arc<Mutex<Link>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    /// Standalone transport; it never connects on its own
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self::build(name, 0, events, None);
        (Arc::new(transport), rx)
    }

    /// Two linked transports. Once both finish an offer/answer exchange
    /// each receives `Connected` and its end of a channel pair.
    #[allow(clippy::type_complexity)]
    pub fn pair() -> (
        (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>),
        (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>),
    ) {
        let (events_a, rx_a) = mpsc::unbounded_channel();
        let (events_b, rx_b) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(Link {
            events: [events_a.clone(), events_b.clone()],
            negotiated: [false, false],
            label: None,
            connected: false,
        }));
        let a = Self::build("a", 0, events_a, Some(link.clone()));
        let b = Self::build("b", 1, events_b, Some(link));
        ((Arc::new(a), rx_a), (Arc::new(b), rx_b))
    }

    fn build(
        name: &str,
        side: usize,
        events: mpsc::UnboundedSender<TransportEvent>,
        link: Option<Arc<Mutex<Link>>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            side,
            state: Mutex::new(Side {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                applied: Vec::new(),
                channel_label: None,
                descriptions_made: 0,
                candidates_made: 0,
            }),
            events,
            link,
        }
    }

    /// Inject an event as if the transport raised it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn requested_channel(&self) -> Option<String> {
        lock(&self.state).channel_label.clone()
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut state = lock(&self.state);
        state.descriptions_made += 1;
        format!("{}-{}-{}", self.name, kind, state.descriptions_made)
    }

    fn gather_candidate(&self) {
        let n = {
            let mut state = lock(&self.state);
            state.candidates_made += 1;
            state.candidates_made
        };
        let candidate = IceCandidate {
            candidate: format!("candidate:{} {} udp 127.0.0.1 {}", self.name, n, 9000 + n),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        self.emit(TransportEvent::LocalCandidate(candidate));
    }

    /// Mark this side negotiated and open the pair when both sides are
    fn check_negotiated(&self) {
        let done = {
            let state = lock(&self.state);
            state.signaling == SignalingState::Stable
                && state.local.is_some()
                && state.remote.is_some()
        };
        let Some(link) = &self.link else {
            return;
        };
        if !done {
            return;
        }

        let mut link = lock(link);
        link.negotiated[self.side] = true;
        if let Some(label) = lock(&self.state).channel_label.clone() {
            link.label.get_or_insert(label);
        }
        if link.connected || !link.negotiated.iter().all(|n| *n) {
            return;
        }
        link.connected = true;

        let label = link.label.clone().unwrap_or_else(|| "data".to_string());
        let (a, b) = MemoryChannel::pair(&label);
        let ends: [Arc<dyn DataChannel>; 2] = [Arc::new(a), Arc::new(b)];
        for (events, end) in link.events.iter().zip(ends) {
            let _ = events.send(TransportEvent::Connectivity(ConnectivityState::Connected));
            let _ = events.send(TransportEvent::ChannelOpened(end));
        }
        debug!(label = %label, "Memory transports connected");
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.signaling_state() == SignalingState::Closed {
            return Err(Error::TransportFailed("transport closed".into()));
        }
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(Error::Negotiation("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.signaling = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(Error::Negotiation(format!(
                        "cannot set local {:?} in {:?}",
                        kind, current
                    )))
                }
            };
            state.local = Some(description);
        }
        self.gather_candidate();
        self.check_negotiated();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.signaling = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::HaveLocalOffer) => {
                    trace!(transport = %self.name, "Rolling back local offer");
                    state.local = None;
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(Error::Negotiation(format!(
                        "cannot set remote {:?} in {:?}",
                        kind, current
                    )))
                }
            };
            state.remote = Some(description);
        }
        self.check_negotiated();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(Error::Negotiation(
                "candidate added before remote description".into(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        lock(&self.state).channel_label = Some(label.to_string());
        self.emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    async fn close(&self) {
        lock(&self.state).signaling = SignalingState::Closed;
        self.emit(TransportEvent::Connectivity(ConnectivityState::Closed));
    }
}
