//! Client-side pairing: signaling, negotiation and transfer for one peer
//!
//! A [`Peer`] verifies its membership, attaches to signaling, and runs a
//! negotiation engine against the supplied transport. Once the engine
//! reports an open channel, files can be sent with [`Peer::send_file`] and
//! inbound files arrive as [`PeerEvent::FileReceived`].

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use duet_core::negotiation::{EngineEvent, EngineInput, NegotiationEngine, PairPhase};
use duet_core::transfer::{receive_loop, send_path, TransferEvent};
use duet_core::{
    DataChannel, Error as CoreError, FileMetadata, IdentityId, PeerTransport, Progress,
    ReceivedFile, Role, RoomId, Signal, TransferConfig, TransportEvent,
};

use crate::client::{ControlClient, SignalSender, SignalingClient, SignalingEvent};
use crate::error::Result;

/// What a peer reports to its owner
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Phase(PairPhase),
    /// The transfer channel opened
    ChannelOpen { label: String },
    FileReceived(ReceivedFile),
    /// The channel closed before a file finished
    TransferAbandoned(FileMetadata),
    SignalingClosed,
}

type ChannelSlot = Arc<Mutex<Option<Arc<dyn DataChannel>>>>;

fn slot(channel: &ChannelSlot) -> MutexGuard<'_, Option<Arc<dyn DataChannel>>> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One side of a paired room
pub struct Peer {
    room_id: RoomId,
    identity: IdentityId,
    role: Role,
    config: TransferConfig,
    channel: ChannelSlot,
    engine_tx: mpsc::Sender<EngineInput>,
    signaling: SignalSender,
    events: mpsc::Receiver<PeerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Verify membership, attach to signaling and start negotiating.
    ///
    /// `transport_events` must be the event stream of `transport`.
    pub async fn connect<T>(
        addr: SocketAddr,
        room_id: RoomId,
        identity: IdentityId,
        transport: Arc<T>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: TransferConfig,
    ) -> Result<Self>
    where
        T: PeerTransport + 'static,
    {
        // Check membership before attaching
        ControlClient::connect(addr)
            .await?
            .verify(&room_id, &identity)
            .await?;

        let (welcome, signaling, signal_events) = SignalingClient::connect(addr, &identity)
            .await?
            .into_parts();
        if welcome.room_id != room_id {
            signaling.disconnect().await;
            return Err(CoreError::AccessDenied.into());
        }
        let role = welcome.role;
        info!(room_id = %room_id, role = %role, "Peer attached");

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (engine_events_tx, engine_events_rx) = mpsc::channel(64);
        let (engine_tx, engine_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        // Spawn engine and pumps
        let engine = NegotiationEngine::new(role, transport, outbound_tx, engine_events_tx);
        let tasks = vec![
            tokio::spawn(async move {
                let phase = engine.run(engine_rx, transport_events).await;
                debug!(?phase, "Negotiation engine stopped");
            }),
            tokio::spawn(outbound_pump(outbound_rx, signaling.clone())),
            tokio::spawn(signaling_pump(
                signal_events,
                engine_tx.clone(),
                events_tx.clone(),
            )),
            tokio::spawn(engine_event_pump(
                engine_events_rx,
                channel.clone(),
                events_tx,
            )),
        ];

        // Peer already waiting
        if welcome.peer_connected {
            let _ = engine_tx.send(EngineInput::PeerPresent).await;
        }

        Ok(Peer {
            room_id,
            identity,
            role,
            config,
            channel,
            engine_tx,
            signaling,
            events: events_rx,
            tasks,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_channel_open(&self) -> bool {
        slot(&self.channel)
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Send a file from disk over the open channel
    pub async fn send_file<F>(&self, path: &Path, on_progress: F) -> Result<u64>
    where
        F: FnMut(Progress),
    {
        let channel = slot(&self.channel)
            .clone()
            .ok_or(CoreError::ChannelNotReady)?;
        Ok(send_path(channel.as_ref(), path, &self.config, on_progress).await?)
    }

    /// Get the next peer event
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Stop negotiation, close the channel and leave signaling
    pub async fn close(self) {
        let Peer {
            room_id,
            channel,
            engine_tx,
            signaling,
            events,
            tasks,
            ..
        } = self;
        drop(events);

        // Cleanup
        let _ = engine_tx.send(EngineInput::Shutdown).await;
        signaling.disconnect().await;
        let open = slot(&channel).take();
        if let Some(open) = open {
            open.close().await;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(room_id = %room_id, "Peer closed");
    }
}

/// Forward engine signals to the relay
async fn outbound_pump(mut outbound: mpsc::Receiver<Signal>, signaling: SignalSender) {
    while let Some(signal) = outbound.recv().await {
        if signaling.send(&signal).await.is_err() {
            debug!(kind = signal.kind(), "Signaling gone, dropping signal");
            break;
        }
    }
}

/// Feed relay events into the engine
async fn signaling_pump(
    mut signal_events: mpsc::Receiver<SignalingEvent>,
    engine_tx: mpsc::Sender<EngineInput>,
    events: mpsc::Sender<PeerEvent>,
) {
    while let Some(event) = signal_events.recv().await {
        let input = match event {
            SignalingEvent::PeerJoined(identity) => {
                debug!(peer = %identity, "Peer joined");
                EngineInput::PeerPresent
            }
            SignalingEvent::Signal(signal) => EngineInput::Signal(signal),
            SignalingEvent::Disconnected => {
                let _ = events.send(PeerEvent::SignalingClosed).await;
                break;
            }
        };
        if engine_tx.send(input).await.is_err() {
            break;
        }
    }
}

/// Track the channel and start receiving once it opens
async fn engine_event_pump(
    mut engine_events: mpsc::Receiver<EngineEvent>,
    channel: ChannelSlot,
    events: mpsc::Sender<PeerEvent>,
) {
    while let Some(event) = engine_events.recv().await {
        let event = match event {
            EngineEvent::Phase(phase) => {
                if phase == PairPhase::Failed {
                    slot(&channel).take();
                }
                PeerEvent::Phase(phase)
            }
            EngineEvent::ChannelOpen(opened) => {
                let label = opened.label().to_string();
                *slot(&channel) = Some(opened.clone());
                tokio::spawn(receive_into(opened, events.clone()));
                PeerEvent::ChannelOpen { label }
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn receive_into(channel: Arc<dyn DataChannel>, events: mpsc::Sender<PeerEvent>) {
    let (transfer_tx, mut transfer_rx) = mpsc::channel(8);
    let receive = receive_loop(channel.as_ref(), transfer_tx);
    let forward = async {
        while let Some(event) = transfer_rx.recv().await {
            let event = match event {
                TransferEvent::Received(file) => PeerEvent::FileReceived(file),
                TransferEvent::Abandoned(metadata) => PeerEvent::TransferAbandoned(metadata),
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    };
    tokio::join!(receive, forward);
}
