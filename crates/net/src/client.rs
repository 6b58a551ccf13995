//! TCP clients for the relay
//!
//! [`ControlClient`] issues room requests. [`SignalingClient`] attaches an
//! identity and exchanges negotiation signals with the other member of
//! its room.

use std::net::SocketAddr;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duet_core::{Error as CoreError, IdentityId, Role, RoomId, Signal};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::Message;

/// Request/response connection to the relay's control surface
pub struct ControlClient {
    stream: TcpStream,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(ControlClient { stream })
    }

    async fn request(&mut self, msg: Message) -> Result<Message> {
        write_frame(&mut self.stream, &msg).await?;
        match read_frame(&mut self.stream).await? {
            Message::Rejected {
                error: Some(error), ..
            } => Err(Error::Core(error.into())),
            Message::Rejected { code, reason, .. } => Err(Error::Rejected { code, reason }),
            reply => Ok(reply),
        }
    }

    /// Create a room; the caller becomes its first member
    pub async fn create_room(&mut self) -> Result<(RoomId, IdentityId)> {
        match self.request(Message::CreateRoom).await? {
            Message::RoomCreated { room_id, identity } => {
                info!(room_id = %room_id, "Room created");
                Ok((room_id, identity))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Join a room as its second member
    pub async fn join_room(&mut self, room_id: &RoomId) -> Result<IdentityId> {
        let request = Message::JoinRoom {
            room_id: room_id.clone(),
        };
        match self.request(request).await? {
            Message::RoomJoined { identity, .. } => {
                info!(room_id = %room_id, "Joined room");
                Ok(identity)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Check membership; fails with `AccessDenied` if not a member
    pub async fn verify(&mut self, room_id: &RoomId, identity: &IdentityId) -> Result<()> {
        let request = Message::Verify {
            room_id: room_id.clone(),
            identity: identity.clone(),
        };
        match self.request(request).await? {
            Message::Verified => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.request(Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &Message) -> Error {
    Error::Protocol(format!("unexpected reply {}", msg.kind()))
}

/// Relay's reply to `attach`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub room_id: RoomId,
    pub role: Role,
    pub peer_connected: bool,
}

/// Event received on a signaling connection
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The other member of the room attached
    PeerJoined(IdentityId),
    Signal(Signal),
    /// Connection lost
    Disconnected,
}

enum ClientCommand {
    Send(Message),
    Disconnect,
}

/// Cloneable handle that sends signals over a signaling connection
#[derive(Clone)]
pub struct SignalSender {
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl SignalSender {
    pub async fn send(&self, signal: &Signal) -> Result<()> {
        let msg =
            Message::from_signal(signal).map_err(|e| Error::Protocol(e.to_string()))?;
        self.command(ClientCommand::Send(msg)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.command(ClientCommand::Send(Message::Ping)).await
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    async fn command(&self, cmd: ClientCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::NotConnected)
    }
}

/// Signaling connection for one identity
pub struct SignalingClient {
    welcome: Welcome,
    sender: SignalSender,
    event_rx: mpsc::Receiver<SignalingEvent>,
}

impl SignalingClient {
    /// Attach `identity` and wait for the welcome.
    ///
    /// The relay drops connections for unknown identities, which surfaces
    /// here as `AccessDenied`.
    pub async fn connect(addr: SocketAddr, identity: &IdentityId) -> Result<Self> {
        info!(addr = %addr, identity = %identity, "Attaching to relay");

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        // Send attach
        write_frame(
            &mut writer,
            &Message::Attach {
                identity: identity.clone(),
            },
        )
        .await?;

        // Wait for welcome
        let welcome = match read_frame(&mut reader).await {
            Ok(Message::Welcome {
                room_id,
                role,
                peer_connected,
            }) => Welcome {
                room_id,
                role,
                peer_connected,
            },
            Ok(other) => return Err(unexpected(&other)),
            Err(Error::ConnectionClosed) => return Err(Error::Core(CoreError::AccessDenied)),
            Err(e) => return Err(e),
        };
        debug!(room_id = %welcome.room_id, role = %welcome.role, "Welcome received");

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        // Spawn connection task
        tokio::spawn(connection_task(reader, writer, event_tx, cmd_rx));

        Ok(SignalingClient {
            welcome,
            sender: SignalSender { cmd_tx },
            event_rx,
        })
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub async fn send_signal(&self, signal: &Signal) -> Result<()> {
        self.sender.send(signal).await
    }

    /// Get the next signaling event
    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.event_rx.recv().await
    }

    pub async fn disconnect(&self) {
        self.sender.disconnect().await;
    }

    /// Split into the welcome, a sender, and the event stream
    pub fn into_parts(self) -> (Welcome, SignalSender, mpsc::Receiver<SignalingEvent>) {
        (self.welcome, self.sender, self.event_rx)
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    event_tx: mpsc::Sender<SignalingEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    // Answer keepalives inline
                    Ok(Message::Ping) => {
                        if let Err(e) = write_frame(&mut writer, &Message::Pong).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Ok(msg) => handle_relay_message(msg, &event_tx).await,
                    Err(Error::ConnectionClosed) => {
                        debug!("Relay closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    let _ = event_tx.send(SignalingEvent::Disconnected).await;
    info!("Signaling disconnected");
}

/// Handle a message from the relay
async fn handle_relay_message(msg: Message, event_tx: &mpsc::Sender<SignalingEvent>) {
    let event = match msg {
        Message::UserJoined { identity } => SignalingEvent::PeerJoined(identity),
        Message::Pong => {
            debug!("Received pong");
            return;
        }
        msg if msg.is_relayed() => {
            let kind = msg.kind();
            match msg.into_signal() {
                Ok(Some(signal)) => SignalingEvent::Signal(signal),
                Ok(None) => return,
                Err(e) => {
                    warn!(kind, error = %e, "Malformed signal payload");
                    return;
                }
            }
        }
        other => {
            debug!(kind = other.kind(), "Ignoring unexpected message");
            return;
        }
    };
    let _ = event_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Outbox, RelayServer};
    use duet_core::{IceCandidate, MemoryStore, SessionDescription};
    use std::sync::Arc;

    async fn start() -> RelayServer<MemoryStore<Outbox>> {
        RelayServer::start(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let server = start().await;
        let mut control = ControlClient::connect(server.addr()).await.unwrap();

        let (room_id, first) = control.create_room().await.unwrap();
        let second = control.join_room(&room_id).await.unwrap();
        assert_ne!(first, second);

        control.verify(&room_id, &first).await.unwrap();
        control.ping().await.unwrap();

        let err = control.join_room(&room_id).await.unwrap_err();
        assert!(matches!(err, Error::Core(CoreError::RoomFull)));

        let err = control
            .join_room(&RoomId::new("NOSUCH00"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Core(CoreError::RoomNotFound)));
        assert_eq!(err.as_core().and_then(|e| e.status_code()), Some(404));

        let err = control
            .verify(&RoomId::new("NOSUCH00"), &first)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Core(CoreError::AccessDenied)));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_identity_is_denied() {
        let server = start().await;
        let result = SignalingClient::connect(server.addr(), &IdentityId::new("GHOST000")).await;
        assert!(matches!(
            result,
            Err(Error::Core(CoreError::AccessDenied))
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_signals_reach_the_peer() {
        let server = start().await;
        let mut control = ControlClient::connect(server.addr()).await.unwrap();
        let (room_id, first) = control.create_room().await.unwrap();
        let second = control.join_room(&room_id).await.unwrap();

        let mut a = SignalingClient::connect(server.addr(), &first).await.unwrap();
        assert_eq!(a.welcome().role, Role::Polite);
        assert!(!a.welcome().peer_connected);

        let mut b = SignalingClient::connect(server.addr(), &second).await.unwrap();
        assert_eq!(b.welcome().role, Role::Impolite);
        assert!(b.welcome().peer_connected);

        match a.next_event().await.unwrap() {
            SignalingEvent::PeerJoined(identity) => assert_eq!(identity, second),
            other => panic!("unexpected {:?}", other),
        }

        let offer = Signal::Offer(SessionDescription::offer("v=0"));
        b.send_signal(&offer).await.unwrap();
        match a.next_event().await.unwrap() {
            SignalingEvent::Signal(signal) => assert_eq!(signal, offer),
            other => panic!("unexpected {:?}", other),
        }

        let candidate = Signal::IceCandidate(IceCandidate::new("candidate:1"));
        a.sender().send(&candidate).await.unwrap();
        match b.next_event().await.unwrap() {
            SignalingEvent::Signal(signal) => assert_eq!(signal, candidate),
            other => panic!("unexpected {:?}", other),
        }

        a.disconnect().await;
        assert!(matches!(
            a.next_event().await,
            Some(SignalingEvent::Disconnected)
        ));
        server.shutdown();
    }
}
