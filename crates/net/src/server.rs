//! TCP relay: control surface and signaling relay
//!
//! Every connection starts by sending one frame. `attach` binds the
//! connection to an identity and relays offers, answers and candidates to
//! the other member of its room. Anything else is a control request and
//! gets exactly one reply per request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};

use duet_core::{ConnectionId, Error as CoreError, IdentityId, SessionStore};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::Message;

/// Handle to one signaling connection.
///
/// Messages queue for the connection's writer task. A newer attach for the
/// same identity evicts the older connection, which then stops reading.
#[derive(Clone)]
pub struct Outbox {
    messages: mpsc::Sender<Message>,
    evict: Arc<Notify>,
}

impl Outbox {
    pub fn new(messages: mpsc::Sender<Message>) -> Self {
        Outbox {
            messages,
            evict: Arc::new(Notify::new()),
        }
    }

    /// Queue a message for the connection's writer
    pub async fn send(
        &self,
        msg: Message,
    ) -> std::result::Result<(), mpsc::error::SendError<Message>> {
        self.messages.send(msg).await
    }

    /// Tell the connection it has been replaced
    pub fn evict(&self) {
        // Stores a permit if the session is not waiting yet
        self.evict.notify_one();
    }

    /// Resolves once the connection has been replaced
    pub async fn evicted(&self) {
        self.evict.notified().await
    }
}

/// Per-connection outbound queue depth
const OUTBOX_CAPACITY: usize = 64;

/// Relay server handle
pub struct RelayServer<S> {
    addr: SocketAddr,
    store: Arc<S>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S> RelayServer<S>
where
    S: SessionStore<Handle = Outbox> + 'static,
{
    /// Bind `addr` and start accepting connections
    pub async fn start(addr: SocketAddr, store: Arc<S>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Relay started");

        let (shutdown_tx, _) = broadcast::channel(1);

        // Spawn accept loop
        tokio::spawn(accept_loop(listener, store.clone(), shutdown_tx.clone()));

        Ok(RelayServer {
            addr: bound_addr,
            store,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Stop accepting and close every open connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Relay shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop<S>(listener: TcpListener, store: Arc<S>, shutdown_tx: broadcast::Sender<()>)
where
    S: SessionStore<Handle = Outbox> + 'static,
{
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let store = store.clone();
                        let shutdown_rx = shutdown_tx.subscribe();

                        // Spawn connection handler
                        tokio::spawn(handle_connection(stream, addr, store, shutdown_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Dispatch a connection on its first frame
async fn handle_connection<S>(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<S>,
    shutdown_rx: broadcast::Receiver<()>,
) where
    S: SessionStore<Handle = Outbox>,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let first: Message = match read_frame(&mut reader).await {
        Ok(msg) => msg,
        Err(Error::ConnectionClosed) => {
            debug!(addr = %addr, "Connection closed before first frame");
            return;
        }
        Err(e) => {
            warn!(addr = %addr, error = %e, "Bad first frame");
            return;
        }
    };

    match first {
        Message::Attach { identity } => {
            signaling_session(identity, reader, writer, addr, store, shutdown_rx).await
        }
        request => control_session(request, reader, writer, addr, store, shutdown_rx).await,
    }
}

/// Answer control requests until the client hangs up
async fn control_session<S: SessionStore>(
    first: Message,
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    addr: SocketAddr,
    store: Arc<S>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut request = first;
    loop {
        let reply = handle_control(store.as_ref(), request);
        if let Err(e) = write_frame(&mut writer, &reply).await {
            debug!(addr = %addr, error = %e, "Write failed");
            return;
        }

        request = tokio::select! {
            result = read_frame(&mut reader) => match result {
                Ok(msg) => msg,
                Err(Error::ConnectionClosed) => {
                    debug!(addr = %addr, "Control connection closed");
                    return;
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Read error");
                    return;
                }
            },
            _ = shutdown_rx.recv() => return,
        };
    }
}

/// Apply one control request to the store
pub fn handle_control<S: SessionStore + ?Sized>(store: &S, request: Message) -> Message {
    match request {
        Message::CreateRoom => {
            let (room_id, identity) = store.create_room();
            Message::RoomCreated { room_id, identity }
        }
        Message::JoinRoom { room_id } => match store.join_room(&room_id) {
            Ok(identity) => Message::RoomJoined { room_id, identity },
            Err(e) => {
                debug!(room_id = %room_id, error = %e, "Join rejected");
                Message::rejection(&e)
            }
        },
        Message::Verify { room_id, identity } => {
            if store.verify_membership(&room_id, &identity) {
                Message::Verified
            } else {
                debug!(room_id = %room_id, identity = %identity, "Membership check failed");
                Message::rejection(&CoreError::AccessDenied)
            }
        }
        Message::Ping => Message::Pong,
        other => Message::Rejected {
            code: 400,
            error: None,
            reason: format!("unexpected {} on control connection", other.kind()),
        },
    }
}

/// Run one identity's signaling connection
async fn signaling_session<S>(
    identity: IdentityId,
    mut reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
    addr: SocketAddr,
    store: Arc<S>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    S: SessionStore<Handle = Outbox>,
{
    let (Some(room_id), Some(role)) = (store.room_of(&identity), store.role_of(&identity)) else {
        warn!(addr = %addr, identity = %identity, "Unknown identity, dropping connection");
        return;
    };

    let connection_id = ConnectionId::new();
    let (msg_tx, msg_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let outbox = Outbox::new(msg_tx);

    // Bind, replacing any older connection for this identity
    match store.bind_connection(&identity, connection_id, outbox.clone()) {
        Ok(Some(previous)) => {
            debug!(identity = %identity, "Evicting previous connection");
            previous.evict();
        }
        Ok(None) => {}
        Err(e) => {
            warn!(addr = %addr, identity = %identity, error = %e, "Bind failed");
            return;
        }
    }

    // Spawn writer task
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    info!(
        addr = %addr,
        identity = %identity,
        room_id = %room_id,
        role = %role,
        "Signaling attached"
    );

    // Send welcome
    let peer = store.peer_of(&identity);
    let _ = outbox
        .send(Message::Welcome {
            room_id: room_id.clone(),
            role,
            peer_connected: peer.is_some(),
        })
        .await;
    // Announce to peer
    if let Some(peer) = peer {
        if peer
            .handle
            .send(Message::UserJoined {
                identity: identity.clone(),
            })
            .await
            .is_err()
        {
            debug!(peer = %peer.identity, "Peer outbox closed");
        }
    }

    loop {
        tokio::select! {
            biased;

            _ = outbox.evicted() => {
                info!(identity = %identity, "Replaced by a newer connection");
                break;
            }
            result = read_frame(&mut reader) => match result {
                Ok(msg) => handle_signal(msg, &identity, store.as_ref(), &outbox).await,
                Err(Error::ConnectionClosed) => {
                    debug!(identity = %identity, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Read error");
                    break;
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    // Cleanup
    writer_handle.abort();
    if !store.unbind_connection(&identity, connection_id) {
        debug!(identity = %identity, "Binding already replaced by a newer connection");
    }

    info!(identity = %identity, room_id = %room_id, "Signaling detached");
}

/// Writer task - sends queued messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Handle one frame from a signaling connection
async fn handle_signal<S>(msg: Message, identity: &IdentityId, store: &S, own: &Outbox)
where
    S: SessionStore<Handle = Outbox> + ?Sized,
{
    if msg.is_relayed() {
        let kind = msg.kind();
        match store.peer_of(identity) {
            Some(peer) => {
                if peer.handle.send(msg).await.is_err() {
                    debug!(identity = %identity, kind, "Peer outbox closed, dropped");
                }
            }
            None => debug!(identity = %identity, kind, "No peer connected, dropped"),
        }
        return;
    }

    match msg {
        Message::Ping => {
            let _ = own.send(Message::Pong).await;
        }
        Message::Pong => {}
        other => debug!(identity = %identity, kind = other.kind(), "Ignoring unexpected message"),
    }
}
