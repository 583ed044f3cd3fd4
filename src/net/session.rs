//! Peer-to-peer network session.
//!
//! Every node binds a TCP listener (reliable, ordered channel for inputs and
//! control messages) and a UDP socket (unreliable channel for snapshots). A
//! host advertises by accepting connections; a joiner browses by consuming
//! "peer found" addresses and dialing them. Each connection runs its own
//! reader and writer task, so a stalled or vanished peer only affects itself.
//!
//! Inbound traffic is surfaced as [`SessionEvent`]s on an mpsc channel that the
//! application drains into its input queue and replication buffers; the
//! simulation tick never waits on network I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ecs::EntityId;
use crate::util::rate_limit::PeerRateLimiter;

use super::frame::{read_frame_from, write_frame_to, Frame, FrameError, HEADER_LEN, MAX_FRAME_LEN};
use super::protocol::{GameStateSnapshot, Hello, HitReport, PlayerInput, ProtocolError, Welcome, WireMessage};

pub type PeerId = Uuid;

/// Frames queued per peer before sends start being dropped
const OUTBOUND_QUEUE: usize = 256;
/// Inbound events buffered for the application
const EVENT_QUEUE: usize = 1024;
/// Connect + Hello/Welcome exchange must finish within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time given to writer tasks to flush `Goodbye` on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Per-peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session-wide discovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Bound, not yet advertising or browsing
    Idle,
    /// Host role: accepting connections
    Advertising,
    /// Join role: dialing peers as they are found
    Browsing,
    Closed,
}

/// What this node presents to its peers
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    pub player_entity: EntityId,
    pub display_name: String,
    pub room_id: String,
}

/// Bind addresses and limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub max_peers: usize,
}

/// Inbound traffic and lifecycle changes, in arrival order per peer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected {
        peer_id: PeerId,
        player_entity: EntityId,
        display_name: String,
    },
    PeerDisconnected {
        peer_id: PeerId,
        player_entity: EntityId,
    },
    Input {
        peer_id: PeerId,
        player_entity: EntityId,
        input: PlayerInput,
    },
    Snapshot {
        peer_id: PeerId,
        snapshot: GameStateSnapshot,
    },
    /// A peer registered a hit against an avatar this node owns
    Hit {
        peer_id: PeerId,
        hit: HitReport,
    },
}

/// Decision on an incoming connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invitation {
    Accept,
    Refuse(String),
}

/// Policy applied to incoming `Hello`s
pub trait InvitationHandler: Send + Sync {
    fn decide(&self, hello: &Hello, connected_peers: usize) -> Invitation;
}

/// Accepts every invitation for the right room while there is capacity.
///
/// There is no allow-list or user confirmation step.
#[derive(Debug, Clone)]
pub struct AutoAccept {
    pub room_id: String,
    pub max_peers: usize,
}

impl InvitationHandler for AutoAccept {
    fn decide(&self, hello: &Hello, connected_peers: usize) -> Invitation {
        if hello.room_id != self.room_id {
            return Invitation::Refuse(format!("room mismatch: expected {}", self.room_id));
        }
        if connected_peers >= self.max_peers {
            return Invitation::Refuse("session full".to_string());
        }
        Invitation::Accept
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },

    #[error("connection refused by peer: {0}")]
    Refused(String),

    #[error("peer {0} is not connected")]
    PeerGone(PeerId),

    #[error("session already started")]
    AlreadyStarted,

    #[error("session is closed")]
    Closed,

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a connected peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub player_entity: EntityId,
    pub display_name: String,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
}

struct PeerConnection {
    info: PeerInfo,
    state: ConnectionState,
    /// Distinguishes reconnections of the same peer
    conn_id: u64,
    outbound: Option<mpsc::Sender<Bytes>>,
    connected_at: DateTime<Utc>,
}

/// Peer as reported by [`NetworkSession::peers`]
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    #[serde(flatten)]
    pub info: PeerInfo,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// Session as reported by [`NetworkSession::summary`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub peer_id: PeerId,
    pub room_id: String,
    pub state: SessionState,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub connected_peers: usize,
    pub dialing: Vec<SocketAddr>,
    pub peers: Vec<PeerSummary>,
}

/// A running peer-to-peer session
pub struct NetworkSession {
    identity: LocalIdentity,
    state: RwLock<SessionState>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    udp: Arc<UdpSocket>,
    peers: DashMap<PeerId, PeerConnection>,
    /// Datagram source address -> peer
    udp_peers: DashMap<SocketAddr, PeerId>,
    /// Addresses with a dial in flight
    dialing: DashSet<SocketAddr>,
    invitations: Arc<dyn InvitationHandler>,
    events: mpsc::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
}

impl NetworkSession {
    /// Bind both channels with the default auto-accept policy
    pub async fn bind(
        config: SessionConfig,
        identity: LocalIdentity,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>), SessionError> {
        let policy = AutoAccept {
            room_id: identity.room_id.clone(),
            max_peers: config.max_peers,
        };
        Self::bind_with_policy(config, identity, Arc::new(policy)).await
    }

    pub async fn bind_with_policy(
        config: SessionConfig,
        identity: LocalIdentity,
        invitations: Arc<dyn InvitationHandler>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>), SessionError> {
        let listener = TcpListener::bind(config.tcp_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: config.tcp_addr,
                source,
            })?;
        let udp = UdpSocket::bind(config.udp_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: config.udp_addr,
                source,
            })?;

        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            identity,
            state: RwLock::new(SessionState::Idle),
            tcp_addr,
            udp_addr,
            listener: Mutex::new(Some(listener)),
            udp: Arc::new(udp),
            peers: DashMap::new(),
            udp_peers: DashMap::new(),
            dialing: DashSet::new(),
            invitations,
            events,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
        });

        let udp_task = tokio::spawn(session.clone().udp_loop());
        session.track(udp_task);

        info!(
            peer_id = %session.identity.peer_id,
            tcp = %tcp_addr,
            udp = %udp_addr,
            room = %session.identity.room_id,
            "Network session bound"
        );
        Ok((session, events_rx))
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Host role: start accepting connections
    pub fn start_advertising(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let listener = self.listener.lock().take().ok_or(SessionError::AlreadyStarted)?;
        *self.state.write() = SessionState::Advertising;

        let task = tokio::spawn(self.clone().accept_loop(listener));
        self.track(task);
        info!(peer_id = %self.identity.peer_id, addr = %self.tcp_addr, "Advertising session");
        Ok(())
    }

    /// Join role: dial every address that arrives on `found`
    pub fn start_browsing(self: &Arc<Self>, found: mpsc::Receiver<SocketAddr>) -> Result<(), SessionError> {
        self.ensure_open()?;
        {
            let mut state = self.state.write();
            if *state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            *state = SessionState::Browsing;
        }

        let task = tokio::spawn(self.clone().browse_loop(found));
        self.track(task);
        info!(peer_id = %self.identity.peer_id, "Browsing for peers");
        Ok(())
    }

    /// Dial a peer and complete the handshake
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, SessionError> {
        self.ensure_open()?;
        if !self.dialing.insert(addr) {
            return Err(SessionError::Handshake {
                addr,
                reason: "dial already in progress".to_string(),
            });
        }
        let result = self.dial(addr).await;
        self.dialing.remove(&addr);
        result
    }

    /// State of one peer's connection, `None` if never seen
    pub fn peer_state(&self, peer_id: PeerId) -> Option<ConnectionState> {
        self.peers.get(&peer_id).map(|p| p.state)
    }

    /// State of the connection to a dialed address
    pub fn addr_state(&self, addr: SocketAddr) -> ConnectionState {
        if self.dialing.contains(&addr) {
            return ConnectionState::Connecting;
        }
        self.peers
            .iter()
            .find(|p| p.info.tcp_addr == addr)
            .map(|p| p.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .map(|p| PeerSummary {
                info: p.info.clone(),
                state: p.state,
                connected_at: p.connected_at,
            })
            .collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            peer_id: self.identity.peer_id,
            room_id: self.identity.room_id.clone(),
            state: self.state(),
            tcp_addr: self.tcp_addr,
            udp_addr: self.udp_addr,
            connected_peers: self.connected_count(),
            dialing: self.dialing.iter().map(|a| *a).collect(),
            peers: self.peers(),
        }
    }

    /// Queue a message on one peer's reliable channel
    pub fn send_reliable(&self, peer_id: PeerId, msg: &WireMessage) -> Result<(), SessionError> {
        let bytes = msg.encode()?;
        let peer = self.peers.get(&peer_id).ok_or(SessionError::PeerGone(peer_id))?;
        let outbound = peer.outbound.as_ref().ok_or(SessionError::PeerGone(peer_id))?;
        outbound.try_send(bytes).map_err(|_| SessionError::PeerGone(peer_id))
    }

    /// Queue a message on every connected peer's reliable channel.
    /// Unreachable or backed-up peers are skipped; returns how many were queued.
    pub fn broadcast_reliable(&self, msg: &WireMessage) -> Result<usize, SessionError> {
        let bytes = msg.encode()?;
        let mut sent = 0;
        for peer in self.peers.iter() {
            let Some(outbound) = peer.outbound.as_ref().filter(|_| peer.state == ConnectionState::Connected) else {
                continue;
            };
            match outbound.try_send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer_id = %peer.info.peer_id, "Reliable queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(peer_id = %peer.info.peer_id, "Reliable channel closed, skipping");
                }
            }
        }
        Ok(sent)
    }

    /// Send a datagram to every connected peer. Loss is acceptable; failures
    /// are logged and skipped. Returns how many datagrams were sent.
    pub async fn broadcast_unreliable(&self, msg: &WireMessage) -> Result<usize, SessionError> {
        let bytes = msg.encode()?;
        let targets: Vec<(PeerId, SocketAddr)> = self
            .peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| (p.info.peer_id, p.info.udp_addr))
            .collect();

        let mut sent = 0;
        for (peer_id, addr) in targets {
            match self.udp.send_to(&bytes, addr).await {
                Ok(_) => sent += 1,
                Err(e) => debug!(peer_id = %peer_id, error = %e, "Datagram send failed"),
            }
        }
        Ok(sent)
    }

    /// Close one peer's connection. The rest of the session is unaffected.
    pub async fn disconnect_peer(&self, peer_id: PeerId) -> Result<(), SessionError> {
        let goodbye = WireMessage::Goodbye.encode()?;
        let player_entity = {
            let mut peer = self.peers.get_mut(&peer_id).ok_or(SessionError::PeerGone(peer_id))?;
            if peer.state == ConnectionState::Disconnected {
                return Ok(());
            }
            if let Some(outbound) = peer.outbound.take() {
                let _ = outbound.try_send(goodbye);
            }
            peer.state = ConnectionState::Disconnected;
            self.udp_peers.remove(&peer.info.udp_addr);
            peer.info.player_entity
        };

        info!(peer_id = %peer_id, "Peer disconnected locally");
        self.emit(SessionEvent::PeerDisconnected { peer_id, player_entity }).await;
        Ok(())
    }

    /// Stop advertising/browsing and close every peer connection.
    /// Queued sends that have not been flushed within a short grace period are
    /// dropped.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.listener.lock().take();

        let goodbye = WireMessage::Goodbye.encode().ok();
        for mut peer in self.peers.iter_mut() {
            if let Some(outbound) = peer.outbound.take() {
                if let Some(bytes) = goodbye.clone() {
                    let _ = outbound.try_send(bytes);
                }
            }
            peer.state = ConnectionState::Disconnected;
        }
        self.udp_peers.clear();
        self.shutdown_tx.send_replace(true);

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let _ = timeout(SHUTDOWN_GRACE, futures::future::join_all(handles.iter_mut())).await;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                let _ = handle.await;
            }
        }

        info!(peer_id = %self.identity.peer_id, "Network session closed");
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }

    fn hello(&self) -> Hello {
        Hello {
            peer_id: self.identity.peer_id,
            player_entity: self.identity.player_entity,
            display_name: self.identity.display_name.clone(),
            room_id: self.identity.room_id.clone(),
            udp_port: self.udp_addr.port(),
        }
    }

    fn welcome(&self) -> Welcome {
        Welcome {
            peer_id: self.identity.peer_id,
            player_entity: self.identity.player_entity,
            display_name: self.identity.display_name.clone(),
            udp_port: self.udp_addr.port(),
        }
    }

    async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, SessionError> {
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Handshake {
                addr,
                reason: "connect timed out".to_string(),
            })?
            .map_err(|source| SessionError::Connect { addr, source })?;
        stream.set_nodelay(true)?;

        write_frame_to(&mut stream, &WireMessage::Hello(self.hello()).encode()?).await?;

        match read_control(&mut stream, addr).await? {
            WireMessage::Welcome(welcome) => {
                if welcome.peer_id == self.identity.peer_id {
                    return Err(SessionError::Handshake {
                        addr,
                        reason: "connected to self".to_string(),
                    });
                }
                let info = PeerInfo {
                    peer_id: welcome.peer_id,
                    player_entity: welcome.player_entity,
                    display_name: welcome.display_name,
                    tcp_addr: addr,
                    udp_addr: SocketAddr::new(addr.ip(), welcome.udp_port),
                };
                let peer_id = info.peer_id;
                self.register_peer(stream, info).await?;
                Ok(peer_id)
            }
            WireMessage::Refused { reason } => Err(SessionError::Refused(reason)),
            other => Err(SessionError::Handshake {
                addr,
                reason: format!("unexpected {:?} during handshake", other.kind()),
            }),
        }
    }

    async fn accept_peer(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<PeerId, SessionError> {
        stream.set_nodelay(true)?;
        let hello = match read_control(&mut stream, addr).await? {
            WireMessage::Hello(hello) => hello,
            other => {
                return Err(SessionError::Handshake {
                    addr,
                    reason: format!("expected hello, got {:?}", other.kind()),
                })
            }
        };

        let decision = if hello.peer_id == self.identity.peer_id {
            Invitation::Refuse("cannot connect to self".to_string())
        } else if self.peer_state(hello.peer_id) == Some(ConnectionState::Connected) {
            Invitation::Refuse("peer already connected".to_string())
        } else {
            self.invitations.decide(&hello, self.connected_count())
        };

        if let Invitation::Refuse(reason) = decision {
            let refused = WireMessage::Refused { reason: reason.clone() }.encode()?;
            let _ = write_frame_to(&mut stream, &refused).await;
            return Err(SessionError::Refused(reason));
        }

        write_frame_to(&mut stream, &WireMessage::Welcome(self.welcome()).encode()?).await?;

        let info = PeerInfo {
            peer_id: hello.peer_id,
            player_entity: hello.player_entity,
            display_name: hello.display_name,
            tcp_addr: addr,
            udp_addr: SocketAddr::new(addr.ip(), hello.udp_port),
        };
        let peer_id = info.peer_id;
        self.register_peer(stream, info).await?;
        Ok(peer_id)
    }

    async fn register_peer(self: &Arc<Self>, stream: TcpStream, info: PeerInfo) -> Result<(), SessionError> {
        self.ensure_open()?;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer_id = info.peer_id;

        let previous = self.peers.insert(
            peer_id,
            PeerConnection {
                info: info.clone(),
                state: ConnectionState::Connected,
                conn_id,
                outbound: Some(outbound),
                connected_at: Utc::now(),
            },
        );
        if let Some(previous) = previous {
            self.udp_peers.remove(&previous.info.udp_addr);
        }
        self.udp_peers.insert(info.udp_addr, peer_id);

        let writer_task = tokio::spawn(write_loop(peer_id, writer, outbound_rx));
        let reader_task = tokio::spawn(self.clone().read_loop(peer_id, conn_id, info.player_entity, reader));
        self.track(writer_task);
        self.track(reader_task);

        info!(
            peer_id = %peer_id,
            display_name = %info.display_name,
            tcp = %info.tcp_addr,
            udp = %info.udp_addr,
            "Peer connected"
        );
        self.emit(SessionEvent::PeerConnected {
            peer_id,
            player_entity: info.player_entity,
            display_name: info.display_name,
        })
        .await;
        Ok(())
    }

    async fn mark_disconnected(&self, peer_id: PeerId, conn_id: u64) {
        let player_entity = {
            let Some(mut peer) = self.peers.get_mut(&peer_id) else {
                return;
            };
            if peer.conn_id != conn_id || peer.state == ConnectionState::Disconnected {
                return;
            }
            peer.state = ConnectionState::Disconnected;
            peer.outbound = None;
            self.udp_peers.remove(&peer.info.udp_addr);
            peer.info.player_entity
        };

        info!(peer_id = %peer_id, "Peer disconnected");
        if !self.is_closed() {
            self.emit(SessionEvent::PeerDisconnected { peer_id, player_entity }).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, "Incoming connection");
                    let session = self.clone();
                    let task = tokio::spawn(async move {
                        if let Err(e) = session.accept_peer(stream, addr).await {
                            warn!(addr = %addr, error = %e, "Rejected incoming peer");
                        }
                    });
                    self.track(task);
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
        debug!("Accept loop stopped");
    }

    async fn browse_loop(self: Arc<Self>, mut found: mpsc::Receiver<SocketAddr>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let addr = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                addr = found.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };
            match self.connect(addr).await {
                Ok(peer_id) => debug!(peer_id = %peer_id, addr = %addr, "Joined peer"),
                Err(e) => warn!(addr = %addr, error = %e, "Failed to join peer"),
            }
        }
        debug!("Browse loop stopped");
    }

    async fn read_loop(self: Arc<Self>, peer_id: PeerId, conn_id: u64, player_entity: EntityId, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let limiter = PeerRateLimiter::new();

        loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                frame = read_frame_from(&mut reader) => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if !self.dispatch_reliable(peer_id, player_entity, &limiter, frame).await {
                        debug!(peer_id = %peer_id, "Peer said goodbye");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer_id = %peer_id, "Peer closed stream");
                    break;
                }
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Reliable channel failed");
                    break;
                }
            }
        }

        self.mark_disconnected(peer_id, conn_id).await;
    }

    /// Handle one reliable frame; false ends the connection
    async fn dispatch_reliable(&self, peer_id: PeerId, player_entity: EntityId, limiter: &PeerRateLimiter, frame: Frame) -> bool {
        let msg = match WireMessage::from_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer_id = %peer_id, tag = frame.tag, error = %e, "Dropping undecodable message");
                return true;
            }
        };

        let allowed = match &msg {
            WireMessage::Input(_) => limiter.check_input(),
            WireMessage::Goodbye => true,
            _ => limiter.check_message(),
        };
        if !allowed {
            match &msg {
                WireMessage::Input(input) => {
                    warn!(peer_id = %peer_id, sequence = input.sequence, "Rate limited peer input dropped")
                }
                other => warn!(peer_id = %peer_id, kind = ?other.kind(), "Rate limited peer message"),
            }
            return true;
        }

        match msg {
            WireMessage::Input(input) => {
                self.emit(SessionEvent::Input {
                    peer_id,
                    player_entity,
                    input,
                })
                .await;
            }
            WireMessage::Snapshot(snapshot) => {
                self.emit(SessionEvent::Snapshot { peer_id, snapshot }).await;
            }
            WireMessage::Hit(hit) => {
                self.emit(SessionEvent::Hit { peer_id, hit }).await;
            }
            WireMessage::Goodbye => return false,
            other => {
                debug!(peer_id = %peer_id, kind = ?other.kind(), "Ignoring control message on open connection");
            }
        }
        true
    }

    async fn udp_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; HEADER_LEN + MAX_FRAME_LEN];

        loop {
            let received = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                received = self.udp.recv_from(&mut buf) => received,
            };
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    // Platform-specific ICMP errors surface here; keep receiving
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            };

            let Some(peer_id) = self.udp_peers.get(&from).map(|p| *p) else {
                debug!(from = %from, "Datagram from unknown source");
                continue;
            };

            match WireMessage::decode(&buf[..len]) {
                Ok(WireMessage::Snapshot(snapshot)) => {
                    self.emit(SessionEvent::Snapshot { peer_id, snapshot }).await;
                }
                Ok(other) => debug!(peer_id = %peer_id, kind = ?other.kind(), "Unexpected datagram"),
                Err(e) => debug!(peer_id = %peer_id, error = %e, "Dropping undecodable datagram"),
            }
        }
        debug!("Datagram loop stopped");
    }
}

/// Read one control message during the handshake
async fn read_control(stream: &mut TcpStream, addr: SocketAddr) -> Result<WireMessage, SessionError> {
    let frame = timeout(HANDSHAKE_TIMEOUT, read_frame_from(stream))
        .await
        .map_err(|_| SessionError::Handshake {
            addr,
            reason: "timed out".to_string(),
        })??
        .ok_or_else(|| SessionError::Handshake {
            addr,
            reason: "connection closed".to_string(),
        })?;
    Ok(WireMessage::from_frame(&frame)?)
}

async fn write_loop(peer_id: PeerId, mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = write_frame_to(&mut writer, &bytes).await {
            debug!(peer_id = %peer_id, error = %e, "Reliable send failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(room: &str) -> Hello {
        Hello {
            peer_id: Uuid::new_v4(),
            player_entity: EntityId::new(),
            display_name: "tester".to_string(),
            room_id: room.to_string(),
            udp_port: 0,
        }
    }

    #[test]
    fn auto_accept_policy() {
        let policy = AutoAccept {
            room_id: "alpha".to_string(),
            max_peers: 2,
        };
        assert_eq!(policy.decide(&hello("alpha"), 0), Invitation::Accept);
        assert!(matches!(policy.decide(&hello("beta"), 0), Invitation::Refuse(_)));
        assert!(matches!(policy.decide(&hello("alpha"), 2), Invitation::Refuse(_)));
    }

    fn loopback_config() -> SessionConfig {
        SessionConfig {
            tcp_addr: "127.0.0.1:0".parse().expect("addr"),
            udp_addr: "127.0.0.1:0".parse().expect("addr"),
            max_peers: 8,
        }
    }

    fn identity(room: &str) -> LocalIdentity {
        LocalIdentity {
            peer_id: Uuid::new_v4(),
            player_entity: EntityId::new(),
            display_name: "node".to_string(),
            room_id: room.to_string(),
        }
    }

    #[tokio::test]
    async fn refuses_wrong_room() {
        let (host, _host_events) = NetworkSession::bind(loopback_config(), identity("alpha")).await.expect("bind host");
        host.start_advertising().expect("advertise");
        let (joiner, _join_events) = NetworkSession::bind(loopback_config(), identity("beta")).await.expect("bind joiner");

        let result = joiner.connect(host.local_tcp_addr()).await;
        assert!(matches!(result, Err(SessionError::Refused(_))), "{result:?}");
        assert_eq!(joiner.connected_count(), 0);

        joiner.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn closed_session_rejects_work() {
        let (session, _events) = NetworkSession::bind(loopback_config(), identity("alpha")).await.expect("bind");
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.start_advertising(), Err(SessionError::Closed)));
    }
}
