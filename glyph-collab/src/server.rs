//! WebSocket sync server: one task per connection, one room per connection.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── RoomRelay ── Room ── ReplicatedDocument
//!            ├── connection task ──────┤                 │
//! Client B ──┘   (select loop)         │                 ├── ReplayJournal ── JournalStore
//!                                      │                 └── broadcast ──► every member
//!                                      └── SignalingRelay ── per-peer mpsc endpoint
//! ```
//!
//! Each connection task multiplexes four sources: frames from the socket,
//! room events, signaling messages addressed to the peer, and an idle
//! timer. A peer silent for two heartbeat intervals is dropped, which
//! releases its room membership and closes its calls.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::document::Bootstrap;
use crate::operation::ConnectionId;
use crate::protocol::{ClientMessage, RejectCode, ServerMessage, WireBootstrap};
use crate::room::{PeerInfo, RelayConfig, RoomEvent, RoomId, RoomRelay, Submitted};
use crate::signaling::{SignalMessage, SignalingConfig, SignalingRelay};
use crate::storage::{JournalStore, MemoryJournalStore, RocksJournalStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Journal storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub relay: RelayConfig,
    pub signaling: SignalingConfig,
    /// Expected client ping interval; silence for twice this long disconnects
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            relay: RelayConfig::default(),
            signaling: SignalingConfig::default(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory journals, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            relay: RelayConfig::for_testing(),
            signaling: SignalingConfig::for_testing(),
            heartbeat_interval_secs: 5,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub resyncs: u64,
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct Shared {
    relay: Arc<RoomRelay>,
    signaling: Arc<SignalingRelay>,
    stats: Arc<RwLock<ServerStats>>,
    idle_timeout: Duration,
    next_connection: Arc<AtomicU64>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    /// Create a server, opening the RocksDB journal store when a storage
    /// path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn JournalStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksJournalStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryJournalStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn JournalStore>) -> Self {
        let relay = Arc::new(RoomRelay::new(store, config.relay.clone()));
        let signaling = Arc::new(SignalingRelay::new(config.signaling.clone()));
        let idle_timeout = Duration::from_secs(config.heartbeat_interval_secs.max(1) * 2);
        Self {
            config,
            shared: Shared {
                relay,
                signaling,
                stats: Arc::new(RwLock::new(ServerStats::default())),
                idle_timeout,
                next_connection: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn relay(&self) -> &Arc<RoomRelay> {
        &self.shared.relay
    }

    pub fn signaling(&self) -> &Arc<SignalingRelay> {
        &self.shared.signaling
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Per-connection protocol state.
#[derive(Default)]
struct Session {
    /// Membership and signaling endpoint are released only for this id
    connection: ConnectionId,
    peer: Option<PeerInfo>,
    room: Option<RoomId>,
    events: Option<broadcast::Receiver<Arc<RoomEvent>>>,
    signals: Option<mpsc::Receiver<SignalMessage>>,
    /// Last journal sequence delivered to the peer
    last_sequence: u64,
}

impl Session {
    fn leave_room(&mut self) -> Option<RoomId> {
        self.events = None;
        self.last_sequence = 0;
        self.room.take()
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut session = Session {
        connection: shared.next_connection.fetch_add(1, Ordering::Relaxed),
        ..Session::default()
    };
    let idle = tokio::time::sleep(shared.idle_timeout);
    tokio::pin!(idle);

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    idle.as_mut().reset(Instant::now() + shared.idle_timeout);
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match ClientMessage::decode(&data) {
                                Ok(msg) => handle_client_message(msg, &mut session, &shared, &mut ws_sender).await?,
                                Err(e) => {
                                    log::warn!("Malformed frame from {addr}: {e}");
                                    reject(&shared, &mut ws_sender, RejectCode::Malformed, e.to_string()).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed by {addr}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                event = next_event(&mut session.events) => {
                    handle_room_event(event, &mut session, &shared, &mut ws_sender).await?;
                }
                signal = next_signal(&mut session.signals) => {
                    match signal {
                        Some(msg) => send(&mut ws_sender, &ServerMessage::Signal(msg)).await?,
                        None => session.signals = None,
                    }
                }
                _ = &mut idle => {
                    log::warn!("Peer at {addr} missed heartbeats; disconnecting");
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    // Release membership whether the loop ended cleanly or not. A peer that
    // reconnected meanwhile owns both under its new connection.
    if let Some(peer_id) = session.peer.as_ref().map(|p| p.peer_id) {
        let connection = session.connection;
        if let Some(room_id) = session.leave_room() {
            if let Err(e) = shared.relay.leave_on(&room_id, peer_id, Some(connection)).await {
                log::debug!("Leave on disconnect failed: {e}");
            }
        }
        shared.signaling.disconnect(peer_id, connection).await;
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

async fn handle_client_message(
    msg: ClientMessage,
    session: &mut Session,
    shared: &Shared,
    sink: &mut WsSink,
) -> Result<(), BoxError> {
    if let ClientMessage::Ping = msg {
        return send(sink, &ServerMessage::Pong).await;
    }

    if let ClientMessage::Hello { peer } = &msg {
        if session.peer.is_some() {
            return reject(shared, sink, RejectCode::Malformed, "already identified").await;
        }
        session.signals = Some(shared.signaling.connect(peer.peer_id, session.connection).await);
        session.peer = Some(peer.clone());
        log::info!("Peer {} identified as '{}'", peer.peer_id, peer.name);
        return send(sink, &ServerMessage::Welcome { peer_id: peer.peer_id }).await;
    }
    let Some(peer) = session.peer.clone() else {
        return reject(shared, sink, RejectCode::NotIdentified, "send Hello first").await;
    };

    match msg {
        ClientMessage::Join {
            room_id,
            last_known_sequence,
        } => {
            if let Some(current) = &session.room {
                let message = format!("already in room '{current}'");
                return reject(shared, sink, RejectCode::AlreadyJoined, message).await;
            }
            match shared
                .relay
                .join_on(&room_id, peer, Some(session.connection), last_known_sequence)
                .await
            {
                Ok(membership) => {
                    session.last_sequence = membership.bootstrap.sequence();
                    session.events = Some(membership.events);
                    session.room = Some(room_id.clone());
                    let bootstrap = WireBootstrap::from_bootstrap(&membership.bootstrap)?;
                    send(
                        sink,
                        &ServerMessage::Bootstrap {
                            room_id,
                            bootstrap,
                            members: membership.members,
                        },
                    )
                    .await
                }
                Err(e) => reject(shared, sink, RejectCode::from(&e), e.to_string()).await,
            }
        }
        ClientMessage::Submit { operation } => {
            let Some(room_id) = session.room.clone() else {
                return reject(shared, sink, RejectCode::NotJoined, "join a room first").await;
            };
            let op = match operation.into_operation() {
                Ok(op) => op,
                Err(e) => return reject(shared, sink, RejectCode::Malformed, e.to_string()).await,
            };
            if op.origin != peer.peer_id {
                return reject(shared, sink, RejectCode::OriginMismatch, "origin must be the sender").await;
            }
            match shared.relay.submit(&room_id, op).await {
                // The committed record reaches this peer through the room channel
                Ok(Submitted::Committed(_)) | Ok(Submitted::Duplicate) => Ok(()),
                Err(e) => reject(shared, sink, RejectCode::from(&e), e.to_string()).await,
            }
        }
        ClientMessage::Leave => {
            let Some(room_id) = session.leave_room() else {
                return reject(shared, sink, RejectCode::NotJoined, "not in a room").await;
            };
            if let Err(e) = shared
                .relay
                .leave_on(&room_id, peer.peer_id, Some(session.connection))
                .await
            {
                log::debug!("Leave of '{room_id}' failed: {e}");
            }
            Ok(())
        }
        ClientMessage::Signal(signal) => {
            // The relay trusts `from`; pin it to the authenticated peer
            let signal = SignalMessage {
                from: peer.peer_id,
                ..signal
            };
            match shared.signaling.relay(signal).await {
                Ok(outcome) => {
                    log::debug!("Signal from {}: {outcome:?}", peer.peer_id);
                    Ok(())
                }
                Err(e) => reject(shared, sink, RejectCode::from(&e), e.to_string()).await,
            }
        }
        ClientMessage::Hello { .. } | ClientMessage::Ping => Ok(()),
    }
}

async fn handle_room_event(
    event: Result<Arc<RoomEvent>, RecvError>,
    session: &mut Session,
    shared: &Shared,
    sink: &mut WsSink,
) -> Result<(), BoxError> {
    let (Some(room_id), Some(me)) = (session.room.clone(), session.peer.as_ref().map(|p| p.peer_id)) else {
        return Ok(());
    };

    match event {
        Ok(event) => match event.as_ref() {
            RoomEvent::Update(record) => {
                // Already covered by a resync
                if record.sequence <= session.last_sequence {
                    return Ok(());
                }
                session.last_sequence = record.sequence;
                send(
                    sink,
                    &ServerMessage::Update {
                        room_id,
                        record: record.clone(),
                    },
                )
                .await
            }
            RoomEvent::PeerJoined(info) if info.peer_id != me => {
                send(sink, &ServerMessage::PeerJoined { room_id, peer: info.clone() }).await
            }
            RoomEvent::PeerLeft(peer_id) if *peer_id != me => {
                send(sink, &ServerMessage::PeerLeft { room_id, peer_id: *peer_id }).await
            }
            _ => Ok(()),
        },
        Err(RecvError::Lagged(skipped)) => {
            log::warn!("Peer {me} lagged {skipped} events in '{room_id}'; resyncing from {}", session.last_sequence);
            shared.stats.write().await.resyncs += 1;
            resync(&room_id, session, shared, sink).await
        }
        Err(RecvError::Closed) => {
            session.events = None;
            Ok(())
        }
    }
}

/// Catch a lagging peer up from its last delivered sequence.
async fn resync(room_id: &str, session: &mut Session, shared: &Shared, sink: &mut WsSink) -> Result<(), BoxError> {
    let bootstrap = match shared.relay.bootstrap(room_id, session.last_sequence).await {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            log::error!("Resync of '{room_id}' failed: {e}");
            return Ok(());
        }
    };

    match &bootstrap {
        Bootstrap::Diff { records, .. } => {
            for record in records {
                send(
                    sink,
                    &ServerMessage::Update {
                        room_id: room_id.to_string(),
                        record: record.clone(),
                    },
                )
                .await?;
            }
        }
        Bootstrap::Snapshot { .. } => {
            send(
                sink,
                &ServerMessage::Bootstrap {
                    room_id: room_id.to_string(),
                    bootstrap: WireBootstrap::from_bootstrap(&bootstrap)?,
                    members: Vec::new(),
                },
            )
            .await?;
        }
    }
    session.last_sequence = bootstrap.sequence();
    Ok(())
}

async fn next_event(rx: &mut Option<broadcast::Receiver<Arc<RoomEvent>>>) -> Result<Arc<RoomEvent>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_signal(rx: &mut Option<mpsc::Receiver<SignalMessage>>) -> Option<SignalMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let bytes = msg.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn reject(
    shared: &Shared,
    sink: &mut WsSink,
    code: RejectCode,
    message: impl Into<String>,
) -> Result<(), BoxError> {
    shared.stats.write().await.rejected_messages += 1;
    send(sink, &ServerMessage::rejected(code, message)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.relay.max_members_per_room, 100);
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.relay().room_count().await, 0);
        assert_eq!(server.signaling().active_calls().await, 0);
        assert_eq!(server.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("journal")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.relay().room_count().await, 0);
    }

    #[test]
    fn test_config_for_testing() {
        let config = ServerConfig::for_testing();
        assert!(config.storage_path.is_none());
        assert!(config.relay.broadcast_capacity < RelayConfig::default().broadcast_capacity);
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.shared.idle_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_idle_timeout_is_twice_heartbeat() {
        let config = ServerConfig {
            heartbeat_interval_secs: 15,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.shared.idle_timeout, Duration::from_secs(30));
    }
}
