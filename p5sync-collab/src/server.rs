//! WebSocket sync server with room-based operation routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── OperationLog ── LogStore
//!            ├── CanvasHub ── Room (name)┤                   (memory / RocksDB)
//! Client B ──┘                          └── BroadcastGroup
//!                                               │
//!                                    ┌──────────┼───────────┐
//!                                    ▼          ▼           ▼
//!                                 Client A   Client B    Client C
//!                                 (skipped
//!                                  if author)
//! ```
//!
//! Each connection is one session with a server-assigned `SessionId`. A
//! session is subscribed to at most one room at a time: the room of its
//! latest `request_history`. Draws may target any room.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{PeerInfo, Received, SessionId, Subscription};
use crate::config::ServerConfig;
use crate::hub::{CanvasHub, DrawOutcome};
use crate::operation::{room_or_default, DEFAULT_ROOM};
use crate::protocol::{ClientMessage, HistoryRequest, ServerMessage};
use crate::storage::{open_store, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Draws dropped by validation
    pub rejected: u64,
    /// Requests answered with `nack`
    pub nacks: u64,
    pub active_rooms: usize,
}

/// Per-connection state.
struct Session {
    peer: PeerInfo,
    room: Option<String>,
    subscription: Option<Subscription>,
}

impl Session {
    fn id(&self) -> SessionId {
        self.peer.session_id
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<CanvasHub>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server, opening the configured store.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = open_store(&config.storage)?;
        let hub = CanvasHub::new(store, config.canvas, config.broadcast_capacity);
        Ok(Self::with_hub(config, Arc::new(hub)))
    }

    /// Create a server around an existing hub.
    pub fn with_hub(config: ServerConfig, hub: Arc<CanvasHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let hub = CanvasHub::in_memory(config.broadcast_capacity);
        Self::with_hub(config, Arc::new(hub))
    }

    /// Reactivate every room found in the store.
    pub async fn recover(&self) -> Result<usize, BoxError> {
        let recovered = self.hub.recover().await?;
        self.stats.write().await.active_rooms = self.hub.registry().room_count().await;
        Ok(recovered)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Recover, bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }

        let listener = self.bind().await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on `listener`, one task each.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CanvasHub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = Session {
            peer: PeerInfo::new(addr.to_string()),
            room: None,
            subscription: None,
        };
        let result = Self::pump(ws_stream, &hub, &stats, &mut session).await;

        // Cleanup runs whether the session ended cleanly or not
        if let Some(room) = session.room.take() {
            hub.leave(&session.id(), &room).await;
            log::debug!("Session {} left room {room}", session.id());
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = hub.registry().room_count().await;
        }
        log::info!("Connection closed from {addr}");

        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        hub: &CanvasHub,
        stats: &RwLock<ServerStats>,
        session: &mut Session,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            match ClientMessage::decode(text.as_str()) {
                                Ok(ClientMessage::Draw(wire)) => {
                                    let target = room_or_default(wire.room.clone());
                                    match hub.draw(session.id(), wire).await {
                                        Ok(DrawOutcome::Rejected(_)) => {
                                            stats.write().await.rejected += 1;
                                        }
                                        Ok(_) => {}
                                        Err(e) => {
                                            stats.write().await.nacks += 1;
                                            let room = e.room().unwrap_or(target.as_str());
                                            send(&mut ws_sender, &ServerMessage::nack(room, &e)).await?;
                                        }
                                    }
                                }

                                Ok(ClientMessage::RequestHistory(request)) => {
                                    Self::on_request_history(&mut ws_sender, hub, stats, session, request).await?;
                                }

                                Err(e) => {
                                    log::warn!("Dropped frame from session {}: {e}", session.id());
                                }
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            log::warn!(
                                "Ignoring {} byte binary frame from session {}",
                                data.len(),
                                session.id()
                            );
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from session {}: {e}", session.id());
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room delivery
                delivery = async {
                    if let Some(ref mut sub) = session.subscription {
                        sub.recv_or_lag().await
                    } else {
                        // Not in a room yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    match delivery {
                        Some(Received::Delivery(delivery)) => {
                            send(&mut ws_sender, &ServerMessage::draw(&delivery.operation)).await?;
                        }
                        Some(Received::Lagged(skipped)) => {
                            // Live stream has a gap: resend the whole room
                            log::info!("Resyncing session {} after {skipped} skipped operations", session.id());
                            let request = HistoryRequest { room: session.room.clone() };
                            Self::on_request_history(&mut ws_sender, hub, stats, session, request).await?;
                        }
                        None => {
                            log::warn!("Room channel closed under session {}", session.id());
                            session.subscription = None;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Answer `request_history`: (re)join the requested room with a fresh
    /// subscription and send its history. Repeating the request for the
    /// current room goes through the same path, so nothing arrives twice.
    async fn on_request_history(
        ws_sender: &mut WsSender,
        hub: &CanvasHub,
        stats: &RwLock<ServerStats>,
        session: &mut Session,
        request: HistoryRequest,
    ) -> Result<(), BoxError> {
        let target = room_or_default(request.room.clone());

        let previous = session.room.take();
        session.subscription = None;
        let result = match hub.rejoin(session.peer.clone(), previous.as_deref(), request).await {
            Ok(joined) => {
                session.room = Some(joined.room);
                session.subscription = Some(joined.subscription);
                stats.write().await.active_rooms = hub.registry().room_count().await;
                Ok(joined.history)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(history) => {
                log::debug!(
                    "Dispatching {} operations of room {target} to session {}",
                    history.len(),
                    session.id()
                );
                send(ws_sender, &ServerMessage::dispatch_history(&history)).await?;
            }
            Err(e) => {
                stats.write().await.nacks += 1;
                let room = e.room().unwrap_or(DEFAULT_ROOM);
                send(ws_sender, &ServerMessage::nack(room, &e)).await?;
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<CanvasHub> {
        &self.hub
    }
}

async fn send(ws_sender: &mut WsSender, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Text(encoded.into())).await?;
    Ok(())
}
