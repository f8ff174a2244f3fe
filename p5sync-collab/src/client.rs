//! WebSocket client for drawing sessions.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Sending draws and clears for the client's room
//! - History rehydration: `request_history` goes out on every (re)connect,
//!   since the live stream never replays what was missed while offline
//!
//! Operations authored under this client's id are filtered out of the
//! remote stream; the caller already applied them locally.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::operation::{CanvasBounds, Operation, Stroke, WireOperation};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Connection attempts made by [`CanvasClient::reconnect`].
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before the second attempt; doubles after each failure.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Operation drawn by another session
    Remote(Operation),
    /// Ordered room history, the canvas to rebuild from scratch
    History(Vec<Operation>),
    /// The server could not complete one of our requests
    Nack { room: String, reason: String },
}

/// A drawing session against one room.
pub struct CanvasClient {
    /// Server URL (`ws://host:port`)
    server_url: String,

    /// Room we draw in
    room: String,

    /// Author id stamped on every operation we send
    session_id: String,

    /// Coordinate range applied to operations we receive
    bounds: CanvasBounds,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    reader: Option<JoinHandle<()>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CanvasClient {
    pub fn new(
        server_url: impl Into<String>,
        room: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            room: room.into(),
            session_id: session_id.into(),
            bounds: CanvasBounds::default(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            reader: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_bounds(mut self, bounds: CanvasBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, then ask for the room's history.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.set_state(ConnectionState::Connecting).await;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: turn server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let own_id = self.session_id.clone();
        let bounds = self.bounds;
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            if let Some(event) = into_event(server_msg, &own_id, &bounds) {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => log::warn!("Dropped server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        }));

        self.set_state(ConnectionState::Connected).await;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        log::info!("Connected to {} as {} in room {}", self.server_url, self.session_id, self.room);

        self.request_history().await
    }

    /// Drop the current connection (if any) and connect again, retrying
    /// with exponential backoff. History is requested anew on success.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.shutdown();
        self.set_state(ConnectionState::Reconnecting).await;

        let mut delay = RECONNECT_BACKOFF;
        let mut last_error = ProtocolError::ConnectionClosed;
        for attempt in 1..=RECONNECT_ATTEMPTS {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Reconnect attempt {attempt}/{RECONNECT_ATTEMPTS} failed: {e}");
                    last_error = e;
                }
            }
            if attempt < RECONNECT_ATTEMPTS {
                self.set_state(ConnectionState::Reconnecting).await;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(last_error)
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        let was_connected = self.reader.is_some();
        self.shutdown();
        self.set_state(ConnectionState::Disconnected).await;
        if was_connected {
            let _ = self.event_tx.send(ClientEvent::Disconnected).await;
        }
    }

    /// Send a stroke in our room. Returns the operation as sent, for the
    /// caller to apply locally.
    pub async fn draw(&self, stroke: Stroke) -> Result<Operation, ProtocolError> {
        let op = Operation::new(self.session_id.clone(), self.room.clone(), stroke);
        self.send(ClientMessage::Draw(WireOperation::from(&op))).await?;
        Ok(op)
    }

    /// Clear the room for everyone.
    pub async fn clear(&self) -> Result<Operation, ProtocolError> {
        self.draw(Stroke::Clear).await
    }

    /// Ask for the room's ordered history (answered as [`ClientEvent::History`]).
    pub async fn request_history(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::request_history(Some(self.room.clone()))).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn shutdown(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket
        self.outgoing_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for CanvasClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn into_event(msg: ServerMessage, own_id: &str, bounds: &CanvasBounds) -> Option<ClientEvent> {
    match msg {
        ServerMessage::Draw(wire) if wire.id == own_id => None,
        ServerMessage::Draw(wire) => match wire.validate(bounds) {
            Ok(op) => Some(ClientEvent::Remote(op)),
            Err(e) => {
                log::warn!("Dropped remote operation: {e}");
                None
            }
        },
        ServerMessage::DispatchHistory(history) => {
            let ops = history
                .into_iter()
                .filter_map(|wire| restore(wire, bounds))
                .collect();
            Some(ClientEvent::History(ops))
        }
        ServerMessage::Nack { room, reason } => Some(ClientEvent::Nack { room, reason }),
    }
}

/// Validate a history entry, keeping its server-assigned timestamp.
fn restore(wire: WireOperation, bounds: &CanvasBounds) -> Option<Operation> {
    let timestamp = wire.timestamp;
    match wire.validate(bounds) {
        Ok(mut op) => {
            op.timestamp = timestamp;
            Some(op)
        }
        Err(e) => {
            log::warn!("Dropped history entry: {e}");
            None
        }
    }
}
