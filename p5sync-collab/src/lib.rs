//! # p5sync-collab — Room-scoped drawing sync
//!
//! Accepts drawing operations from connected sessions, fans each one out to
//! the other sessions of its room, and rebuilds a room's canvas for anyone
//! joining or reconnecting.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌─────────────┐
//! │ CanvasClient │ ◄──────────────────► │ SyncServer  │
//! │ (per user)   │  draw / history      │ (central)   │
//! └──────────────┘                      └──────┬──────┘
//!                                              │
//!                                       ┌──────┴──────┐
//!                                       │ CanvasHub   │ validate, route
//!                                       └──────┬──────┘
//!                                              │ RoomRegistry
//!                                ┌─────────────┴─────────────┐
//!                                ▼                           ▼
//!                        ┌───────────────┐          ┌────────────────┐
//!                        │ OperationLog  │ durable  │ BroadcastGroup │
//!                        │ (LogStore)    │ ───────► │ (fan-out)      │
//!                        └───────────────┘  then    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Operation model, wire form and validation
//! - [`clock`] — Monotonic timestamp source
//! - [`storage`] — `LogStore` engines (memory, RocksDB)
//! - [`oplog`] — Per-room ordered log with clear semantics
//! - [`broadcast`] — Per-room fan-out with author filtering
//! - [`room`] — Rooms and the get-or-create registry
//! - [`history`] — Ordered snapshots for joining sessions
//! - [`hub`] — Ingress: draw, request_history, join, leave
//! - [`protocol`] — JSON event frames
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket client with reconnect
//! - [`config`] — Environment-driven server configuration

pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod history;
pub mod hub;
pub mod operation;
pub mod oplog;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{
    BroadcastGroup, BroadcastStats, Delivery, PeerInfo, Received, SessionId, Subscription,
};
pub use client::{CanvasClient, ClientEvent, ConnectionState};
pub use clock::MonotonicClock;
pub use config::{ConfigError, ServerConfig};
pub use history::{HistoryService, Joined};
pub use hub::{CanvasHub, DrawOutcome, HubError};
pub use operation::{
    CanvasBounds, Erase, Mode, Operation, Point, Segment, Stroke, ValidationError,
    WireOperation, DEFAULT_ROOM,
};
pub use oplog::{Commit, OperationLog, RoomState};
pub use protocol::{ClientMessage, HistoryRequest, ProtocolError, ServerMessage};
pub use room::{Room, RoomRegistry};
pub use server::{ServerStats, SyncServer};
pub use storage::{open_store, LogEntry, LogStore, MemoryStore, StorageConfig, StoreError};
#[cfg(feature = "rocks")]
pub use storage::{RocksStore, StoreConfig};
