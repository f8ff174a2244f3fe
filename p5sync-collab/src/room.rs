//! Rooms and the registry that creates them.
//!
//! ```text
//!                 RoomRegistry
//!   name ──► resolve ──► Arc<Room> ─┬─ OperationLog (durable, ordered)
//!            (get-or-create,        └─ BroadcastGroup (live fan-out)
//!             atomic)
//! ```
//!
//! A room comes into existence the first time anything references its
//! name and lives for the rest of the process. Concurrent first references
//! all observe the same `Room`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::broadcast::{BroadcastGroup, PeerInfo, SessionId, Subscription};
use crate::clock::MonotonicClock;
use crate::oplog::{Commit, OperationLog, RoomState};
use crate::operation::Operation;
use crate::storage::{LogStore, StoreError};

/// A named drawing session: its log plus its live subscribers.
pub struct Room {
    name: String,
    log: OperationLog,
    broadcast: BroadcastGroup,
}

impl Room {
    fn new(
        name: &str,
        store: Arc<dyn LogStore>,
        clock: Arc<MonotonicClock>,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            log: OperationLog::new(name, store, clock),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub async fn state(&self) -> Result<RoomState, StoreError> {
        self.log.state().await
    }

    /// Durably record `op` and, only once that succeeded, fan it out to
    /// every other session. The publish happens before the next writer of
    /// this room runs, so live order matches history order.
    pub async fn commit(&self, origin: SessionId, op: Operation) -> Result<Commit, StoreError> {
        let (commit, receivers) = self
            .log
            .commit_with(op, |commit| {
                self.broadcast.publish(origin, commit.operation().clone())
            })
            .await?;
        log::debug!(
            "Room {}: {} from {origin} published to {receivers} receivers",
            self.name,
            commit.operation().mode()
        );
        Ok(commit)
    }

    /// Snapshot the history and subscribe `peer` in one step.
    pub async fn join(&self, peer: PeerInfo) -> Result<(Vec<Operation>, Subscription), StoreError> {
        let session = peer.session_id;
        let (history, subscription) = self.log.join(|| self.broadcast.subscribe(session)).await?;
        self.broadcast.register_peer(peer).await;
        Ok((history, subscription))
    }

    /// Stop tracking `session`. Returns whether it was attached.
    pub async fn leave(&self, session: &SessionId) -> bool {
        self.broadcast.remove_peer(session).await.is_some()
    }
}

/// Maps room names to rooms.
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    store: Arc<dyn LogStore>,
    clock: Arc<MonotonicClock>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn LogStore>, broadcast_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            store,
            clock: Arc::new(MonotonicClock::new()),
            broadcast_capacity,
        }
    }

    /// Get or create the room called `name`.
    pub async fn resolve(&self, name: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = Arc::new(Room::new(
            name,
            self.store.clone(),
            self.clock.clone(),
            self.broadcast_capacity,
        ));
        // Nobody can reach the room before it is inserted
        if let Err(e) = room.log.resume().await {
            log::error!("Room {name}: could not read stored timestamps: {e}");
        }
        rooms.insert(name.to_string(), room.clone());

        match self.store.register_room(name) {
            Ok(true) => log::info!("Created room {name}"),
            Ok(false) => log::debug!("Activated known room {name}"),
            Err(e) => log::warn!("Room {name} created but not recorded in the room set: {e}"),
        }
        room
    }

    /// Look up a room without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Activate every room the store knows about.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let names = self.store.rooms()?;
        for name in &names {
            self.resolve(name).await;
        }
        log::info!("Recovered {} rooms from the store", names.len());
        Ok(names.len())
    }

    /// Get the number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Names of all active rooms, sorted.
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }
}
