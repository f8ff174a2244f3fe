//! History reconstruction for joining and reconnecting sessions.
//!
//! The broadcast channel delivers nothing retroactively, so every session
//! asks for history on first join and again after each reconnect. The
//! answer is the room's ordered snapshot: every operation since the most
//! recent clear, ordered by `(timestamp, sequence)`.

use std::sync::Arc;

use crate::broadcast::{PeerInfo, Subscription};
use crate::hub::HubError;
use crate::operation::{room_or_default, Operation};
use crate::room::RoomRegistry;

/// A session's entry into a room.
pub struct Joined {
    pub room: String,
    pub history: Vec<Operation>,
    pub subscription: Subscription,
}

/// Serves ordered room snapshots.
pub struct HistoryService {
    registry: Arc<RoomRegistry>,
}

impl HistoryService {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Ordered snapshot of `room` (default room if `None`).
    ///
    /// An unknown room is created on the spot and yields an empty history.
    pub async fn snapshot(&self, room: Option<&str>) -> Result<Vec<Operation>, HubError> {
        let name = room_or_default(room.map(str::to_string));
        let handle = self.registry.resolve(&name).await;
        let history = handle
            .log()
            .snapshot()
            .await
            .map_err(|source| HubError::Store {
                room: name.clone(),
                source,
            })?;
        log::debug!("History for room {name}: {} operations", history.len());
        Ok(history)
    }

    /// Snapshot `room` and subscribe `peer` to it in one step.
    pub async fn join(&self, room: Option<&str>, peer: PeerInfo) -> Result<Joined, HubError> {
        let name = room_or_default(room.map(str::to_string));
        let handle = self.registry.resolve(&name).await;
        let label = peer.label.clone();
        let (history, subscription) = handle.join(peer).await.map_err(|source| HubError::Store {
            room: name.clone(),
            source,
        })?;
        log::info!(
            "Session {label} joined room {name} ({} operations of history)",
            history.len()
        );
        Ok(Joined {
            room: name,
            history,
            subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SessionId;
    use crate::operation::{Point, Segment, DEFAULT_ROOM};
    use crate::storage::MemoryStore;

    fn service() -> (Arc<RoomRegistry>, HistoryService) {
        let registry = Arc::new(RoomRegistry::new(Arc::new(MemoryStore::new()), 16));
        (registry.clone(), HistoryService::new(registry))
    }

    fn pencil(id: &str) -> Operation {
        Operation::pencil(
            id,
            "x",
            None,
            vec![Segment::new(Point::new(0.0, 0.0), Point::new(5.0, 5.0))],
        )
    }

    #[tokio::test]
    async fn test_unknown_room_is_empty_and_created() {
        let (registry, history) = service();
        let ops = history.snapshot(Some("never-seen")).await.unwrap();
        assert!(ops.is_empty());
        assert!(registry.get("never-seen").await.is_some());
    }

    #[tokio::test]
    async fn test_missing_room_uses_default() {
        let (registry, history) = service();
        history.snapshot(None).await.unwrap();
        assert!(registry.get(DEFAULT_ROOM).await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_latest_clear() {
        let (registry, history) = service();
        let room = registry.resolve("x").await;
        let author = SessionId::new();
        room.commit(author, pencil("s1")).await.unwrap();
        room.commit(author, Operation::clear("a", "x")).await.unwrap();
        room.commit(author, pencil("s2")).await.unwrap();

        let ops = history.snapshot(Some("x")).await.unwrap();
        let ids: Vec<_> = ops.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["s2"]);
    }

    #[tokio::test]
    async fn test_join_returns_history_and_stream() {
        let (registry, history) = service();
        let room = registry.resolve("x").await;
        room.commit(SessionId::new(), pencil("before")).await.unwrap();

        let mut joined = history.join(Some("x"), PeerInfo::new("late")).await.unwrap();
        assert_eq!(joined.room, "x");
        assert_eq!(joined.history.len(), 1);

        room.commit(SessionId::new(), pencil("after")).await.unwrap();
        assert_eq!(joined.subscription.recv().await.unwrap().operation.id, "after");
    }
}
