//! Single ingress point for everything a session asks of the service.
//!
//! ```text
//!  draw ────────────► validate ─► RoomRegistry::resolve ─► Room::commit
//!                        │                                  (durable, then
//!                        └─► Rejected (dropped, logged)      fan-out)
//!  request_history ─► HistoryService::snapshot
//!  join ────────────► HistoryService::join (snapshot + subscribe)
//!  rejoin ──────────► leave ─► join
//! ```

use std::sync::Arc;
use thiserror::Error;

use crate::broadcast::{PeerInfo, SessionId};
use crate::history::{HistoryService, Joined};
use crate::oplog::Commit;
use crate::operation::{CanvasBounds, Operation, ValidationError, WireOperation};
use crate::protocol::HistoryRequest;
use crate::room::RoomRegistry;
use crate::storage::{LogStore, MemoryStore, StoreError};

/// What became of an inbound draw.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOutcome {
    /// Invalid input, dropped before touching any room.
    Rejected(ValidationError),
    /// Appended and published to the room's other sessions.
    Committed(Operation),
    /// Room truncated and the clear published.
    Cleared { operation: Operation, removed: usize },
}

/// Failures reported back to the requesting session only.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Store failure in room {room}: {source}")]
    Store {
        room: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to recover rooms: {0}")]
    Recovery(#[source] StoreError),
}

impl HubError {
    /// Room the failed request targeted, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            HubError::Store { room, .. } => Some(room),
            HubError::Recovery(_) => None,
        }
    }
}

pub struct CanvasHub {
    registry: Arc<RoomRegistry>,
    history: HistoryService,
    bounds: CanvasBounds,
}

impl CanvasHub {
    pub fn new(store: Arc<dyn LogStore>, bounds: CanvasBounds, broadcast_capacity: usize) -> Self {
        let registry = Arc::new(RoomRegistry::new(store, broadcast_capacity));
        Self {
            history: HistoryService::new(registry.clone()),
            registry,
            bounds,
        }
    }

    /// Hub over a fresh in-memory store with the default canvas.
    pub fn in_memory(broadcast_capacity: usize) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            CanvasBounds::default(),
            broadcast_capacity,
        )
    }

    /// Validate, persist and fan out one operation from `origin`.
    pub async fn draw(&self, origin: SessionId, wire: WireOperation) -> Result<DrawOutcome, HubError> {
        let op = match wire.validate(&self.bounds) {
            Ok(op) => op,
            Err(e) => {
                log::debug!("Dropped operation from {origin}: {e}");
                return Ok(DrawOutcome::Rejected(e));
            }
        };

        let room = self.registry.resolve(&op.room).await;
        match room.commit(origin, op).await {
            Ok(Commit::Appended { operation, .. }) => Ok(DrawOutcome::Committed(operation)),
            Ok(Commit::Cleared { operation, removed }) => {
                log::info!("Room {} cleared ({removed} operations removed)", room.name());
                Ok(DrawOutcome::Cleared { operation, removed })
            }
            Err(source) => {
                log::error!("Failed to record operation in room {}: {source}", room.name());
                Err(HubError::Store {
                    room: room.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Ordered history of the requested room.
    pub async fn request_history(&self, request: HistoryRequest) -> Result<Vec<Operation>, HubError> {
        self.history.snapshot(request.room.as_deref()).await
    }

    /// History of the requested room plus a live subscription to it.
    pub async fn join(&self, peer: PeerInfo, request: HistoryRequest) -> Result<Joined, HubError> {
        self.history.join(request.room.as_deref(), peer).await
    }

    /// Move `peer` out of `current` (if any) and into the requested room,
    /// with a fresh history and subscription.
    ///
    /// Also used to resynchronize a session in its own room: the old
    /// subscription is dropped along with whatever it still buffered, and
    /// the new history covers all of it.
    pub async fn rejoin(
        &self,
        peer: PeerInfo,
        current: Option<&str>,
        request: HistoryRequest,
    ) -> Result<Joined, HubError> {
        if let Some(room) = current {
            self.leave(&peer.session_id, room).await;
        }
        self.join(peer, request).await
    }

    /// Detach `origin` from `room`. Returns whether it was attached.
    pub async fn leave(&self, origin: &SessionId, room: &str) -> bool {
        match self.registry.get(room).await {
            Some(room) => room.leave(origin).await,
            None => false,
        }
    }

    /// Activate the rooms already present in the store.
    pub async fn recover(&self) -> Result<usize, HubError> {
        self.registry.recover().await.map_err(HubError::Recovery)
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn bounds(&self) -> &CanvasBounds {
        &self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Received;
    use crate::operation::{Point, Segment};
    use crate::storage::LogEntry;

    fn pencil(id: &str, room: &str) -> WireOperation {
        WireOperation {
            room: Some(room.into()),
            id: id.into(),
            mode: "pencil".into(),
            color: Some("#000000".into()),
            lines: Some(vec![Segment::new(Point::new(0.0, 0.0), Point::new(5.0, 5.0))]),
            circles: None,
            timestamp: None,
        }
    }

    fn clear(id: &str, room: &str) -> WireOperation {
        WireOperation {
            room: Some(room.into()),
            id: id.into(),
            mode: "clear".into(),
            color: None,
            lines: None,
            circles: None,
            timestamp: None,
        }
    }

    fn history(room: &str) -> HistoryRequest {
        HistoryRequest {
            room: Some(room.into()),
        }
    }

    /// Store whose writes always fail.
    struct FailingStore;

    impl LogStore for FailingStore {
        fn append(&self, _room: &str, _operation: &Operation) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
        fn clear(&self, _room: &str) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
        fn load(&self, _room: &str) -> Result<Vec<LogEntry>, StoreError> {
            Ok(Vec::new())
        }
        fn len(&self, _room: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
        fn register_room(&self, _room: &str) -> Result<bool, StoreError> {
            Ok(true)
        }
        fn rooms(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_broadcast_then_history_for_late_joiner() {
        let hub = CanvasHub::in_memory(16);
        let a = PeerInfo::new("A");
        let mut b = hub.join(PeerInfo::new("B"), history("x")).await.unwrap();
        assert!(b.history.is_empty());

        let outcome = hub.draw(a.session_id, pencil("A", "x")).await.unwrap();
        let committed = match outcome {
            DrawOutcome::Committed(op) => op,
            other => panic!("Expected commit, got {other:?}"),
        };
        assert!(committed.timestamp.is_some());

        let delivered = b.subscription.recv().await.unwrap();
        assert_eq!(delivered.operation, committed);

        let c = hub.request_history(history("x")).await.unwrap();
        assert_eq!(c, vec![committed]);
    }

    #[tokio::test]
    async fn test_pencil_clear_pencil_leaves_last_stroke() {
        let hub = CanvasHub::in_memory(16);
        let a = SessionId::new();
        hub.draw(a, pencil("s1", "x")).await.unwrap();
        let cleared = hub.draw(a, clear("s1", "x")).await.unwrap();
        assert!(matches!(cleared, DrawOutcome::Cleared { removed: 1, .. }));
        hub.draw(a, pencil("s2", "x")).await.unwrap();

        let ops = hub.request_history(history("x")).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, "s2");
    }

    #[tokio::test]
    async fn test_never_seen_room_has_empty_history() {
        let hub = CanvasHub::in_memory(16);
        assert!(hub.request_history(history("never-seen")).await.unwrap().is_empty());
        assert!(hub.registry().get("never-seen").await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_operation_touches_nothing() {
        let hub = CanvasHub::in_memory(16);
        let mut watcher = hub.join(PeerInfo::new("W"), history("x")).await.unwrap();

        let mut bad = pencil("A", "x");
        bad.lines = Some(vec![Segment::new(
            Point::new(0.0, 0.0),
            Point::new(hub.bounds().width + 1.0, 10.0),
        )]);
        let outcome = hub.draw(SessionId::new(), bad).await.unwrap();
        assert!(matches!(
            outcome,
            DrawOutcome::Rejected(ValidationError::OutOfBounds { .. })
        ));

        let mut unknown = pencil("A", "y");
        unknown.mode = "spray".into();
        hub.draw(SessionId::new(), unknown).await.unwrap();

        assert!(watcher.subscription.try_recv().is_none());
        assert!(hub.request_history(history("x")).await.unwrap().is_empty());
        assert!(hub.registry().get("y").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_is_broadcast() {
        let hub = CanvasHub::in_memory(16);
        let mut watcher = hub.join(PeerInfo::new("W"), history("x")).await.unwrap();
        hub.draw(SessionId::new(), clear("A", "x")).await.unwrap();

        let delivery = watcher.subscription.recv().await.unwrap();
        assert!(delivery.operation.is_clear());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_broadcast() {
        let hub = CanvasHub::new(Arc::new(FailingStore), CanvasBounds::default(), 16);
        let mut watcher = hub.join(PeerInfo::new("W"), history("x")).await.unwrap();

        let err = hub.draw(SessionId::new(), pencil("A", "x")).await.unwrap_err();
        assert_eq!(err.room(), Some("x"));
        assert!(matches!(
            err,
            HubError::Store {
                source: StoreError::Unavailable(_),
                ..
            }
        ));

        let err = hub.draw(SessionId::new(), clear("A", "x")).await.unwrap_err();
        assert!(err.to_string().contains("disk gone"));
        assert!(watcher.subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_leave() {
        let hub = CanvasHub::in_memory(16);
        let peer = PeerInfo::new("P");
        let session = peer.session_id;
        let joined = hub.join(peer, HistoryRequest::default()).await.unwrap();
        assert_eq!(joined.room, crate::operation::DEFAULT_ROOM);

        assert!(hub.leave(&session, &joined.room).await);
        assert!(!hub.leave(&session, &joined.room).await);
        assert!(!hub.leave(&session, "missing").await);
    }

    #[tokio::test]
    async fn test_rejoin_same_room_does_not_duplicate() {
        let hub = CanvasHub::in_memory(16);
        let peer = PeerInfo::new("P");
        let _first = hub.join(peer.clone(), history("x")).await.unwrap();

        // Buffered on the old subscription, never read
        hub.draw(SessionId::new(), pencil("A", "x")).await.unwrap();

        let mut second = hub.rejoin(peer, Some("x"), history("x")).await.unwrap();
        assert_eq!(second.history.len(), 1);
        assert!(second.subscription.try_recv().is_none());

        hub.draw(SessionId::new(), pencil("B", "x")).await.unwrap();
        assert_eq!(second.subscription.recv().await.unwrap().operation.id, "B");
        assert!(second.subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_rejoin_after_lag_recovers_skipped_operations() {
        let hub = CanvasHub::in_memory(2);
        let peer = PeerInfo::new("slow");
        let mut joined = hub.join(peer.clone(), history("x")).await.unwrap();

        let author = SessionId::new();
        for i in 0..5 {
            hub.draw(author, pencil(&format!("s{i}"), "x")).await.unwrap();
        }
        assert!(matches!(
            joined.subscription.recv_or_lag().await,
            Some(Received::Lagged(3))
        ));

        let resynced = hub.rejoin(peer.clone(), Some("x"), history("x")).await.unwrap();
        let ids: Vec<String> = resynced.history.into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);

        let room = hub.registry().get("x").await.unwrap();
        assert!(room.broadcast().has_peer(&peer.session_id).await);
        assert_eq!(room.broadcast().peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_moves_between_rooms() {
        let hub = CanvasHub::in_memory(16);
        let peer = PeerInfo::new("P");
        let session = peer.session_id;
        hub.join(peer.clone(), history("r1")).await.unwrap();

        let moved = hub.rejoin(peer, Some("r1"), history("r2")).await.unwrap();
        assert_eq!(moved.room, "r2");
        let r1 = hub.registry().get("r1").await.unwrap();
        assert!(!r1.broadcast().has_peer(&session).await);
    }
}
