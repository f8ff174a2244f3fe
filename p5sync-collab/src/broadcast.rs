//! Fan-out of room operations to N-1 subscribed sessions.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each session gets an independent receiver that buffers up to `capacity`
//! deliveries; one channel per room keeps delivery FIFO per
//! (room, subscriber). A session never sees its own operations back: it
//! already applied them locally before sending.
//!
//! Delivery is best-effort. A subscriber that falls more than `capacity`
//! messages behind skips ahead; catching up is the job of the room's
//! history, not of this channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::operation::Operation;

/// Server-side identity of one connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A session attached to a room.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub session_id: SessionId,
    /// Human-readable label (remote address for WebSocket sessions)
    pub label: String,
}

impl PeerInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), label)
    }

    pub fn with_id(session_id: SessionId, label: impl Into<String>) -> Self {
        Self {
            session_id,
            label: label.into(),
        }
    }
}

/// One operation on its way to the subscribers of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Session that published it (skipped on receive).
    pub origin: SessionId,
    pub operation: Operation,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    /// Broadcast channel sender
    sender: broadcast::Sender<Arc<Delivery>>,

    /// Sessions attached to this room
    peers: Arc<RwLock<HashMap<SessionId, PeerInfo>>>,

    /// Channel capacity (deliveries buffered per receiver)
    capacity: usize,

    /// Lock-free stats (atomics)
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many deliveries can be buffered per
    /// session before a lagging session starts skipping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Track a session and subscribe it.
    pub async fn add_peer(&self, info: PeerInfo) -> Subscription {
        let session = info.session_id;
        self.peers.write().await.insert(session, info);
        self.subscribe(session)
    }

    /// Track a session that already holds a [`Subscription`].
    pub async fn register_peer(&self, info: PeerInfo) {
        self.peers.write().await.insert(info.session_id, info);
    }

    /// Stop tracking a session. Its subscription ends when dropped.
    pub async fn remove_peer(&self, session: &SessionId) -> Option<PeerInfo> {
        self.peers.write().await.remove(session)
    }

    /// Raw subscription (no peer tracking). Synchronous, so it can run
    /// inside a log critical section.
    pub fn subscribe(&self, session: SessionId) -> Subscription {
        Subscription {
            session,
            receiver: self.sender.subscribe(),
            stats: self.atomic_stats.clone(),
        }
    }

    /// Deliver `operation` to every subscriber except `origin`.
    ///
    /// Returns the number of receivers the delivery was queued for
    /// (including `origin`'s own receiver, which skips it on receive).
    /// Fully lock-free: tokio broadcast::send + atomic stats.
    pub fn publish(&self, origin: SessionId, operation: Operation) -> usize {
        let delivery = Arc::new(Delivery { origin, operation });
        let count = self.sender.send(delivery).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Get the current peer count.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Get all attached peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Check if a session is attached.
    pub async fn has_peer(&self, session: &SessionId) -> bool {
        self.peers.read().await.contains_key(session)
    }

    /// Live receivers, tracked or not.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One step of a [`Subscription`] stream.
#[derive(Debug, Clone)]
pub enum Received {
    Delivery(Arc<Delivery>),
    /// This many deliveries were overwritten before they could be read.
    Lagged(u64),
}

/// A session's view of one room's broadcast stream.
pub struct Subscription {
    session: SessionId,
    receiver: broadcast::Receiver<Arc<Delivery>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Next delivery from another session, or `None` once the room's
    /// channel is gone. Lag is logged and skipped over. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Arc<Delivery>> {
        loop {
            match self.recv_or_lag().await? {
                Received::Delivery(delivery) => return Some(delivery),
                Received::Lagged(_) => continue,
            }
        }
    }

    /// Like [`recv`](Self::recv), but returns as soon as the receiver
    /// learns it fell behind, so the caller can resynchronize from history.
    pub async fn recv_or_lag(&mut self) -> Option<Received> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) if delivery.origin == self.session => continue,
                Ok(delivery) => return Some(Received::Delivery(delivery)),
                Err(RecvError::Lagged(skipped)) => {
                    self.note_lag(skipped);
                    return Some(Received::Lagged(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv): `None` when nothing
    /// from another session is queued.
    pub fn try_recv(&mut self) -> Option<Arc<Delivery>> {
        loop {
            match self.receiver.try_recv() {
                Ok(delivery) if delivery.origin == self.session => continue,
                Ok(delivery) => return Some(delivery),
                Err(TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn note_lag(&self, skipped: u64) {
        log::warn!("Session {} lagged by {skipped} operations", self.session);
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }
}
