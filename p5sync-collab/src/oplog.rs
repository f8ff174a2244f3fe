//! Per-room operation log: append, clear, ordered snapshot.
//!
//! ```text
//!              write_lock (tokio Mutex, one per room)
//!                ┌────────────────────────────────┐
//!  append(op) ──►│ stamp timestamp ─► store.append│──► on_durable(&commit)
//!  clear()    ──►│ store.clear                    │      (e.g. broadcast)
//!  join(f)    ──►│ store.load ─► f()              │
//!                └────────────────────────────────┘
//!  snapshot() ──► store.load ─► sort by (timestamp, sequence)
//! ```
//!
//! Every mutation runs under the room's write lock, so timestamps and
//! store sequences follow append order, and a clear splits the appends into
//! a before-set (gone) and an after-set (visible). The store call itself is
//! synchronous and atomic, with no await point between it and the lock
//! release: a cancelled caller either never reached the store or already
//! finished with it.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::MonotonicClock;
use crate::operation::Operation;
use crate::storage::{LogEntry, LogStore, StoreError};

/// Replay-relevant state of an active room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// No visible operations (fresh room, or right after a clear).
    Empty,
    /// At least one operation survives the last clear.
    HasHistory,
}

/// Result of a durable write.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// A pencil or rubber operation became the newest entry.
    Appended { operation: Operation, sequence: u64 },
    /// A clear truncated the log.
    Cleared { operation: Operation, removed: usize },
}

impl Commit {
    /// The stamped operation that was committed.
    pub fn operation(&self) -> &Operation {
        match self {
            Commit::Appended { operation, .. } | Commit::Cleared { operation, .. } => operation,
        }
    }

    pub fn into_operation(self) -> Operation {
        match self {
            Commit::Appended { operation, .. } | Commit::Cleared { operation, .. } => operation,
        }
    }
}

/// Append-only operation log of one room, truncated by clears.
pub struct OperationLog {
    room: String,
    store: Arc<dyn LogStore>,
    clock: Arc<MonotonicClock>,
    write_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(room: impl Into<String>, store: Arc<dyn LogStore>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            room: room.into(),
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Advance the clock past every timestamp already stored for this room,
    /// so new appends order after entries written by an earlier process.
    /// Returns the newest stored timestamp (0 for an empty log).
    pub async fn resume(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let newest = self
            .store
            .load(&self.room)?
            .iter()
            .filter_map(|e| e.operation.timestamp)
            .max()
            .unwrap_or(0);
        self.clock.observe(newest);
        Ok(newest)
    }

    /// Durably record `op`: a clear truncates the log, anything else is
    /// appended. Returns the stamped operation.
    pub async fn append(&self, op: Operation) -> Result<Operation, StoreError> {
        let (commit, ()) = self.commit_with(op, |_| ()).await?;
        Ok(commit.into_operation())
    }

    /// Drop every visible operation. Clearing an empty log removes nothing
    /// and succeeds.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.clear(&self.room)
    }

    /// Durably record `op`, then run `on_durable` before any other writer
    /// of this room gets a turn.
    ///
    /// `on_durable` is not called when the store fails.
    pub async fn commit_with<R>(
        &self,
        mut op: Operation,
        on_durable: impl FnOnce(&Commit) -> R,
    ) -> Result<(Commit, R), StoreError> {
        let _guard = self.write_lock.lock().await;

        if op.timestamp.is_none() {
            op.timestamp = Some(self.clock.now());
        }
        op.room.clone_from(&self.room);

        let commit = if op.is_clear() {
            let removed = self.store.clear(&self.room)?;
            Commit::Cleared {
                operation: op,
                removed,
            }
        } else {
            let sequence = self.store.append(&self.room, &op)?;
            Commit::Appended {
                operation: op,
                sequence,
            }
        };

        let output = on_durable(&commit);
        Ok((commit, output))
    }

    /// Visible operations ordered by `(timestamp, sequence)`.
    pub async fn snapshot(&self) -> Result<Vec<Operation>, StoreError> {
        let entries = self.store.load(&self.room)?;
        Ok(order_entries(entries))
    }

    /// Take a snapshot and run `f` with no write interleaving between the
    /// two. Used to subscribe a session so that every operation lands in
    /// exactly one of history or the live stream.
    pub async fn join<R>(&self, f: impl FnOnce() -> R) -> Result<(Vec<Operation>, R), StoreError> {
        let _guard = self.write_lock.lock().await;
        let entries = self.store.load(&self.room)?;
        let output = f();
        Ok((order_entries(entries), output))
    }

    /// Number of visible operations.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.len(&self.room)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    pub async fn state(&self) -> Result<RoomState, StoreError> {
        if self.is_empty().await? {
            Ok(RoomState::Empty)
        } else {
            Ok(RoomState::HasHistory)
        }
    }
}

/// Order log entries by timestamp, breaking ties by store sequence.
///
/// The sort is stable and the key is unique per entry, so the result is a
/// total order regardless of how the entries were gathered.
pub fn order_entries(mut entries: Vec<LogEntry>) -> Vec<Operation> {
    entries.sort_by_key(|e| (e.operation.timestamp.unwrap_or(0), e.sequence));
    entries.into_iter().map(|e| e.operation).collect()
}
