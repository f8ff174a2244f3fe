//! In-memory [`LogStore`]: room logs live as long as the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{LogEntry, LogStore, StoreError};
use crate::operation::Operation;

/// Volatile store backed by a map of vectors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<String, Vec<LogEntry>>>,
    rooms: RwLock<BTreeSet<String>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl LogStore for MemoryStore {
    fn append(&self, room: &str, operation: &Operation) -> Result<u64, StoreError> {
        let mut logs = self.logs.write().map_err(|_| StoreError::Poisoned)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        logs.entry(room.to_string()).or_default().push(LogEntry {
            sequence,
            operation: operation.clone(),
        });
        Ok(sequence)
    }

    fn clear(&self, room: &str) -> Result<usize, StoreError> {
        let mut logs = self.logs.write().map_err(|_| StoreError::Poisoned)?;
        Ok(logs.remove(room).map_or(0, |entries| entries.len()))
    }

    fn load(&self, room: &str) -> Result<Vec<LogEntry>, StoreError> {
        let logs = self.logs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(logs.get(room).cloned().unwrap_or_default())
    }

    fn len(&self, room: &str) -> Result<usize, StoreError> {
        let logs = self.logs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(logs.get(room).map_or(0, Vec::len))
    }

    fn register_room(&self, room: &str) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| StoreError::Poisoned)?;
        Ok(rooms.insert(room.to_string()))
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rooms.iter().cloned().collect())
    }
}
