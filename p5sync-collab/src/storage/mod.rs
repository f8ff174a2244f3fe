//! Durable backing store for room operation logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   append / clear / load   ┌──────────────────────────┐
//! │ OperationLog │ ────────────────────────► │ dyn LogStore             │
//! │ (per room,   │                           │  ├── MemoryStore (RAM)   │
//! │  serialized) │                           │  └── RocksStore (disk)   │
//! └──────────────┘                           └──────────────────────────┘
//! ```
//!
//! Every store keeps, per room, an ordered list of [`LogEntry`] plus the
//! set of room names it has seen. Each call is atomic on its own: an
//! append lands completely or not at all, and a clear removes a room's
//! entries in one step. Serializing calls per room is the
//! [`OperationLog`](crate::oplog::OperationLog)'s job, not the store's.

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::operation::Operation;

pub use memory::MemoryStore;
#[cfg(feature = "rocks")]
pub use rocks::{RocksStore, StoreConfig};

/// An operation as recorded in a room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned, strictly increasing across the whole store.
    pub sequence: u64,
    pub operation: Operation,
}

/// A durable, per-room operation store.
///
/// Calls are synchronous and short; callers hold the room's write lock
/// around them.
pub trait LogStore: Send + Sync {
    /// Record `operation` as the newest entry of `room`. Returns its sequence.
    fn append(&self, room: &str, operation: &Operation) -> Result<u64, StoreError>;

    /// Drop every entry of `room`. Returns how many were removed.
    fn clear(&self, room: &str) -> Result<usize, StoreError>;

    /// All entries of `room` in sequence order.
    fn load(&self, room: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Number of entries currently stored for `room`.
    fn len(&self, room: &str) -> Result<usize, StoreError>;

    /// Add `room` to the room set. Returns `true` if it was not known yet.
    fn register_room(&self, room: &str) -> Result<bool, StoreError>;

    /// Every room name ever registered.
    fn rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Which engine backs the room logs.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StorageConfig {
    /// Volatile, process-lifetime storage.
    #[default]
    Memory,
    /// RocksDB database at the given directory.
    Rocks(PathBuf),
}

/// Open the store described by `config`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn LogStore>, StoreError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocks")]
        StorageConfig::Rocks(path) => {
            let store = RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "rocks"))]
        StorageConfig::Rocks(path) => Err(StoreError::Unavailable(format!(
            "RocksDB support not compiled in (requested {})",
            path.display()
        ))),
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
