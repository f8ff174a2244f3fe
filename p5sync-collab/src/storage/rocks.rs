//! RocksDB-backed persistent operation store.
//!
//! Column families:
//! - `operations` — room log entries, keyed by `<room prefix><sequence:8 BE>`
//!   where the room prefix is `<len:2 BE><room name bytes>`; values are
//!   LZ4-compressed bincode [`Operation`]s
//! - `rooms`      — the room set (key = room name, empty value)
//! - `meta`       — store-wide counters (`next_sequence`)
//!
//! An append is one `WriteBatch` (entry + sequence counter); a clear is one
//! `WriteBatch` of deletes over the room prefix. Readers iterate over an
//! implicit snapshot, so they see either all of a batch or none of it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{LogEntry, LogStore, StoreError};
use crate::operation::Operation;

/// Column family names.
const CF_OPERATIONS: &str = "operations";
const CF_ROOMS: &str = "rooms";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_ROOMS, CF_META];

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false; RocksDB's own WAL still
    /// makes each batch survive a process crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("p5sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed operation store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Next sequence number; held across the append batch so the persisted
    /// counter never moves backwards
    sequence: Mutex<u64>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened operation store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: Mutex::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Values are LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS | CF_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Read the persisted `next_sequence` counter.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(cf, META_NEXT_SEQUENCE)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Next sequence number that will be assigned.
    pub fn next_sequence(&self) -> Result<u64, StoreError> {
        Ok(*self.sequence.lock().map_err(|_| StoreError::Poisoned)?)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Visit every `(key, value)` of a room in sequence order.
    fn scan_room(
        &self,
        room: &str,
        mut visit: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = room_prefix(room)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            visit(&key, &value)?;
        }
        Ok(())
    }
}

impl LogStore for RocksStore {
    fn append(&self, room: &str, operation: &Operation) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_META)?;

        let encoded = bincode::serde::encode_to_vec(operation, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut next = self.sequence.lock().map_err(|_| StoreError::Poisoned)?;
        let sequence = *next;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, entry_key(room, sequence)?, &compressed);
        batch.put_cf(cf_meta, META_NEXT_SEQUENCE, (sequence + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        *next = sequence + 1;
        Ok(sequence)
    }

    fn clear(&self, room: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;

        self.scan_room(room, |key, _| {
            batch.delete_cf(cf, key);
            count += 1;
            Ok(())
        })?;

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn load(&self, room: &str) -> Result<Vec<LogEntry>, StoreError> {
        let mut entries = Vec::new();
        self.scan_room(room, |key, value| {
            let split = key
                .len()
                .checked_sub(8)
                .ok_or_else(|| StoreError::Corrupt("Operation key too short".into()))?;
            let sequence = decode_u64(&key[split..])?;
            let decompressed = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let (operation, _): (Operation, _) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            entries.push(LogEntry {
                sequence,
                operation,
            });
            Ok(())
        })?;
        Ok(entries)
    }

    fn len(&self, room: &str) -> Result<usize, StoreError> {
        let mut count = 0usize;
        self.scan_room(room, |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn register_room(&self, room: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        if self.db.get_cf(cf, room.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.db
            .put_cf_opt(cf, room.as_bytes(), b"", &self.write_options())?;
        Ok(true)
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Corrupt(format!("Room name is not UTF-8: {e}")))?;
            rooms.push(name);
        }
        Ok(rooms)
    }
}

/// `<len:2 BE><room bytes>`; the length keeps `ab` and `abc` apart.
fn room_prefix(room: &str) -> Result<Vec<u8>, StoreError> {
    let len = u16::try_from(room.len())
        .map_err(|_| StoreError::Serialization(format!("Room name too long: {} bytes", room.len())))?;
    let mut prefix = Vec::with_capacity(2 + room.len() + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(room.as_bytes());
    Ok(prefix)
}

/// Build an entry key: room prefix + sequence (8 bytes big-endian).
fn entry_key(room: &str, sequence: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = room_prefix(room)?;
    key.extend_from_slice(&sequence.to_be_bytes());
    Ok(key)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("Expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Erase, Point, Segment};

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn pencil(id: &str, room: &str) -> Operation {
        Operation::pencil(
            id,
            room,
            Some("#000".into()),
            vec![Segment::new(Point::new(1.0, 2.0), Point::new(3.0, 4.0))],
        )
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
        assert_eq!(store.next_sequence().unwrap(), 0);
    }

    #[test]
    fn test_append_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let mut op = pencil("a", "r");
        op.timestamp = Some(7);
        let s1 = store.append("r", &op).unwrap();
        let rubber = Operation::rubber("b", "r", vec![Erase::new(Point::new(5.0, 5.0), 2.0)]);
        let s2 = store.append("r", &rubber).unwrap();
        assert_eq!(s1 + 1, s2);

        let entries = store.load("r").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, s1);
        assert_eq!(entries[0].operation, op);
        assert_eq!(entries[1].operation, rubber);
        assert_eq!(store.len("r").unwrap(), 2);
    }

    #[test]
    fn test_clear_removes_only_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        for i in 0..5 {
            store.append("ab", &pencil(&format!("a{i}"), "ab")).unwrap();
        }
        store.append("abc", &pencil("x", "abc")).unwrap();

        assert_eq!(store.clear("ab").unwrap(), 5);
        assert_eq!(store.clear("ab").unwrap(), 0);
        assert!(store.load("ab").unwrap().is_empty());
        assert_eq!(store.load("abc").unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.append("r", &pencil("a", "r")).unwrap();
            store.append("q", &pencil("b", "q")).unwrap();
            store.append("r", &pencil("c", "r")).unwrap();
            assert_eq!(store.next_sequence().unwrap(), 3);
        }

        let store = open(&dir);
        assert_eq!(store.next_sequence().unwrap(), 3);
        let seq = store.append("r", &pencil("d", "r")).unwrap();
        assert_eq!(seq, 3);

        let ids: Vec<_> = store
            .load("r")
            .unwrap()
            .into_iter()
            .map(|e| e.operation.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_room_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            assert!(store.register_room("lobby").unwrap());
            assert!(!store.register_room("lobby").unwrap());
            store.register_room("attic").unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.rooms().unwrap(), vec!["attic".to_string(), "lobby".to_string()]);
    }

    #[test]
    fn test_room_prefix_disambiguates() {
        let a = entry_key("ab", 1).unwrap();
        let b = entry_key("abc", 1).unwrap();
        assert!(!b.starts_with(&room_prefix("ab").unwrap()));
        assert!(!a.starts_with(&room_prefix("abc").unwrap()));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
