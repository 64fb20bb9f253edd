//! RocksDB-backed journal store.
//!
//! Column families:
//! - `journal`: Replay records (bincode, LZ4 compressed), keyed by room + sequence
//! - `rooms`  : Room metadata (bincode: record count, last sequence, timestamps)
//!
//! Journal key layout:
//! ```text
//! ┌────────────┬──────────────────┬──────────────────┐
//! │ len: u16 BE│ room id (UTF-8)  │ sequence: u64 BE │
//! └────────────┴──────────────────┴──────────────────┘
//! ```
//! The length prefix keeps one room's keys from being a prefix of another's,
//! and big-endian sequences make a forward scan return records in order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{JournalStore, StoreError};
use crate::journal::{ReplayRecord, FIRST_SEQUENCE};
use crate::operation::now_ms;

const CF_JOURNAL: &str = "journal";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_JOURNAL, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every record (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("glyph_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

/// Per-room bookkeeping, updated atomically with each record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    pub record_count: u64,
    /// Sequence of the newest stored record (0 when empty)
    pub last_sequence: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_ms();
        Self {
            room_id: room_id.to_string(),
            record_count: 0,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable journal store on RocksDB.
pub struct RocksJournalStore {
    /// Single-threaded column family map; writes per room are serialized by the relay
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksJournalStore {
    /// Open (or create) the store at the configured path.
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

        log::info!("Opened journal store at {}", config.path.display());
        Ok(Self { db, config })
    }

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
            CF_JOURNAL => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for `room_id`, if anything was ever stored for it.
    pub fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(RoomMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn room_prefix(room_id: &str) -> Result<Vec<u8>, StoreError> {
        let len = u16::try_from(room_id.len())
            .map_err(|_| StoreError::InvalidKey(format!("room id of {} bytes", room_id.len())))?;
        let mut key = Vec::with_capacity(2 + room_id.len() + 8);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(room_id.as_bytes());
        Ok(key)
    }

    fn record_key(room_id: &str, sequence: u64) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::room_prefix(room_id)?;
        key.extend_from_slice(&sequence.to_be_bytes());
        Ok(key)
    }
}

impl JournalStore for RocksJournalStore {
    fn persist(&self, room_id: &str, record: &ReplayRecord) -> Result<(), StoreError> {
        let cf_journal = self.cf(CF_JOURNAL)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let mut meta = self
            .load_metadata(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id));
        let expected = meta.last_sequence + 1;
        if record.sequence != expected {
            return Err(StoreError::OutOfOrder {
                room_id: room_id.to_string(),
                expected,
                got: record.sequence,
            });
        }
        meta.record_count += 1;
        meta.last_sequence = record.sequence;
        meta.updated_at = now_ms();

        let bytes = record
            .encode()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);

        // Record and metadata land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_journal, Self::record_key(room_id, record.sequence)?, &compressed);
        batch.put_cf(cf_rooms, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_all(&self, room_id: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        let cf = self.cf(CF_JOURNAL)?;
        let start = Self::record_key(room_id, FIRST_SEQUENCE)?;
        let prefix_len = start.len() - 8;

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != start.len() || key[..prefix_len] != start[..prefix_len] {
                break;
            }

            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let record = ReplayRecord::decode(&bytes)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            records.push(record);
        }

        log::debug!("Loaded {} records for room '{room_id}'", records.len());
        Ok(records)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rooms.push(id);
        }
        Ok(rooms)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
