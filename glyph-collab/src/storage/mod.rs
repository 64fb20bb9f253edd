//! Durable storage for room journals.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   persist(record)   ┌──────────────────┐
//! │  RoomRelay  │ ──────────────────► │  JournalStore    │
//! │ (in-memory) │                     │  Memory | Rocks  │
//! └──────┬──────┘                     └────────┬─────────┘
//!        │ first join                          │ column families
//!        ▼                                     ▼
//! ┌─────────────┐  load_all(room)   ┌────────────────────────────────┐
//! │ rehydrate   │ ◄──────────────── │ CF "journal" - records (LZ4)   │
//! │ document    │                   │ CF "rooms"   - room metadata   │
//! └─────────────┘                   └────────────────────────────────┘
//! ```
//!
//! Records are written in journal order and read back in journal order;
//! a store refuses a record that would leave a gap.

pub mod memory;
pub mod rocks;

pub use memory::MemoryJournalStore;
pub use rocks::{RocksJournalStore, RoomMetadata, StoreConfig};

use crate::journal::ReplayRecord;

/// Backing store for room journals.
///
/// Calls for one room are serialized by the caller; different rooms may
/// be written concurrently.
pub trait JournalStore: Send + Sync {
    /// Durably append `record` to the journal of `room_id`.
    fn persist(&self, room_id: &str, record: &ReplayRecord) -> Result<(), StoreError>;

    /// Every stored record of `room_id`, ascending by sequence.
    fn load_all(&self, room_id: &str) -> Result<Vec<ReplayRecord>, StoreError>;

    /// Rooms with at least one stored record.
    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Record would leave a gap or overwrite history
    OutOfOrder {
        room_id: String,
        expected: u64,
        got: u64,
    },
    /// Room id cannot be used as a key
    InvalidKey(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::OutOfOrder {
                room_id,
                expected,
                got,
            } => write!(
                f,
                "Out-of-order record for room '{room_id}': expected sequence {expected}, got {got}"
            ),
            StoreError::InvalidKey(e) => write!(f, "Invalid key: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
