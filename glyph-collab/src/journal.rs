//! Append-only replay journal for a room's document.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ReplayJournal                    │
//! │                                              │
//! │  [ rec 1 | rec 2 | rec 3 | ... | rec N ]     │
//! │    seq is gapless, starts at 1               │
//! │                                              │
//! │  rec = canonical payload + content hash      │
//! │        + record hash (seq, origin, content)  │
//! │  snapshot_hash = H(rec1 ‖ rec2 ‖ … ‖ recN)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The journal is the source of truth for rehydration; the document
//! snapshot is a derived cache. Payloads are stored canonicalized so a
//! replay does not depend on the producer's key order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::operation::{Operation, PeerId};

/// First sequence number assigned by a journal.
pub const FIRST_SEQUENCE: u64 = 1;

/// A single journaled operation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Position in the room's journal
    pub sequence: u64,
    /// Peer that produced the operation
    pub origin: PeerId,
    /// The producer's own sequence for the operation
    pub origin_sequence: u64,
    /// `canonicalize(op.payload)`
    pub canonical_payload: String,
    /// `hash(op.payload)`
    pub content_hash: String,
    /// Digest binding position and authorship to the content
    pub record_hash: String,
}

impl ReplayRecord {
    fn build(sequence: u64, op: &Operation) -> Result<Self, JournalError> {
        let canonical_payload = codec::canonicalize(&op.payload)?;
        let content_hash = codec::digest(&canonical_payload);
        let record_hash = Self::bind(sequence, op.origin, op.sequence, &content_hash);
        Ok(Self {
            sequence,
            origin: op.origin,
            origin_sequence: op.sequence,
            canonical_payload,
            content_hash,
            record_hash,
        })
    }

    fn bind(sequence: u64, origin: PeerId, origin_sequence: u64, content_hash: &str) -> String {
        codec::digest(&format!("{sequence}:{origin}:{origin_sequence}:{content_hash}"))
    }

    /// Check both stored hashes against the record's fields.
    pub fn verify(&self) -> bool {
        codec::digest(&self.canonical_payload) == self.content_hash
            && Self::bind(self.sequence, self.origin, self.origin_sequence, &self.content_hash)
                == self.record_hash
    }

    /// Decode the canonical payload.
    pub fn payload(&self) -> Result<Value, CodecError> {
        codec::decode(&self.canonical_payload)
    }

    /// Rebuild the operation this record was appended from.
    ///
    /// The producer timestamp is not journaled and comes back as 0.
    pub fn to_operation(&self) -> Result<Operation, CodecError> {
        Ok(Operation {
            origin: self.origin,
            sequence: self.origin_sequence,
            payload: self.payload()?,
            timestamp: 0,
        })
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| JournalError::Serialization(e.to_string()))
    }

    /// Deserialize from storage.
    pub fn decode(bytes: &[u8]) -> Result<Self, JournalError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| JournalError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Journal errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    /// An externally supplied sequence is not the next one
    #[error("sequence conflict: expected {expected}, got {got}")]
    SequenceConflict { expected: u64, got: u64 },
    /// Stored hash does not match the payload
    #[error("integrity mismatch at sequence {sequence}")]
    IntegrityMismatch { sequence: u64 },
    #[error(transparent)]
    Encoding(#[from] CodecError),
    #[error("journal serialization error: {0}")]
    Serialization(String),
    #[error("journal deserialization error: {0}")]
    Deserialization(String),
}

/// Ordered, gapless, append-only record of accepted operations.
#[derive(Debug, Clone, Default)]
pub struct ReplayJournal {
    records: Vec<ReplayRecord>,
}

impl ReplayJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a journal from persisted records (must be in order).
    pub fn from_records(
        records: impl IntoIterator<Item = ReplayRecord>,
    ) -> Result<Self, JournalError> {
        let mut journal = Self::new();
        for record in records {
            journal.import(record)?;
        }
        Ok(journal)
    }

    /// Build the record the next append would produce, without appending.
    ///
    /// Hand it back through [`import`](Self::import) once it is durable.
    pub fn stage(&self, op: &Operation) -> Result<ReplayRecord, JournalError> {
        ReplayRecord::build(self.next_sequence(), op)
    }

    /// Append an operation, self-assigning the next sequence.
    pub fn append(&mut self, op: &Operation) -> Result<&ReplayRecord, JournalError> {
        let record = ReplayRecord::build(self.next_sequence(), op)?;
        Ok(self.push(record))
    }

    /// Append an operation at an externally supplied sequence.
    pub fn append_at(&mut self, sequence: u64, op: &Operation) -> Result<&ReplayRecord, JournalError> {
        self.check_next(sequence)?;
        self.append(op)
    }

    /// Adopt an already-built record, e.g. one loaded from storage.
    pub fn import(&mut self, record: ReplayRecord) -> Result<&ReplayRecord, JournalError> {
        self.check_next(record.sequence)?;
        if !record.verify() {
            return Err(JournalError::IntegrityMismatch {
                sequence: record.sequence,
            });
        }
        Ok(self.push(record))
    }

    fn check_next(&self, sequence: u64) -> Result<(), JournalError> {
        let expected = self.next_sequence();
        if sequence != expected {
            return Err(JournalError::SequenceConflict {
                expected,
                got: sequence,
            });
        }
        Ok(())
    }

    fn push(&mut self, record: ReplayRecord) -> &ReplayRecord {
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    /// Records with `sequence >= from`, ascending.
    ///
    /// The iterator borrows the journal and can be cloned to restart.
    pub fn read_from(&self, from: u64) -> ReplayIter<'_> {
        let start = from.saturating_sub(FIRST_SEQUENCE).min(self.records.len() as u64) as usize;
        ReplayIter {
            inner: self.records[start..].iter(),
        }
    }

    /// Hash over the ordered concatenation of all record hashes.
    pub fn snapshot_hash(&self) -> String {
        let mut joined = String::with_capacity(self.records.len() * codec::DIGEST_LEN);
        for record in &self.records {
            joined.push_str(&record.record_hash);
        }
        codec::digest(&joined)
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        FIRST_SEQUENCE + self.records.len() as u64
    }

    /// Sequence of the newest record (0 when empty).
    pub fn last_sequence(&self) -> u64 {
        self.records.last().map_or(0, |r| r.sequence)
    }

    pub fn get(&self, sequence: u64) -> Option<&ReplayRecord> {
        let index = sequence.checked_sub(FIRST_SEQUENCE)?;
        self.records.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }
}

/// Lazy, finite, restartable view over journal records.
#[derive(Debug, Clone)]
pub struct ReplayIter<'a> {
    inner: std::slice::Iter<'a, ReplayRecord>,
}

impl<'a> Iterator for ReplayIter<'a> {
    type Item = &'a ReplayRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ReplayIter<'_> {}
