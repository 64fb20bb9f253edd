//! Replicated document: commutative, idempotent merge of peer operations.
//!
//! The document is a yrs `Doc` holding two shared types:
//!
//! ```text
//! "fields"  MapRef   key -> canonical JSON of the value
//! "text"    TextRef  collaborative text
//! ```
//!
//! Peers never send positions for the relay to interpret. Each peer edits
//! its own replica (see [`crate::replica::Replica`]) under a yrs client id
//! derived from its peer id, and submits the resulting update:
//!
//! ```text
//! {"op":"update","update":"<hex of a yrs v1 update>"}
//! ```
//!
//! An update records the neighbours its author saw, so merge order does not
//! matter: updates whose dependencies have not arrived stay pending inside
//! yrs and integrate once they do.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use yrs::types::{Map, MapRef};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, TextRef, Transact, Update};

use crate::codec::{self, CodecError};
use crate::journal::{ReplayJournal, ReplayRecord, FIRST_SEQUENCE};
use crate::operation::{Operation, PeerId};

/// Root map of the document.
pub const FIELDS: &str = "fields";
/// Root text of the document.
pub const TEXT: &str = "text";

/// yrs client ids stay within 53 bits so JavaScript peers can hold them.
const CLIENT_ID_MASK: u64 = (1 << 53) - 1;

/// yrs client id a peer authors its edits under.
pub fn client_id(origin: PeerId) -> u64 {
    let (hi, lo) = origin.as_u64_pair();
    (hi ^ lo) & CLIENT_ID_MASK
}

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Malformed payload; rejected before any state change
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A journal record failed its integrity check during rehydration
    #[error("corrupted journal record at sequence {sequence}")]
    Corrupted { sequence: u64 },
    #[error(transparent)]
    Encoding(#[from] CodecError),
}

/// Materialized document state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Visible map entries
    pub fields: BTreeMap<String, Value>,
    /// Visible text
    pub text: String,
    /// Hex of the full yrs state; a replica loads it to keep editing
    pub state: String,
    /// Number of operations merged so far
    pub version: u64,
}

/// Result of [`ReplicatedDocument::apply`].
#[derive(Debug, Clone)]
pub enum Applied {
    /// The operation took effect
    Merged(Arc<DocumentSnapshot>),
    /// `(origin, sequence)` was already merged; nothing changed
    Duplicate,
}

/// What a joining peer needs to reach the current state.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    /// Full materialized state as of journal `sequence`
    Snapshot {
        sequence: u64,
        snapshot: Arc<DocumentSnapshot>,
    },
    /// Records after `since`, in journal order
    Diff {
        since: u64,
        records: Vec<ReplayRecord>,
    },
}

impl Bootstrap {
    /// Journal sequence the peer is at after applying this bootstrap.
    pub fn sequence(&self) -> u64 {
        match self {
            Bootstrap::Snapshot { sequence, .. } => *sequence,
            Bootstrap::Diff { since, records } => records.last().map_or(*since, |r| r.sequence),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Edit {
    Update { update: String },
}

/// Payload carrying a yrs v1 update.
pub(crate) fn update_payload(update: &[u8]) -> Value {
    serde_json::json!({"op": "update", "update": hex::encode(update)})
}

/// Parse and decode an update payload without touching any document.
pub(crate) fn decode_update(payload: &Value) -> Result<Update, DocumentError> {
    let Edit::Update { update } =
        Edit::deserialize(payload).map_err(|e| DocumentError::InvalidOperation(e.to_string()))?;
    let bytes = hex::decode(&update)
        .map_err(|e| DocumentError::InvalidOperation(format!("update is not hex: {e}")))?;
    Update::decode_v1(&bytes)
        .map_err(|e| DocumentError::InvalidOperation(format!("undecodable update: {e}")))
}

/// Read a map value back into JSON; values written by other tools stay strings.
pub(crate) fn read_fields<T: ReadTxn>(fields: &MapRef, txn: &T) -> BTreeMap<String, Value> {
    fields
        .iter(txn)
        .map(|(key, value)| {
            let raw = value.to_string(txn);
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key.to_string(), value)
        })
        .collect()
}

/// An operation validated against a document but not merged yet.
pub struct Prepared {
    origin: PeerId,
    sequence: u64,
    update: Update,
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("origin", &self.origin)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Per-origin record of merged sequences: everything `<= floor` plus `ahead`.
#[derive(Debug, Clone, Default)]
struct SeenSet {
    floor: u64,
    ahead: BTreeSet<u64>,
}

impl SeenSet {
    fn contains(&self, seq: u64) -> bool {
        seq <= self.floor || self.ahead.contains(&seq)
    }

    fn insert(&mut self, seq: u64) {
        if self.contains(seq) {
            return;
        }
        self.ahead.insert(seq);
        while self.ahead.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

/// Authoritative merged state for one room.
pub struct ReplicatedDocument {
    doc: Doc,
    fields: MapRef,
    text: TextRef,
    seen: BTreeMap<PeerId, SeenSet>,
    version: u64,
    snapshot: Arc<DocumentSnapshot>,
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("version", &self.version)
            .field("origins", &self.seen.len())
            .finish()
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let fields = doc.get_or_insert_map(FIELDS);
        let text = doc.get_or_insert_text(TEXT);
        Self {
            doc,
            fields,
            text,
            seen: BTreeMap::new(),
            version: 0,
            snapshot: Arc::new(DocumentSnapshot::default()),
        }
    }

    /// Merge one operation into the document.
    ///
    /// Safe to call with duplicates and with operations from different
    /// origins in any order. A malformed payload, or an update carrying
    /// content of another client, is rejected before anything changes.
    pub fn apply(&mut self, op: &Operation) -> Result<Applied, DocumentError> {
        match self.prepare(op)? {
            Some(prepared) => Ok(Applied::Merged(self.commit(prepared))),
            None => Ok(Applied::Duplicate),
        }
    }

    /// Validate `op` without changing anything; `None` for a duplicate.
    ///
    /// Whatever else the caller does with the operation (journaling,
    /// persisting) can happen between this and [`commit`](Self::commit).
    pub fn prepare(&self, op: &Operation) -> Result<Option<Prepared>, DocumentError> {
        if op.sequence == 0 {
            return Err(DocumentError::InvalidOperation(
                "operation sequences start at 1".into(),
            ));
        }
        let update = decode_update(&op.payload)?;

        let author = client_id(op.origin);
        if let Some(other) = update.state_vector().iter().map(|(c, _)| *c).find(|c| *c != author) {
            return Err(DocumentError::InvalidOperation(format!(
                "update carries content of client {other}, origin is client {author}"
            )));
        }

        if self.has_applied(op.origin, op.sequence) {
            return Ok(None);
        }
        Ok(Some(Prepared {
            origin: op.origin,
            sequence: op.sequence,
            update,
        }))
    }

    /// Merge a prepared operation and return the new snapshot.
    pub fn commit(&mut self, prepared: Prepared) -> Arc<DocumentSnapshot> {
        self.integrate(prepared);
        self.refresh();
        self.snapshot.clone()
    }

    /// Rebuild a document from scratch by replaying the journal in order.
    pub fn rehydrate(journal: &ReplayJournal) -> Result<Self, DocumentError> {
        let mut doc = Self::new();
        for record in journal.read_from(FIRST_SEQUENCE) {
            if !record.verify() {
                return Err(DocumentError::Corrupted {
                    sequence: record.sequence,
                });
            }
            let op = record.to_operation()?;
            if let Some(prepared) = doc.prepare(&op)? {
                doc.integrate(prepared);
            }
        }
        doc.refresh();
        log::debug!(
            "Rehydrated document from {} records (version {})",
            journal.len(),
            doc.version
        );
        Ok(doc)
    }

    /// Minimal catch-up for a peer that last saw journal `since`.
    ///
    /// Falls back to a full snapshot when the peer claims a sequence the
    /// journal never reached, or when the diff would exceed `max_records`.
    pub fn diff_since(&self, journal: &ReplayJournal, since: u64, max_records: usize) -> Bootstrap {
        let last = journal.last_sequence();
        if since > last || (last - since) as usize > max_records {
            return Bootstrap::Snapshot {
                sequence: last,
                snapshot: self.snapshot.clone(),
            };
        }
        Bootstrap::Diff {
            since,
            records: journal.read_from(since + 1).cloned().collect(),
        }
    }

    /// Current materialized state.
    pub fn snapshot(&self) -> Arc<DocumentSnapshot> {
        self.snapshot.clone()
    }

    /// Convergence check: equal for replicas that merged the same operations.
    pub fn state_hash(&self) -> String {
        // The yrs encoding depends on block layout, so only visible state counts.
        let view = (&self.snapshot.fields, &self.snapshot.text);
        codec::hash(&view).unwrap_or_default()
    }

    pub fn has_applied(&self, origin: PeerId, sequence: u64) -> bool {
        self.seen.get(&origin).is_some_and(|s| s.contains(sequence))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn text(&self) -> &str {
        &self.snapshot.text
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.snapshot.fields.get(key)
    }

    /// Merge without rebuilding the snapshot.
    fn integrate(&mut self, prepared: Prepared) {
        let Prepared {
            origin,
            sequence,
            update,
        } = prepared;
        {
            let mut txn = self.doc.transact_mut();
            // Decoded and authorship-checked already; whatever yrs could not
            // integrate stays out of the state on every replay alike.
            if let Err(e) = txn.apply_update(update) {
                log::warn!("Update {origin}:{sequence} only partially integrated: {e}");
            }
        }
        self.seen.entry(origin).or_default().insert(sequence);
        self.version += 1;
    }

    fn refresh(&mut self) {
        let txn = self.doc.transact();
        let fields = read_fields(&self.fields, &txn);
        let text = self.text.get_string(&txn);
        let state = hex::encode(txn.encode_state_as_update_v1(&StateVector::default()));

        self.snapshot = Arc::new(DocumentSnapshot {
            fields,
            text,
            state,
            version: self.version,
        });
    }
}
