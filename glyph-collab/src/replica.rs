//! Peer-side replica: authors operations for [`ReplicatedDocument`].
//!
//! Every edit runs in its own yrs transaction under the peer's client id,
//! and the transaction's update becomes the payload of the next operation.
//! Remote operations and bootstrap snapshots are merged back in, so later
//! edits are positioned against everything the peer has seen.
//!
//! [`ReplicatedDocument`]: crate::document::ReplicatedDocument

use serde_json::Value;
use std::collections::BTreeMap;
use yrs::types::{Map, MapRef};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Options, Text, TextRef, Transact, Update};

use crate::codec;
use crate::document::{self, DocumentError, DocumentSnapshot, FIELDS, TEXT};
use crate::operation::{Operation, PeerId};

pub struct Replica {
    origin: PeerId,
    doc: Doc,
    fields: MapRef,
    text: TextRef,
    next_sequence: u64,
}

impl Replica {
    pub fn new(origin: PeerId) -> Self {
        let doc = Doc::with_options(Options::with_client_id(document::client_id(origin)));
        let fields = doc.get_or_insert_map(FIELDS);
        let text = doc.get_or_insert_text(TEXT);
        Self {
            origin,
            doc,
            fields,
            text,
            next_sequence: 1,
        }
    }

    pub fn origin(&self) -> PeerId {
        self.origin
    }

    /// Sequence the next authored operation will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Continue numbering at `sequence`, e.g. after reconnecting.
    pub fn resume_at(&mut self, sequence: u64) {
        self.next_sequence = sequence.max(1);
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<Operation, DocumentError> {
        let canonical = codec::canonicalize(value)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            self.fields.insert(&mut txn, key, canonical);
            txn.encode_update_v1()
        };
        Ok(self.author(&update))
    }

    pub fn remove(&mut self, key: &str) -> Operation {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.fields.remove(&mut txn, key);
            txn.encode_update_v1()
        };
        self.author(&update)
    }

    /// Insert `chunk` at char `index`, clamped to the end of the text.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Operation {
        let update = {
            let mut txn = self.doc.transact_mut();
            let index = index.min(self.text.len(&txn));
            self.text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.author(&update)
    }

    /// Delete up to `len` chars starting at `index`.
    pub fn delete(&mut self, index: u32, len: u32) -> Operation {
        let update = {
            let mut txn = self.doc.transact_mut();
            let total = self.text.len(&txn);
            let index = index.min(total);
            let len = len.min(total - index);
            if len > 0 {
                self.text.remove_range(&mut txn, index, len);
            }
            txn.encode_update_v1()
        };
        self.author(&update)
    }

    /// Merge an operation received from the relay, including our own echoes.
    pub fn receive(&mut self, op: &Operation) -> Result<(), DocumentError> {
        let update = document::decode_update(&op.payload)?;
        self.merge(update)
    }

    /// Catch up from a bootstrap snapshot.
    pub fn load(&mut self, snapshot: &DocumentSnapshot) -> Result<(), DocumentError> {
        let bytes = hex::decode(&snapshot.state)
            .map_err(|e| DocumentError::InvalidOperation(format!("state is not hex: {e}")))?;
        let update = Update::decode_v1(&bytes)
            .map_err(|e| DocumentError::InvalidOperation(format!("undecodable state: {e}")))?;
        self.merge(update)
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn fields(&self) -> BTreeMap<String, Value> {
        let txn = self.doc.transact();
        document::read_fields(&self.fields, &txn)
    }

    fn merge(&mut self, update: Update) -> Result<(), DocumentError> {
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::InvalidOperation(e.to_string()))
    }

    fn author(&mut self, update: &[u8]) -> Operation {
        let op = Operation::new(self.origin, self.next_sequence, document::update_payload(update));
        self.next_sequence += 1;
        op
    }
}
