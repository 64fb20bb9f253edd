//! Operations: atomic edits submitted by peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

use crate::codec::{self, CodecError};

/// Peer identifier.
pub type PeerId = Uuid;

/// One transport connection of a peer; a reconnect gets a new id.
pub type ConnectionId = u64;

/// An atomic edit against a shared document.
///
/// `(origin, sequence)` identifies the operation. `timestamp` is the
/// producer's wall clock and is never used for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub origin: PeerId,
    /// Monotonic per-origin counter
    pub sequence: u64,
    pub payload: Value,
    /// Milliseconds since the Unix epoch (advisory)
    pub timestamp: u64,
}

impl Operation {
    pub fn new(origin: PeerId, sequence: u64, payload: Value) -> Self {
        Self {
            origin,
            sequence,
            payload,
            timestamp: now_ms(),
        }
    }

    /// Identity used for idempotent merge.
    pub fn id(&self) -> (PeerId, u64) {
        (self.origin, self.sequence)
    }
}

/// Operation as carried on the binary wire.
///
/// The payload travels as JSON text because the binary encoding cannot
/// carry self-describing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    pub origin: PeerId,
    pub sequence: u64,
    pub payload: String,
    pub timestamp: u64,
}

impl WireOperation {
    pub fn from_operation(op: &Operation) -> Result<Self, CodecError> {
        Ok(Self {
            origin: op.origin,
            sequence: op.sequence,
            payload: codec::canonicalize(&op.payload)?,
            timestamp: op.timestamp,
        })
    }

    pub fn into_operation(self) -> Result<Operation, CodecError> {
        Ok(Operation {
            origin: self.origin,
            sequence: self.sequence,
            payload: codec::decode(&self.payload)?,
            timestamp: self.timestamp,
        })
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
