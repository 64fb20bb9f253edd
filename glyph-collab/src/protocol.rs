//! Binary wire protocol between peers and the sync server.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client                                   server
//!   │ Hello { peer }                          │
//!   │ Join { room, last_known_sequence } ───► │
//!   │ ◄─── Bootstrap { snapshot | diff }      │
//!   │ Submit { operation } ─────────────────► │
//!   │ ◄─── Update { record }  (every member)  │
//!   │ ◄─── Rejected { code }  (submitter only)│
//!   │ Signal ◄──────────────────────────────► │ Signal
//! ```
//!
//! Structured values (payloads, snapshots) travel as canonical JSON text,
//! since bincode is not self-describing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::document::{Bootstrap, DocumentError, DocumentSnapshot};
use crate::journal::ReplayRecord;
use crate::operation::{PeerId, WireOperation};
use crate::room::{PeerInfo, RelayError, RoomId};
use crate::signaling::{SignalMessage, SignalingError};

/// Peer -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection
    Hello { peer: PeerInfo },
    Join {
        room_id: RoomId,
        last_known_sequence: Option<u64>,
    },
    Submit { operation: WireOperation },
    Leave,
    Signal(SignalMessage),
    Ping,
}

/// Server -> peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome { peer_id: PeerId },
    Bootstrap {
        room_id: RoomId,
        bootstrap: WireBootstrap,
        members: Vec<PeerInfo>,
    },
    Update { room_id: RoomId, record: ReplayRecord },
    PeerJoined { room_id: RoomId, peer: PeerInfo },
    PeerLeft { room_id: RoomId, peer_id: PeerId },
    Rejected { code: RejectCode, message: String },
    Signal(SignalMessage),
    Pong,
}

/// Bootstrap as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBootstrap {
    /// `snapshot_json` is the canonical JSON of a [`DocumentSnapshot`]
    Snapshot { sequence: u64, snapshot_json: String },
    Diff { since: u64, records: Vec<ReplayRecord> },
}

impl WireBootstrap {
    pub fn from_bootstrap(bootstrap: &Bootstrap) -> Result<Self, ProtocolError> {
        Ok(match bootstrap {
            Bootstrap::Snapshot { sequence, snapshot } => WireBootstrap::Snapshot {
                sequence: *sequence,
                snapshot_json: codec::canonicalize(snapshot.as_ref())
                    .map_err(|e| ProtocolError::SerializationError(e.to_string()))?,
            },
            Bootstrap::Diff { since, records } => WireBootstrap::Diff {
                since: *since,
                records: records.clone(),
            },
        })
    }

    /// Decoded snapshot, or `None` for a diff.
    pub fn snapshot(&self) -> Result<Option<DocumentSnapshot>, ProtocolError> {
        match self {
            WireBootstrap::Snapshot { snapshot_json, .. } => serde_json::from_str(snapshot_json)
                .map(Some)
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
            WireBootstrap::Diff { .. } => Ok(None),
        }
    }

    /// Journal sequence reached after applying this bootstrap.
    pub fn sequence(&self) -> u64 {
        match self {
            WireBootstrap::Snapshot { sequence, .. } => *sequence,
            WireBootstrap::Diff { since, records } => records.last().map_or(*since, |r| r.sequence),
        }
    }
}

/// Why a client message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// Frame could not be decoded
    Malformed,
    /// No `Hello` yet
    NotIdentified,
    /// Submit or leave without a joined room
    NotJoined,
    AlreadyJoined,
    RoomFull,
    /// Operation origin is not the connected peer
    OriginMismatch,
    InvalidOperation,
    SessionConflict,
    PeerUnavailable,
    /// The store failed; nothing was applied and the operation may be resubmitted
    NotPersisted,
    Internal,
}

impl From<&RelayError> for RejectCode {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::RoomFull { .. } => RejectCode::RoomFull,
            RelayError::NotJoined { .. } | RelayError::RoomNotFound(_) => RejectCode::NotJoined,
            RelayError::Document(DocumentError::InvalidOperation(_)) => RejectCode::InvalidOperation,
            RelayError::Store(_) => RejectCode::NotPersisted,
            RelayError::Document(_) | RelayError::Journal(_) => RejectCode::Internal,
        }
    }
}

impl From<&SignalingError> for RejectCode {
    fn from(err: &SignalingError) -> Self {
        match err {
            SignalingError::SessionConflict { .. } => RejectCode::SessionConflict,
            SignalingError::PeerUnavailable { .. } => RejectCode::PeerUnavailable,
            SignalingError::MissingCallee { .. } | SignalingError::SelfCall { .. } => {
                RejectCode::Malformed
            }
        }
    }
}

impl ServerMessage {
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        ServerMessage::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
