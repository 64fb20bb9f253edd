//! # glyph-collab - Real-time document sync core
//!
//! Peers edit a shared document per room; the server merges their
//! operations into a CRDT, journals them and fans the result out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │   Peer      │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │   Binary Proto     │ (central)   │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                          ┌────────────────┼─────────────────┐
//!                          ▼                ▼                 ▼
//!                   ┌────────────┐  ┌──────────────┐  ┌──────────────┐
//!                   │ RoomRelay  │  │ Signaling    │  │ JournalStore │
//!                   │ (fan-out)  │  │ Relay (calls)│  │ Memory/Rocks │
//!                   └─────┬──────┘  └──────────────┘  └──────────────┘
//!                         │
//!              ReplicatedDocument + ReplayJournal (per room)
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Canonical JSON serialization and content hashing
//! - [`operation`]: Operations submitted by peers
//! - [`journal`]: Append-only, gapless replay journal
//! - [`document`]: Replicated document (yrs map + text)
//! - [`replica`]: Peer-side replica that authors operations
//! - [`room`]: Room membership and ordered fan-out
//! - [`signaling`]: Offer/answer/candidate relay between call pairs
//! - [`storage`]: Journal persistence (in-memory, RocksDB)
//! - [`protocol`]: Binary wire protocol (bincode)
//! - [`server`]: WebSocket sync server

pub mod codec;
pub mod document;
pub mod journal;
pub mod operation;
pub mod protocol;
pub mod replica;
pub mod room;
pub mod server;
pub mod signaling;
pub mod storage;

// Re-exports for convenience
pub use codec::{canonicalize, hash, CodecError};
pub use document::{Applied, Bootstrap, DocumentError, DocumentSnapshot, Prepared, ReplicatedDocument};
pub use journal::{JournalError, ReplayIter, ReplayJournal, ReplayRecord};
pub use operation::{Operation, PeerId, WireOperation};
pub use protocol::{ClientMessage, ProtocolError, RejectCode, ServerMessage, WireBootstrap};
pub use replica::Replica;
pub use room::{
    Membership, PeerInfo, RelayConfig, RelayError, RelayStats, RoomEvent, RoomId, RoomRelay,
    RoomState, Submitted,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use signaling::{
    CallId, CallState, DropReason, RelayOutcome, SignalKind, SignalMessage, SignalingConfig,
    SignalingError, SignalingRelay,
};
pub use storage::{
    JournalStore, MemoryJournalStore, RocksJournalStore, RoomMetadata, StoreConfig, StoreError,
};
