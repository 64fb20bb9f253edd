//! Room membership and fan-out of committed operations.
//!
//! ```text
//!            submit(op)
//! peer ──────────────────► Room (Mutex) ──► validate ──► persist ──► merge + journal
//!                              │
//!                              └── broadcast::Sender<Arc<RoomEvent>>
//!                                     │        │        │
//!                                   peer A   peer B   peer C   (submitter included)
//! ```
//!
//! Every room has its own mutex and broadcast channel; the relay-wide map
//! lock is held only to find, create or remove a room. Sending under the
//! room mutex means all members observe updates in journal order.
//!
//! Room lifecycle: `Empty -> Active` on first join, `Active -> Empty` on
//! last leave. An empty room is dropped from memory; its journal stays in
//! the [`JournalStore`] and is replayed on the next join.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::document::{Bootstrap, DocumentError, DocumentSnapshot, ReplicatedDocument};
use crate::journal::{JournalError, ReplayJournal, ReplayRecord};
use crate::operation::{now_ms, ConnectionId, Operation, PeerId};
use crate::storage::{JournalStore, StoreError};

pub type RoomId = String;

/// A room member as seen by the other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub name: String,
}

/// Event fanned out to every member of a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A committed operation, in journal order
    Update(ReplayRecord),
    PeerJoined(PeerInfo),
    PeerLeft(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Active { members: usize },
}

/// Handed to a peer on join.
#[derive(Debug)]
pub struct Membership {
    pub bootstrap: Bootstrap,
    /// Subscribed before the bootstrap was taken, so no update is missed
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
    /// Members present after the join, including the joiner
    pub members: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    Committed(ReplayRecord),
    /// Already merged earlier; nothing journaled or broadcast
    Duplicate,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Events buffered per member before it starts lagging (default: 256)
    pub broadcast_capacity: usize,
    /// Default: 100
    pub max_members_per_room: usize,
    /// Largest diff served to a rejoining peer before falling back to a snapshot (default: 1024)
    pub max_diff_records: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_members_per_room: 100,
            max_diff_records: 1024,
        }
    }
}

impl RelayConfig {
    /// Tiny channel and diff window so lag and snapshot paths are reachable.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 8,
            max_members_per_room: 8,
            max_diff_records: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("room '{room_id}' is full ({limit} members)")]
    RoomFull { room_id: RoomId, limit: usize },
    #[error("peer {peer_id} has not joined room '{room_id}'")]
    NotJoined { room_id: RoomId, peer_id: PeerId },
    #[error("room '{0}' not found")]
    RoomNotFound(RoomId),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Relay statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub rooms_loaded: u64,
    pub operations_committed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub persist_failures: u64,
    pub events_sent: u64,
}

/// Hot-path counters; read through [`RoomRelay::stats`].
#[derive(Default)]
struct AtomicRelayStats {
    rooms_loaded: AtomicU64,
    operations_committed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    persist_failures: AtomicU64,
    events_sent: AtomicU64,
}

struct Member {
    info: PeerInfo,
    /// Connection that joined last; `None` when joined without one
    connection: Option<ConnectionId>,
}

struct Room {
    id: RoomId,
    members: HashMap<PeerId, Member>,
    document: ReplicatedDocument,
    journal: ReplayJournal,
    events: broadcast::Sender<Arc<RoomEvent>>,
    /// Journal replayed from the store
    loaded: bool,
    /// Removed from the relay; joiners must look the room up again
    closed: bool,
}

impl Room {
    fn new(id: &str, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            id: id.to_string(),
            members: HashMap::new(),
            document: ReplicatedDocument::new(),
            journal: ReplayJournal::new(),
            events,
            loaded: false,
            closed: false,
        }
    }

    fn load(&mut self, store: &dyn JournalStore) -> Result<(), RelayError> {
        let records = store.load_all(&self.id)?;
        let journal = ReplayJournal::from_records(records)?;
        let document = ReplicatedDocument::rehydrate(&journal)?;
        log::info!(
            "Room '{}' rehydrated: {} records, state {}",
            self.id,
            journal.len(),
            document.state_hash()
        );
        self.journal = journal;
        self.document = document;
        self.loaded = true;
        Ok(())
    }

    /// Returns the number of receivers reached.
    fn send(&self, event: RoomEvent) -> usize {
        // No receivers is not an error: the room may be between members.
        self.events.send(Arc::new(event)).unwrap_or(0)
    }

    fn bootstrap(&self, since: Option<u64>, max_diff_records: usize) -> Bootstrap {
        match since {
            Some(sequence) => self
                .document
                .diff_since(&self.journal, sequence, max_diff_records),
            None => Bootstrap::Snapshot {
                sequence: self.journal.last_sequence(),
                snapshot: self.document.snapshot(),
            },
        }
    }

    fn state(&self) -> RoomState {
        if self.members.is_empty() {
            RoomState::Empty
        } else {
            RoomState::Active {
                members: self.members.len(),
            }
        }
    }
}

/// Owns every active room.
pub struct RoomRelay {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    store: Arc<dyn JournalStore>,
    config: RelayConfig,
    stats: AtomicRelayStats,
}

impl RoomRelay {
    pub fn new(store: Arc<dyn JournalStore>, config: RelayConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
            stats: AtomicRelayStats::default(),
        }
    }

    /// Register `peer` in `room_id`, creating and rehydrating the room if needed.
    ///
    /// With `last_known_sequence` the bootstrap is a diff where possible,
    /// otherwise a full snapshot.
    pub async fn join(
        &self,
        room_id: &str,
        peer: PeerInfo,
        last_known_sequence: Option<u64>,
    ) -> Result<Membership, RelayError> {
        self.join_on(room_id, peer, None, last_known_sequence).await
    }

    /// [`join`](Self::join) from a specific connection.
    ///
    /// Rejoining from a new connection moves the membership to it, so a
    /// later [`leave_on`](Self::leave_on) from the old one is ignored.
    pub async fn join_on(
        &self,
        room_id: &str,
        peer: PeerInfo,
        connection: Option<ConnectionId>,
        last_known_sequence: Option<u64>,
    ) -> Result<Membership, RelayError> {
        loop {
            let room = self.get_or_create(room_id).await;
            let mut guard = room.lock().await;
            if guard.closed {
                // Lost a race with the last leave; the map is about to drop it
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }

            if !guard.loaded {
                if let Err(e) = guard.load(self.store.as_ref()) {
                    log::error!("Failed to rehydrate room '{room_id}': {e}");
                    if guard.members.is_empty() {
                        guard.closed = true;
                        self.remove_room(room_id, &room).await;
                    }
                    return Err(e);
                }
                self.stats.rooms_loaded.fetch_add(1, Ordering::Relaxed);
            }

            let rejoin = guard.members.contains_key(&peer.peer_id);
            if !rejoin && guard.members.len() >= self.config.max_members_per_room {
                return Err(RelayError::RoomFull {
                    room_id: room_id.to_string(),
                    limit: self.config.max_members_per_room,
                });
            }

            let events = guard.events.subscribe();
            let bootstrap = guard.bootstrap(last_known_sequence, self.config.max_diff_records);
            guard.members.insert(
                peer.peer_id,
                Member {
                    info: peer.clone(),
                    connection,
                },
            );
            if !rejoin {
                guard.send(RoomEvent::PeerJoined(peer.clone()));
                self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
            }

            log::info!(
                "Peer {} joined room '{room_id}' ({} members, bootstrap at {})",
                peer.peer_id,
                guard.members.len(),
                bootstrap.sequence()
            );

            return Ok(Membership {
                bootstrap,
                events,
                members: guard.members.values().map(|m| m.info.clone()).collect(),
            });
        }
    }

    /// Validate, persist, merge, journal and broadcast one operation.
    ///
    /// The submitter (`op.origin`) must be a member. Rejected operations,
    /// including ones the store failed to persist, leave the room untouched
    /// and are reported to the caller only.
    pub async fn submit(&self, room_id: &str, mut op: Operation) -> Result<Submitted, RelayError> {
        let room = self
            .find(room_id)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;
        let mut guard = room.lock().await;

        if guard.closed {
            return Err(RelayError::RoomNotFound(room_id.to_string()));
        }
        if !guard.members.contains_key(&op.origin) {
            return Err(RelayError::NotJoined {
                room_id: room_id.to_string(),
                peer_id: op.origin,
            });
        }
        if op.timestamp == 0 {
            op.timestamp = now_ms();
        }

        let prepared = match guard.document.prepare(&op) {
            Ok(Some(prepared)) => prepared,
            Ok(None) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                log::debug!("Duplicate operation {:?} in room '{room_id}'", op.id());
                return Ok(Submitted::Duplicate);
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected operation {:?} in room '{room_id}': {e}", op.id());
                return Err(e.into());
            }
        };

        // Durable before visible: a failed write leaves the room untouched
        // and the submitter may retry the same operation.
        let record = guard.journal.stage(&op)?;
        if let Err(e) = self.store.persist(room_id, &record) {
            self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Failed to persist record {} of room '{room_id}': {e}",
                record.sequence
            );
            return Err(e.into());
        }
        guard.journal.import(record.clone())?;
        guard.document.commit(prepared);

        let reached = guard.send(RoomEvent::Update(record.clone()));
        self.stats.operations_committed.fetch_add(1, Ordering::Relaxed);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Room '{room_id}' committed sequence {} to {reached} members",
            record.sequence
        );

        Ok(Submitted::Committed(record))
    }

    /// Deregister a peer. The last leave drops the room from memory.
    pub async fn leave(&self, room_id: &str, peer_id: PeerId) -> Result<RoomState, RelayError> {
        self.leave_on(room_id, peer_id, None).await
    }

    /// [`leave`](Self::leave) on behalf of `connection`.
    ///
    /// A no-op returning the current state when the peer has since joined
    /// from another connection.
    pub async fn leave_on(
        &self,
        room_id: &str,
        peer_id: PeerId,
        connection: Option<ConnectionId>,
    ) -> Result<RoomState, RelayError> {
        let room = self
            .find(room_id)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;
        let mut guard = room.lock().await;

        let Some(member) = guard.members.get(&peer_id) else {
            return Err(RelayError::NotJoined {
                room_id: room_id.to_string(),
                peer_id,
            });
        };
        if let (Some(leaving), Some(current)) = (connection, member.connection) {
            if leaving != current {
                log::debug!(
                    "Ignoring leave of {peer_id} from stale connection {leaving} (current {current})"
                );
                return Ok(guard.state());
            }
        }
        guard.members.remove(&peer_id);
        guard.send(RoomEvent::PeerLeft(peer_id));
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);

        let state = guard.state();
        if state == RoomState::Empty {
            guard.closed = true;
            self.remove_room(room_id, &room).await;
            log::info!("Room '{room_id}' is empty; released");
        } else {
            log::info!("Peer {peer_id} left room '{room_id}'");
        }
        Ok(state)
    }

    /// Catch-up for a member that fell behind the broadcast channel.
    pub async fn bootstrap(&self, room_id: &str, since: u64) -> Result<Bootstrap, RelayError> {
        let room = self
            .find(room_id)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;
        let guard = room.lock().await;
        Ok(guard.bootstrap(Some(since), self.config.max_diff_records))
    }

    pub async fn room_state(&self, room_id: &str) -> RoomState {
        match self.find(room_id).await {
            Some(room) => room.lock().await.state(),
            None => RoomState::Empty,
        }
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        match self.room_state(room_id).await {
            RoomState::Empty => 0,
            RoomState::Active { members } => members,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current document snapshot of an active room.
    pub async fn snapshot(&self, room_id: &str) -> Option<Arc<DocumentSnapshot>> {
        let room = self.find(room_id).await?;
        let guard = room.lock().await;
        Some(guard.document.snapshot())
    }

    /// `(document state hash, journal snapshot hash)` of an active room.
    pub async fn hashes(&self, room_id: &str) -> Option<(String, String)> {
        let room = self.find(room_id).await?;
        let guard = room.lock().await;
        Some((guard.document.state_hash(), guard.journal.snapshot_hash()))
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            rooms_loaded: self.stats.rooms_loaded.load(Ordering::Relaxed),
            operations_committed: self.stats.operations_committed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    async fn find(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        if let Some(room) = self.find(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Mutex::new(Room::new(room_id, self.config.broadcast_capacity)));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Drop `room` from the map unless it was already replaced.
    async fn remove_room(&self, room_id: &str, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Replica;
    use crate::storage::MemoryJournalStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn relay() -> RoomRelay {
        RoomRelay::new(Arc::new(MemoryJournalStore::new()), RelayConfig::default())
    }

    fn peer(name: &str) -> PeerInfo {
        PeerInfo {
            peer_id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn set(replica: &mut Replica, key: &str, value: i64) -> Operation {
        replica.set(key, &json!(value)).unwrap()
    }

    async fn next_update(rx: &mut broadcast::Receiver<Arc<RoomEvent>>) -> ReplayRecord {
        loop {
            match rx.recv().await.unwrap().as_ref() {
                RoomEvent::Update(record) => return record.clone(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_fan_out_includes_submitter() {
        let relay = relay();
        let (a, b, c) = (peer("a"), peer("b"), peer("c"));
        let mut ma = relay.join("room", a.clone(), None).await.unwrap();
        let mut mb = relay.join("room", b.clone(), None).await.unwrap();
        let mut mc = relay.join("room", c.clone(), None).await.unwrap();
        assert_eq!(mc.members.len(), 3);

        let mut ra = Replica::new(a.peer_id);
        let committed = relay.submit("room", set(&mut ra, "x", 1)).await.unwrap();
        let Submitted::Committed(record) = committed else {
            panic!("expected commit");
        };
        assert_eq!(record.sequence, 1);

        for rx in [&mut ma.events, &mut mb.events, &mut mc.events] {
            let update = next_update(rx).await;
            assert_eq!(update, record);
        }
    }

    #[tokio::test]
    async fn test_updates_arrive_in_journal_order() {
        let relay = relay();
        let a = peer("a");
        let b = peer("b");
        relay.join("room", a.clone(), None).await.unwrap();
        let mut mb = relay.join("room", b.clone(), None).await.unwrap();
        let mut ra = Replica::new(a.peer_id);
        let mut rb = Replica::new(b.peer_id);

        for i in 1..=20 {
            let replica = if i % 2 == 0 { &mut ra } else { &mut rb };
            relay.submit("room", set(replica, "k", i)).await.unwrap();
        }
        for expected in 1..=20 {
            assert_eq!(next_update(&mut mb.events).await.sequence, expected);
        }
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let relay = relay();
        let a = peer("a");
        let b = peer("b");
        assert_eq!(relay.room_state("room").await, RoomState::Empty);

        relay.join("room", a.clone(), None).await.unwrap();
        relay.join("room", b.clone(), None).await.unwrap();
        assert_eq!(relay.room_state("room").await, RoomState::Active { members: 2 });
        assert_eq!(relay.room_count().await, 1);

        assert_eq!(
            relay.leave("room", a.peer_id).await.unwrap(),
            RoomState::Active { members: 1 }
        );
        assert_eq!(relay.leave("room", b.peer_id).await.unwrap(), RoomState::Empty);
        assert_eq!(relay.room_count().await, 0);
        assert!(matches!(
            relay.leave("room", b.peer_id).await,
            Err(RelayError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_room_rehydrates_from_store() {
        let store = Arc::new(MemoryJournalStore::new());
        let relay = RoomRelay::new(store.clone(), RelayConfig::default());
        let a = peer("a");

        let mut ra = Replica::new(a.peer_id);

        relay.join("doc", a.clone(), None).await.unwrap();
        relay.submit("doc", set(&mut ra, "title", 1)).await.unwrap();
        relay.submit("doc", ra.insert(0, "hi")).await.unwrap();
        let (state_before, journal_before) = relay.hashes("doc").await.unwrap();
        relay.leave("doc", a.peer_id).await.unwrap();
        assert_eq!(store.record_count("doc"), 2);

        // Same relay, room rebuilt from the journal
        let membership = relay.join("doc", a.clone(), None).await.unwrap();
        match membership.bootstrap {
            Bootstrap::Snapshot { sequence, snapshot } => {
                assert_eq!(sequence, 2);
                assert_eq!(snapshot.text, "hi");
                assert_eq!(snapshot.fields.get("title"), Some(&json!(1)));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert_eq!(relay.hashes("doc").await.unwrap(), (state_before.clone(), journal_before));

        // A fresh relay over the same store converges too
        let cold = RoomRelay::new(store, RelayConfig::default());
        cold.join("doc", peer("b"), None).await.unwrap();
        assert_eq!(cold.hashes("doc").await.unwrap().0, state_before);
        assert_eq!(cold.stats().rooms_loaded, 1);
    }

    #[tokio::test]
    async fn test_rejoin_with_last_known_sequence_gets_diff() {
        let relay = relay();
        let a = peer("a");
        let b = peer("b");
        let mut ra = Replica::new(a.peer_id);
        relay.join("room", a.clone(), None).await.unwrap();
        for i in 1..=5 {
            relay.submit("room", set(&mut ra, "k", i)).await.unwrap();
        }

        let membership = relay.join("room", b, Some(3)).await.unwrap();
        match membership.bootstrap {
            Bootstrap::Diff { since, records } => {
                assert_eq!(since, 3);
                assert_eq!(records.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![4, 5]);
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_operation_rejected_and_not_broadcast() {
        let relay = relay();
        let a = peer("a");
        let b = peer("b");
        relay.join("room", a.clone(), None).await.unwrap();
        let mut mb = relay.join("room", b.clone(), None).await.unwrap();

        let bad = Operation::new(a.peer_id, 1, json!({"op": "teleport"}));
        let err = relay.submit("room", bad).await.unwrap_err();
        assert!(matches!(err, RelayError::Document(DocumentError::InvalidOperation(_))));

        let mut ra = Replica::new(a.peer_id);
        relay.submit("room", set(&mut ra, "ok", 1)).await.unwrap();
        // b sees only the valid update, at sequence 1
        assert_eq!(next_update(&mut mb.events).await.sequence, 1);
        assert_eq!(relay.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submit() {
        let relay = relay();
        let a = peer("a");
        relay.join("room", a.clone(), None).await.unwrap();
        let op = set(&mut Replica::new(a.peer_id), "k", 1);

        assert!(matches!(relay.submit("room", op.clone()).await.unwrap(), Submitted::Committed(_)));
        assert_eq!(relay.submit("room", op).await.unwrap(), Submitted::Duplicate);
        assert_eq!(relay.stats().operations_committed, 1);
        assert_eq!(relay.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_submit_requires_membership() {
        let relay = relay();
        let a = peer("a");
        let outsider = peer("x");
        relay.join("room", a, None).await.unwrap();

        let mut rx = Replica::new(outsider.peer_id);
        let err = relay.submit("room", set(&mut rx, "k", 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::NotJoined { .. }));

        let err = relay.submit("nowhere", set(&mut rx, "k", 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_room_full() {
        let config = RelayConfig {
            max_members_per_room: 2,
            ..RelayConfig::default()
        };
        let relay = RoomRelay::new(Arc::new(MemoryJournalStore::new()), config);
        let a = peer("a");
        relay.join("room", a.clone(), None).await.unwrap();
        relay.join("room", peer("b"), None).await.unwrap();

        let err = relay.join("room", peer("c"), None).await.unwrap_err();
        assert!(matches!(err, RelayError::RoomFull { limit: 2, .. }));

        // Existing members may rejoin
        relay.join("room", a, Some(0)).await.unwrap();
        assert_eq!(relay.member_count("room").await, 2);
    }

    #[tokio::test]
    async fn test_stale_connection_leave_keeps_member() {
        let relay = relay();
        let a = peer("a");
        let mut ra = Replica::new(a.peer_id);
        relay.join_on("room", a.clone(), Some(1), None).await.unwrap();
        let mut second = relay.join_on("room", a.clone(), Some(2), Some(0)).await.unwrap();

        let state = relay.leave_on("room", a.peer_id, Some(1)).await.unwrap();
        assert_eq!(state, RoomState::Active { members: 1 });
        let committed = relay.submit("room", set(&mut ra, "k", 1)).await.unwrap();
        assert!(matches!(committed, Submitted::Committed(_)));
        assert_eq!(next_update(&mut second.events).await.sequence, 1);

        assert_eq!(relay.leave_on("room", a.peer_id, Some(2)).await.unwrap(), RoomState::Empty);
    }

    #[tokio::test]
    async fn test_membership_events() {
        let relay = relay();
        let a = peer("a");
        let b = peer("b");
        let mut ma = relay.join("room", a.clone(), None).await.unwrap();
        relay.join("room", b.clone(), None).await.unwrap();
        relay.leave("room", b.peer_id).await.unwrap();

        // a sees its own join first, then b's join and leave
        assert_eq!(*ma.events.recv().await.unwrap(), RoomEvent::PeerJoined(a.clone()));
        assert_eq!(*ma.events.recv().await.unwrap(), RoomEvent::PeerJoined(b.clone()));
        assert_eq!(*ma.events.recv().await.unwrap(), RoomEvent::PeerLeft(b.peer_id));
    }

    struct FailingStore;

    impl JournalStore for FailingStore {
        fn persist(&self, _: &str, _: &ReplayRecord) -> Result<(), StoreError> {
            Err(StoreError::DatabaseError("disk full".into()))
        }

        fn load_all(&self, _: &str) -> Result<Vec<ReplayRecord>, StoreError> {
            Ok(Vec::new())
        }

        fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_reach_peers() {
        let relay = RoomRelay::new(Arc::new(FailingStore), RelayConfig::default());
        let a = peer("a");
        let mut ma = relay.join("room", a.clone(), None).await.unwrap();
        let mut ra = Replica::new(a.peer_id);

        let err = relay.submit("room", set(&mut ra, "k", 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
        assert_eq!(relay.stats().persist_failures, 1);
        assert_eq!(relay.stats().operations_committed, 0);

        // Only a's own join is on the channel
        assert_eq!(*ma.events.recv().await.unwrap(), RoomEvent::PeerJoined(a));
        assert!(ma.events.try_recv().is_err());
        let snapshot = relay.snapshot("room").await.unwrap();
        assert!(snapshot.fields.is_empty());
        assert_eq!(snapshot.version, 0);
    }

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStore {
        inner: MemoryJournalStore,
        failures: AtomicUsize,
    }

    impl JournalStore for FlakyStore {
        fn persist(&self, room_id: &str, record: &ReplayRecord) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::DatabaseError("transient".into()));
            }
            self.inner.persist(room_id, record)
        }

        fn load_all(&self, room_id: &str) -> Result<Vec<ReplayRecord>, StoreError> {
            self.inner.load_all(room_id)
        }

        fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_rooms()
        }
    }

    #[tokio::test]
    async fn test_history_survives_transient_persist_failure() {
        let store = Arc::new(FlakyStore {
            inner: MemoryJournalStore::new(),
            failures: AtomicUsize::new(1),
        });
        let relay = RoomRelay::new(store.clone(), RelayConfig::default());
        let a = peer("a");
        let mut ra = Replica::new(a.peer_id);
        relay.join("doc", a.clone(), None).await.unwrap();

        let first = ra.insert(0, "hello");
        assert!(matches!(
            relay.submit("doc", first.clone()).await,
            Err(RelayError::Store(_))
        ));

        // The retry and four more edits all commit, gapless from 1
        let mut sequences = Vec::new();
        for op in [
            first,
            ra.insert(5, " world"),
            set(&mut ra, "n", 1),
            set(&mut ra, "n", 2),
            ra.delete(0, 1),
        ] {
            let Submitted::Committed(record) = relay.submit("doc", op).await.unwrap() else {
                panic!("expected commit");
            };
            sequences.push(record.sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        let before = relay.hashes("doc").await.unwrap();
        relay.leave("doc", a.peer_id).await.unwrap();
        assert_eq!(store.inner.record_count("doc"), 5);

        let membership = relay.join("doc", a, None).await.unwrap();
        let Bootstrap::Snapshot { sequence, snapshot } = membership.bootstrap else {
            panic!("expected snapshot");
        };
        assert_eq!(sequence, 5);
        assert_eq!(snapshot.text, "ello world");
        assert_eq!(snapshot.fields.get("n"), Some(&json!(2)));
        assert_eq!(snapshot.version, 5);
        assert_eq!(relay.hashes("doc").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let relay = Arc::new(relay());
        let mut handles = Vec::new();
        for r in 0..8 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                let room = format!("room-{r}");
                let p = peer("p");
                let mut replica = Replica::new(p.peer_id);
                relay.join(&room, p.clone(), None).await.unwrap();
                for i in 1..=25 {
                    relay.submit(&room, set(&mut replica, "n", i)).await.unwrap();
                }
                relay.snapshot(&room).await.unwrap()
            }));
        }
        for handle in handles {
            let snapshot = handle.await.unwrap();
            assert_eq!(snapshot.fields.get("n"), Some(&json!(25)));
            assert_eq!(snapshot.version, 25);
        }
        assert_eq!(relay.room_count().await, 8);
        assert_eq!(relay.stats().operations_committed, 200);
    }

    #[tokio::test]
    async fn test_concurrent_join_and_leave() {
        let relay = Arc::new(relay());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let p = peer("churn");
                    relay.join("busy", p.clone(), None).await.unwrap();
                    relay.leave("busy", p.peer_id).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(relay.room_state("busy").await, RoomState::Empty);
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_lagged_member_recovers_through_bootstrap() {
        let relay = RoomRelay::new(Arc::new(MemoryJournalStore::new()), RelayConfig::for_testing());
        let a = peer("a");
        let mut membership = relay.join("room", a.clone(), None).await.unwrap();
        let mut ra = Replica::new(a.peer_id);

        for n in 1..=12 {
            relay.submit("room", set(&mut ra, "n", n)).await.unwrap();
        }
        assert!(matches!(
            membership.events.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        // Short gap: diff
        match relay.bootstrap("room", 10).await.unwrap() {
            Bootstrap::Diff { records, .. } => {
                let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
                assert_eq!(sequences, vec![11, 12]);
            }
            other => panic!("expected diff, got {other:?}"),
        }
        // Beyond max_diff_records: snapshot
        assert!(matches!(
            relay.bootstrap("room", 0).await.unwrap(),
            Bootstrap::Snapshot { sequence: 12, .. }
        ));
    }
}
