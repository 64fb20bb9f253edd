//! In-process journal store. Used when no storage path is configured and
//! in tests; contents do not survive a restart.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{JournalStore, StoreError};
use crate::journal::{ReplayRecord, FIRST_SEQUENCE};

#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    rooms: RwLock<HashMap<String, Vec<ReplayRecord>>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for `room_id`.
    pub fn record_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .map(|rooms| rooms.get(room_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl JournalStore for MemoryJournalStore {
    fn persist(&self, room_id: &str, record: &ReplayRecord) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().map_err(poisoned)?;
        let records = rooms.entry(room_id.to_string()).or_default();

        let expected = FIRST_SEQUENCE + records.len() as u64;
        if record.sequence != expected {
            return Err(StoreError::OutOfOrder {
                room_id: room_id.to_string(),
                expected,
                got: record.sequence,
            });
        }
        records.push(record.clone());
        Ok(())
    }

    fn load_all(&self, room_id: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        let rooms = self.rooms.read().map_err(poisoned)?;
        Ok(rooms.get(room_id).cloned().unwrap_or_default())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.read().map_err(poisoned)?;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::ReplayJournal;
    use crate::operation::Operation;
    use serde_json::json;
    use uuid::Uuid;

    fn journal(n: u64) -> ReplayJournal {
        let peer = Uuid::new_v4();
        let mut journal = ReplayJournal::new();
        for i in 1..=n {
            journal
                .append(&Operation::new(peer, i, json!({"op": "set", "key": "k", "value": i})))
                .unwrap();
        }
        journal
    }

    #[test]
    fn test_persist_and_load() {
        let store = MemoryJournalStore::new();
        let source = journal(5);
        for record in source.records() {
            store.persist("room", record).unwrap();
        }

        let loaded = store.load_all("room").unwrap();
        assert_eq!(loaded, source.records());
        assert_eq!(store.record_count("room"), 5);
        assert!(store.load_all("other").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_gap_and_rewrite() {
        let store = MemoryJournalStore::new();
        let source = journal(3);
        let records = source.records();

        let err = store.persist("room", &records[1]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { expected: 1, got: 2, .. }));

        store.persist("room", &records[0]).unwrap();
        let err = store.persist("room", &records[0]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { expected: 2, got: 1, .. }));
        assert_eq!(store.record_count("room"), 1);
    }

    #[test]
    fn test_list_rooms() {
        let store = MemoryJournalStore::new();
        let source = journal(1);
        store.persist("b", &source.records()[0]).unwrap();
        store.persist("a", &source.records()[0]).unwrap();
        assert_eq!(store.list_rooms().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
