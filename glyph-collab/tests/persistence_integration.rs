//! Persistence integration tests: journals written through the relay
//! survive restarts and rehydrate to the same document state.

use futures_util::{SinkExt, StreamExt};
use glyph_collab::document::Bootstrap;
use glyph_collab::operation::WireOperation;
use glyph_collab::protocol::{ClientMessage, ServerMessage, WireBootstrap};
use glyph_collab::replica::Replica;
use glyph_collab::room::{PeerInfo, RelayConfig, RoomRelay, Submitted};
use glyph_collab::server::{ServerConfig, SyncServer};
use glyph_collab::storage::{JournalStore, RocksJournalStore, StoreConfig};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{timeout, Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn peer(name: &str) -> PeerInfo {
    PeerInfo {
        peer_id: Uuid::new_v4(),
        name: name.into(),
    }
}

fn store_at(path: &std::path::Path) -> RocksJournalStore {
    RocksJournalStore::open(StoreConfig {
        path: path.to_path_buf(),
        ..StoreConfig::for_testing(path)
    })
    .unwrap()
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(store: Arc<dyn JournalStore>) -> (tokio::task::JoinHandle<()>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, store);
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (handle, format!("ws://127.0.0.1:{port}"))
}

/// Send one message, then wait for the first reply matching `pred`.
async fn exchange(ws: &mut Ws, msg: ClientMessage, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Should receive a message within timeout")
            .expect("stream open")
            .unwrap();
        if let Message::Binary(data) = frame {
            let msg = ServerMessage::decode(&data).unwrap();
            if pred(&msg) {
                return msg;
            }
        }
    }
}

#[tokio::test]
async fn test_relay_state_survives_store_reopen() {
    let dir = tempdir().unwrap();
    let alice = peer("Alice");

    let (state_hash, journal_hash) = {
        let store = Arc::new(store_at(dir.path()));
        let relay = RoomRelay::new(store, RelayConfig::default());
        relay.join("scene", alice.clone(), None).await.unwrap();

        let mut replica = Replica::new(alice.peer_id);
        let ops = [
            replica.insert(0, "hello"),
            replica.set("title", &json!("Scene A")).unwrap(),
            replica.set("camera", &json!({"fov": 60, "z": -4.5})).unwrap(),
            replica.remove("camera"),
        ];
        for op in ops {
            assert!(matches!(
                relay.submit("scene", op).await.unwrap(),
                Submitted::Committed(_)
            ));
        }
        relay.hashes("scene").await.unwrap()
        // relay and store dropped here
    };

    let store = Arc::new(store_at(dir.path()));
    assert_eq!(store.list_rooms().unwrap(), vec!["scene".to_string()]);
    assert_eq!(store.load_all("scene").unwrap().len(), 4);

    let relay = RoomRelay::new(store, RelayConfig::default());
    let membership = relay.join("scene", peer("Bob"), None).await.unwrap();
    assert_eq!(membership.bootstrap.sequence(), 4);

    let snapshot = relay.snapshot("scene").await.unwrap();
    assert_eq!(snapshot.text, "hello");
    assert_eq!(snapshot.fields.get("title"), Some(&json!("Scene A")));
    assert!(snapshot.fields.get("camera").is_none());
    assert_eq!(relay.hashes("scene").await.unwrap(), (state_hash, journal_hash));
}

#[tokio::test]
async fn test_sequences_continue_after_reopen() {
    let dir = tempdir().unwrap();
    let alice = peer("Alice");

    let mut replica = Replica::new(alice.peer_id);
    let ops: Vec<_> = (1..=3).map(|n| replica.set("n", &json!(n)).unwrap()).collect();
    {
        let relay = RoomRelay::new(Arc::new(store_at(dir.path())), RelayConfig::default());
        relay.join("doc", alice.clone(), None).await.unwrap();
        for op in &ops {
            relay.submit("doc", op.clone()).await.unwrap();
        }
    }

    let relay = RoomRelay::new(Arc::new(store_at(dir.path())), RelayConfig::default());
    relay.join("doc", alice.clone(), None).await.unwrap();

    // Resubmitting a journaled op is recognized after rehydration
    assert!(matches!(relay.submit("doc", ops[2].clone()).await.unwrap(), Submitted::Duplicate));

    let op = replica.set("n", &json!(4)).unwrap();
    let Submitted::Committed(record) = relay.submit("doc", op).await.unwrap() else {
        panic!("expected commit");
    };
    assert_eq!(record.sequence, 4);

    let Bootstrap::Diff { records, .. } = relay.bootstrap("doc", 0).await.unwrap() else {
        panic!("expected diff");
    };
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_server_restart_serves_rehydrated_snapshot() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn JournalStore> = Arc::new(store_at(dir.path()));
    let alice = peer("Alice");

    // First server instance: edit over the wire
    let (handle, url) = start_server(store.clone()).await;
    let (mut ws, _) = connect_async(&url).await.unwrap();
    exchange(&mut ws, ClientMessage::Hello { peer: alice.clone() }, |m| {
        matches!(m, ServerMessage::Welcome { .. })
    })
    .await;
    exchange(
        &mut ws,
        ClientMessage::Join {
            room_id: "scene".into(),
            last_known_sequence: None,
        },
        |m| matches!(m, ServerMessage::Bootstrap { .. }),
    )
    .await;
    let mut replica = Replica::new(alice.peer_id);
    for op in [replica.insert(0, "persisted"), replica.set("lights", &json!(3)).unwrap()] {
        exchange(
            &mut ws,
            ClientMessage::Submit {
                operation: WireOperation::from_operation(&op).unwrap(),
            },
            |m| matches!(m, ServerMessage::Update { .. }),
        )
        .await;
    }
    ws.close(None).await.unwrap();
    handle.abort();

    // Second instance on the same store starts cold
    let (_handle, url) = start_server(store).await;
    let (mut ws, _) = connect_async(&url).await.unwrap();
    exchange(&mut ws, ClientMessage::Hello { peer: peer("Bob") }, |m| {
        matches!(m, ServerMessage::Welcome { .. })
    })
    .await;
    let ServerMessage::Bootstrap { bootstrap, .. } = exchange(
        &mut ws,
        ClientMessage::Join {
            room_id: "scene".into(),
            last_known_sequence: None,
        },
        |m| matches!(m, ServerMessage::Bootstrap { .. }),
    )
    .await
    else {
        unreachable!()
    };

    assert!(matches!(bootstrap, WireBootstrap::Snapshot { sequence: 2, .. }));
    let snapshot = bootstrap.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.text, "persisted");
    assert_eq!(snapshot.fields.get("lights"), Some(&json!(3)));
    assert_eq!(snapshot.version, 2);
}
