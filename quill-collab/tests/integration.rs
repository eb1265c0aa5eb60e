//! End-to-end replication tests.
//!
//! Verifies:
//! - Sessions converge over the in-process hub and over the WebSocket hub
//! - A peer that is already up to date costs zero document updates
//! - Edits made on both sides while offline converge after reconnect
//! - Remote edits are neither re-broadcast nor re-persisted

use quill_collab::hub::{HubConfig, HubServer};
use quill_collab::{
    CollabConfig, DocumentSession, LocalHub, MemoryStore, RelayState, Transport, WsTransport,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(doc_id: &str, name: &str, store: &Arc<MemoryStore>, transport: Arc<dyn Transport>) -> DocumentSession {
    DocumentSession::open(doc_id, name, store.clone(), transport, CollabConfig::for_testing())
}

/// Wait until every session shows the same text of `len` characters.
async fn converge(sessions: &[&DocumentSession], len: u32) {
    let check = async {
        loop {
            let first = sessions[0].doc().text();
            if sessions[0].doc().len() == len && sessions.iter().all(|s| s.doc().text() == first) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(Duration::from_secs(5), check).await.is_err() {
        let texts: Vec<String> = sessions.iter().map(|s| s.doc().text()).collect();
        panic!("Sessions did not converge: {texts:?}");
    }
}

/// Start a hub on an ephemeral port and return its address.
async fn start_test_hub() -> String {
    let hub = HubServer::bind(HubConfig::for_testing()).await.unwrap();
    let addr = hub.local_addr().unwrap();
    tokio::spawn(hub.run());
    format!("ws://{addr}")
}

// ─── In-process hub ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_late_joiner_receives_existing_text() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(LocalHub::new());

    let alice = open("script", "alice", &store, hub.clone());
    alice.wait_connected().await.unwrap();
    alice.doc().push("EXT. BEACH - SUNSET");

    // Bob shares no store with Alice, so the text can only arrive over the hub
    let bob = open("script", "bob", &Arc::new(MemoryStore::new()), hub.clone());
    converge(&[&alice, &bob], 19).await;

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(LocalHub::new());
    let sessions: Vec<DocumentSession> = ["alice", "bob", "carol"]
        .iter()
        .map(|name| open("script", name, &store, hub.clone()))
        .collect();
    for s in &sessions {
        s.wait_connected().await.unwrap();
    }

    for (i, s) in sessions.iter().enumerate() {
        for _ in 0..5 {
            s.doc().insert(0, &i.to_string());
        }
    }

    let refs: Vec<&DocumentSession> = sessions.iter().collect();
    converge(&refs, 15).await;
    for s in sessions {
        s.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_up_to_date_peer_costs_no_updates() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(LocalHub::new());
    let alice = open("script", "alice", &store, hub.clone());
    let bob = open("script", "bob", &store, hub.clone());
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();

    alice.doc().push("same everywhere");
    converge(&[&alice, &bob], 15).await;
    // Let presence settle so both sides know a peer is present
    tokio::time::sleep(Duration::from_millis(100)).await;

    let updates = (alice.relay_stats().updates_sent, bob.relay_stats().updates_sent);
    let requests = alice.relay_stats().requests_sent + bob.relay_stats().requests_sent;

    // Several resync rounds pass without any document traffic
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(alice.relay_stats().requests_sent + bob.relay_stats().requests_sent > requests);
    assert_eq!(
        (alice.relay_stats().updates_sent, bob.relay_stats().updates_sent),
        updates
    );

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_offline_edits_converge_after_reconnect() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(LocalHub::new());
    let alice = open("script", "alice", &store, hub.clone());
    let bob = open("script", "bob", &store, hub.clone());
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();

    alice.doc().push("shared ");
    converge(&[&alice, &bob], 7).await;

    hub.set_online(false);
    timeout(Duration::from_secs(1), async {
        while alice.state().relay == RelayState::Connected || bob.state().relay == RelayState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Disjoint edits on both sides while nobody can hear them
    alice.doc().push("alice ");
    bob.doc().insert(0, "bob ");
    assert_ne!(alice.doc().text(), bob.doc().text());

    hub.set_online(true);
    converge(&[&alice, &bob], 17).await;
    let text = alice.doc().text();
    assert!(text.contains("alice") && text.contains("bob") && text.contains("shared"));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_edits_not_rebroadcast_or_repersisted() {
    let alice_store = Arc::new(MemoryStore::new());
    let bob_store = Arc::new(MemoryStore::new());
    let hub = Arc::new(LocalHub::new());
    let alice = open("script", "alice", &alice_store, hub.clone());
    let bob = open("script", "bob", &bob_store, hub.clone());
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();

    alice.doc().push("only alice saves this");
    converge(&[&alice, &bob], 21).await;
    alice.flush().await.unwrap();
    bob.flush().await.unwrap();

    assert_eq!(alice_store.append_count(), 1);
    assert_eq!(bob_store.append_count(), 0);
    assert_eq!(bob.relay_stats().updates_sent, 0);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

// ─── WebSocket hub ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_websocket_sessions_converge() {
    let url = start_test_hub().await;
    let store = Arc::new(MemoryStore::new());

    let alice = open("script", "alice", &store, Arc::new(WsTransport::new(&url)));
    let bob = open("script", "bob", &store, Arc::new(WsTransport::new(&url)));
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();

    alice.doc().push("INT. ");
    bob.doc().push("SUBMARINE");
    converge(&[&alice, &bob], 14).await;

    // Presence crossed the hub too
    timeout(Duration::from_secs(2), async {
        while alice.awareness().remote_count() == 0 || bob.awareness().remote_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_websocket_channels_isolated() {
    let url = start_test_hub().await;
    let store = Arc::new(MemoryStore::new());

    let one = open("script-1", "alice", &store, Arc::new(WsTransport::new(&url)));
    let two = open("script-2", "bob", &store, Arc::new(WsTransport::new(&url)));
    one.wait_connected().await.unwrap();
    two.wait_connected().await.unwrap();

    one.doc().push("private");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(two.doc().is_empty());

    one.close().await.unwrap();
    two.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_hub_keeps_editing_locally() {
    let store = Arc::new(MemoryStore::new());
    let transport = WsTransport::new("ws://127.0.0.1:1").with_timeout(Duration::from_millis(200));
    let session = open("script", "alice", &store, Arc::new(transport));
    session.wait_loaded().await.unwrap();

    session.doc().push("still works");
    assert_eq!(session.doc().text(), "still works");
    assert_ne!(session.state().relay, RelayState::Connected);

    let report = session.close().await.unwrap();
    assert_eq!(report.flushed, 1);
}
