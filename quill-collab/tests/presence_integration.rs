//! Presence integration tests.
//!
//! Verifies:
//! - Sessions learn each other's name, color, and cursor
//! - Closing a session announces its departure
//! - Quiet sessions renew their presence; vanished sessions expire

use quill_collab::presence::color_for;
use quill_collab::{
    Awareness, CollabConfig, CursorRange, DocumentSession, LocalHub, MemoryStore, PresenceState,
    SyncMessage, Transport,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

fn open(hub: &Arc<LocalHub>, name: &str) -> DocumentSession {
    DocumentSession::open(
        "script",
        name,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        CollabConfig::for_testing(),
    )
}

async fn until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_sessions_see_each_other() {
    let hub = Arc::new(LocalHub::new());
    let alice = open(&hub, "alice");
    let bob = open(&hub, "bob");

    until(|| alice.awareness().remote_count() == 1 && bob.awareness().remote_count() == 1).await;

    let seen = bob.awareness().get(&alice.session_id()).unwrap();
    assert_eq!(seen.name, "alice");
    assert_eq!(seen.color, color_for(alice.session_id()));
    assert_eq!(seen.cursor, None);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_cursor_moves_propagate() {
    let hub = Arc::new(LocalHub::new());
    let alice = open(&hub, "alice");
    let bob = open(&hub, "bob");
    until(|| bob.awareness().remote_count() == 1).await;

    alice.doc().push("CLOSE ON: a clock");
    alice.awareness().set_local_cursor(Some(CursorRange { anchor: 10, head: 17 }));

    let id = alice.session_id();
    until(|| {
        bob.awareness()
            .get(&id)
            .and_then(|s| s.cursor)
            .is_some_and(|c| c == CursorRange { anchor: 10, head: 17 })
    })
    .await;

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_close_announces_departure() {
    let hub = Arc::new(LocalHub::new());
    let alice = open(&hub, "alice");
    let bob = open(&hub, "bob");
    until(|| bob.awareness().remote_count() == 1).await;

    alice.close().await.unwrap();
    until(|| bob.awareness().remote_count() == 0).await;
    bob.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_quiet_sessions_renew_presence() {
    let hub = Arc::new(LocalHub::new());
    let alice = open(&hub, "alice");
    let bob = open(&hub, "bob");
    until(|| alice.awareness().remote_count() == 1 && bob.awareness().remote_count() == 1).await;

    // Well past the 2 s presence timeout, with no edits at all
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(alice.awareness().remote_count(), 1);
    assert_eq!(bob.awareness().remote_count(), 1);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_vanished_session_expires() {
    let hub = Arc::new(LocalHub::new());
    let bob = open(&hub, "bob");
    bob.wait_connected().await.unwrap();

    // A peer that announces itself once and then goes silent without leaving
    let ghost_id = Uuid::new_v4();
    let ghost = Awareness::new(ghost_id);
    ghost.set_local_state(PresenceState::new("ghost", ghost_id));
    let subscription = hub.subscribe("script").await.unwrap();
    subscription
        .sink
        .send(&SyncMessage::presence_update(ghost_id, &ghost.encode_full().unwrap()))
        .unwrap();

    until(|| bob.awareness().get(&ghost_id).is_some()).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(bob.awareness().get(&ghost_id).is_none());
    assert_eq!(bob.awareness().remote_count(), 0);

    drop(subscription);
    bob.close().await.unwrap();
}
