//! Sync relay: keeps one document replica converged with its peers.
//!
//! ```text
//!  attach:    subscribe(doc id) ──► sync-request(sv) ──► own presence
//!
//!  inbound:   sync-request(sv)  ──► sync-update(diff_since(sv))   if non-empty
//!                               ──► sync-request(own sv)          if peer is ahead
//!                               ──► own presence
//!             sync-update       ──► doc.apply(Remote)
//!             presence-update   ──► awareness.apply_update(Remote)
//!
//!  outbound:  DocChange(Local)       ──► sync-update
//!             AwarenessChange(Local) ──► presence-update (changed sessions only)
//!             resync tick            ──► sync-request     if peers are present
//! ```
//!
//! The relay never re-broadcasts anything it did not originate: changes
//! tagged [`Origin::Remote`] or [`Origin::DbLoad`] stay local, and messages
//! carrying this session's id are dropped as echoes. Lost or duplicated
//! messages are repaired by the next handshake since applying an update is
//! idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::doc::{CollabDoc, DocChange, DocError};
use crate::origin::Origin;
use crate::presence::{Awareness, AwarenessChange, AwarenessError, SessionId};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::transport::{ChannelSink, Transport, TransportError};

/// Connection state of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Connected => "connected",
        })
    }
}

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Sending requires a confirmed subscription.
    NotConnected,
    Transport(TransportError),
    Protocol(ProtocolError),
    Doc(DocError),
    Awareness(AwarenessError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::NotConnected => write!(f, "Relay is not connected"),
            RelayError::Transport(e) => write!(f, "{e}"),
            RelayError::Protocol(e) => write!(f, "{e}"),
            RelayError::Doc(e) => write!(f, "{e}"),
            RelayError::Awareness(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<TransportError> for RelayError {
    fn from(e: TransportError) -> Self {
        RelayError::Transport(e)
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::Protocol(e)
    }
}

impl From<DocError> for RelayError {
    fn from(e: DocError) -> Self {
        RelayError::Doc(e)
    }
}

impl From<AwarenessError> for RelayError {
    fn from(e: AwarenessError) -> Self {
        RelayError::Awareness(e)
    }
}

/// Relay counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub requests_sent: u64,
    pub updates_sent: u64,
    pub presence_sent: u64,
    pub messages_received: u64,
    pub echoes_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Live counters, shared with the session handle.
#[derive(Debug, Default)]
pub struct RelayCounters {
    requests_sent: AtomicU64,
    updates_sent: AtomicU64,
    presence_sent: AtomicU64,
    messages_received: AtomicU64,
    echoes_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            presence_sent: self.presence_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            echoes_dropped: self.echoes_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn record_sent(&self, message: &SyncMessage) {
        let counter = match message.event {
            MessageType::SyncRequest => &self.requests_sent,
            MessageType::SyncUpdate => &self.updates_sent,
            MessageType::PresenceUpdate => &self.presence_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
    }
}

/// Replicates one document over one transport channel.
pub struct SyncRelay {
    channel: String,
    doc: CollabDoc,
    awareness: Awareness,
    transport: Arc<dyn Transport>,
    sink: Option<Arc<dyn ChannelSink>>,
    state: RelayState,
    counters: Arc<RelayCounters>,
}

impl SyncRelay {
    /// Create a detached relay for `channel` (the document id).
    pub fn new(
        channel: impl Into<String>,
        doc: CollabDoc,
        awareness: Awareness,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            channel: channel.into(),
            doc,
            awareness,
            transport,
            sink: None,
            state: RelayState::Disconnected,
            counters: Arc::new(RelayCounters::default()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn session_id(&self) -> SessionId {
        self.awareness.local_id()
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == RelayState::Connected
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<RelayCounters> {
        Arc::clone(&self.counters)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Subscribe to the document channel and start the handshake.
    ///
    /// Returns the inbound stream; when it yields `None` the subscription is
    /// gone and the caller should [`mark_disconnected`](Self::mark_disconnected)
    /// and attach again.
    pub async fn attach(&mut self) -> Result<mpsc::Receiver<SyncMessage>, RelayError> {
        self.state = RelayState::Connecting;
        let subscription = match self.transport.subscribe(&self.channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.state = RelayState::Disconnected;
                log::warn!("Subscribing to {} failed: {e}", self.channel);
                return Err(e.into());
            }
        };

        self.sink = Some(subscription.sink);
        self.state = RelayState::Connected;
        log::info!("Session {} attached to {}", self.session_id(), self.channel);

        self.send_sync_request()?;
        self.send_local_presence()?;
        Ok(subscription.inbound)
    }

    /// Drop the subscription after a transport failure.
    pub fn mark_disconnected(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.unsubscribe();
        }
        if self.state != RelayState::Disconnected {
            log::warn!("Session {} lost {}", self.session_id(), self.channel);
        }
        self.state = RelayState::Disconnected;
    }

    /// Announce the local session's departure and unsubscribe.
    pub fn detach(&mut self) {
        let session = self.session_id();
        self.awareness.clear_local_state();
        if self.is_connected() {
            match self.awareness.encode_update(&[session]) {
                Ok(records) => {
                    let _ = self.send(SyncMessage::presence_update(session, &records));
                }
                Err(e) => log::warn!("Encoding departure of {session} failed: {e}"),
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.unsubscribe();
        }
        self.state = RelayState::Disconnected;
        log::info!("Session {session} detached from {}", self.channel);
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn send(&mut self, message: SyncMessage) -> Result<(), RelayError> {
        let Some(sink) = self.sink.clone().filter(|_| self.is_connected()) else {
            return Err(RelayError::NotConnected);
        };
        match sink.send(&message) {
            Ok(()) => {
                self.counters.record_sent(&message);
                log::trace!("{} → {} ({} bytes)", message.event, self.channel, message.payload.len());
                Ok(())
            }
            Err(e) => {
                log::warn!("Sending {} on {} failed: {e}", message.event, self.channel);
                self.mark_disconnected();
                Err(e.into())
            }
        }
    }

    fn send_sync_request(&mut self) -> Result<(), RelayError> {
        let message = SyncMessage::sync_request(self.session_id(), &self.doc.state_vector());
        self.send(message)
    }

    fn send_local_presence(&mut self) -> Result<(), RelayError> {
        let session = self.session_id();
        if self.awareness.clock(&session).is_none() {
            return Ok(());
        }
        let records = self.awareness.encode_update(&[session])?;
        self.send(SyncMessage::presence_update(session, &records))
    }

    /// Broadcast a local document change. Returns whether it was sent.
    pub fn on_doc_change(&mut self, change: &DocChange) -> Result<bool, RelayError> {
        if !change.origin.should_broadcast() || !self.is_connected() {
            return Ok(false);
        }
        self.send(SyncMessage::sync_update(self.session_id(), &change.update))?;
        Ok(true)
    }

    /// Broadcast the records touched by a local presence change.
    pub fn on_awareness_change(&mut self, change: &AwarenessChange) -> Result<bool, RelayError> {
        if change.origin != Origin::Local || !self.is_connected() {
            return Ok(false);
        }
        let records = self.awareness.encode_update(&change.changed())?;
        self.send(SyncMessage::presence_update(self.session_id(), &records))?;
        Ok(true)
    }

    /// Re-issue the sync request if anyone else is around.
    pub fn resync_tick(&mut self) -> Result<bool, RelayError> {
        if !self.is_connected() || self.awareness.remote_count() == 0 {
            return Ok(false);
        }
        log::debug!("Resync on {}", self.channel);
        self.send_sync_request()?;
        Ok(true)
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    /// Process one message received on the channel.
    pub fn handle_message(&mut self, message: &SyncMessage) -> Result<(), RelayError> {
        if message.sender == self.session_id() {
            self.counters.echoes_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        log::trace!("{} ← {} from {}", message.event, self.channel, message.sender);

        let payload = message.payload_bytes()?;
        match message.event {
            MessageType::SyncRequest => {
                if let Some(delta) = self.doc.diff_since(&payload)? {
                    self.send(SyncMessage::sync_update(self.session_id(), &delta))?;
                }
                if self.doc.is_behind(&payload)? {
                    self.send_sync_request()?;
                }
                self.send_local_presence()
            }
            MessageType::SyncUpdate => {
                self.doc.apply(&payload, Origin::Remote)?;
                Ok(())
            }
            MessageType::PresenceUpdate => {
                self.awareness.apply_update(&payload, Origin::Remote)?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for SyncRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRelay")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceState;
    use crate::transport::local::LocalHub;
    use std::time::Duration;
    use uuid::Uuid;

    fn relay(hub: &LocalHub, name: &str) -> SyncRelay {
        let session = Uuid::new_v4();
        let awareness = Awareness::new(session);
        awareness.set_local_state(PresenceState::new(name, session));
        SyncRelay::new("doc-1", CollabDoc::new(), awareness, Arc::new(hub.clone()))
    }

    async fn next(rx: &mut mpsc::Receiver<SyncMessage>) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("subscription ended")
    }

    /// Deliver every queued message until both sides go quiet.
    async fn pump(a: &mut SyncRelay, rx_a: &mut mpsc::Receiver<SyncMessage>, b: &mut SyncRelay, rx_b: &mut mpsc::Receiver<SyncMessage>) {
        loop {
            let mut progressed = false;
            while let Ok(Some(m)) = tokio::time::timeout(Duration::from_millis(50), rx_a.recv()).await {
                a.handle_message(&m).unwrap();
                progressed = true;
            }
            while let Ok(Some(m)) = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await {
                b.handle_message(&m).unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_attach_sends_request_and_presence() {
        let hub = LocalHub::new();
        let mut observer = relay(&hub, "observer");
        let mut rx = observer.attach().await.unwrap();

        let mut alice = relay(&hub, "alice");
        let _alice_rx = alice.attach().await.unwrap();
        assert!(alice.is_connected());

        assert_eq!(next(&mut rx).await.event, MessageType::SyncRequest);
        assert_eq!(next(&mut rx).await.event, MessageType::PresenceUpdate);
        assert_eq!(alice.stats().requests_sent, 1);
        assert_eq!(alice.stats().presence_sent, 1);
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_disconnected() {
        let hub = LocalHub::new();
        hub.set_online(false);
        let mut alice = relay(&hub, "alice");
        assert!(alice.attach().await.is_err());
        assert_eq!(alice.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn test_local_change_broadcast_remote_change_not() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let _rx = alice.attach().await.unwrap();

        let update = alice.doc.push("x").unwrap();
        let local = DocChange { update: update.clone(), origin: Origin::Local };
        assert!(alice.on_doc_change(&local).unwrap());
        for origin in [Origin::Remote, Origin::DbLoad] {
            let change = DocChange { update: update.clone(), origin };
            assert!(!alice.on_doc_change(&change).unwrap());
        }
        assert_eq!(alice.stats().updates_sent, 1);
    }

    #[tokio::test]
    async fn test_handshake_converges_and_up_to_date_peer_costs_nothing() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let mut bob = relay(&hub, "bob");
        alice.doc.push("INT. OFFICE - DAY");

        let mut rx_a = alice.attach().await.unwrap();
        let mut rx_b = bob.attach().await.unwrap();
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;

        assert_eq!(bob.doc.text(), "INT. OFFICE - DAY");
        assert_eq!(alice.awareness.remote_count(), 1);
        assert_eq!(bob.awareness.remote_count(), 1);

        // Both replicas are now equal, so a resync round sends no updates
        let before = (alice.stats().updates_sent, bob.stats().updates_sent);
        assert!(bob.resync_tick().unwrap());
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;
        assert_eq!((alice.stats().updates_sent, bob.stats().updates_sent), before);
    }

    #[tokio::test]
    async fn test_reciprocal_request_pulls_peer_edits() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let mut bob = relay(&hub, "bob");
        let mut rx_a = alice.attach().await.unwrap();
        let mut rx_b = bob.attach().await.unwrap();
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;

        // Bob edits while nobody hears him
        hub.drop_next(1);
        let update = bob.doc.push("offline line").unwrap();
        bob.on_doc_change(&DocChange { update, origin: Origin::Local }).unwrap();
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;
        assert!(alice.doc.is_empty());

        // Bob's request shows Alice she is behind, so she asks back
        let requests = alice.stats().requests_sent;
        assert!(bob.resync_tick().unwrap());
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;
        assert_eq!(alice.stats().requests_sent, requests + 1);
        assert_eq!(alice.doc.text(), "offline line");
    }

    #[tokio::test]
    async fn test_own_echo_dropped() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let _rx = alice.attach().await.unwrap();

        let echo = SyncMessage::sync_update(alice.session_id(), &CollabDoc::new().push("x").unwrap());
        alice.handle_message(&echo).unwrap();
        assert!(alice.doc.is_empty());
        assert_eq!(alice.stats().echoes_dropped, 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let _rx = alice.attach().await.unwrap();

        let bogus = SyncMessage {
            event: MessageType::SyncUpdate,
            sender: Uuid::new_v4(),
            payload: "!!not base64!!".into(),
        };
        assert!(matches!(alice.handle_message(&bogus), Err(RelayError::Protocol(_))));
        assert!(alice.doc.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_marks_disconnected() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let _rx = alice.attach().await.unwrap();

        hub.set_online(false);
        let update = alice.doc.push("x").unwrap();
        let result = alice.on_doc_change(&DocChange { update, origin: Origin::Local });
        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert_eq!(alice.state(), RelayState::Disconnected);

        // Edits keep applying locally while disconnected
        assert!(alice.doc.push("y").is_some());
        assert_eq!(alice.doc.text(), "xy");
    }

    #[tokio::test]
    async fn test_resync_requires_peers() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let _rx = alice.attach().await.unwrap();
        assert!(!alice.resync_tick().unwrap());
    }

    #[tokio::test]
    async fn test_detach_announces_departure() {
        let hub = LocalHub::new();
        let mut alice = relay(&hub, "alice");
        let mut bob = relay(&hub, "bob");
        let mut rx_a = alice.attach().await.unwrap();
        let mut rx_b = bob.attach().await.unwrap();
        pump(&mut alice, &mut rx_a, &mut bob, &mut rx_b).await;
        assert_eq!(bob.awareness.remote_count(), 1);

        alice.detach();
        while let Ok(Some(m)) = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await {
            bob.handle_message(&m).unwrap();
        }
        assert_eq!(bob.awareness.remote_count(), 0);
        assert_eq!(alice.state(), RelayState::Disconnected);
        assert_eq!(hub.subscriber_count("doc-1").await, 1);
    }
}
