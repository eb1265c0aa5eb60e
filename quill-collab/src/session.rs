//! Document session: one task per open document.
//!
//! ```text
//!            DocumentSession (handle)              session task
//!  ┌──────────────────────────────────┐    ┌──────────────────────────────────────┐
//!  │ doc()        ── CollabDoc ───────┼───►│ load ─► attach ─► loop select! {     │
//!  │ awareness()  ── Awareness ───────┼───►│   doc change     ─► relay + buffer   │
//!  │ save_state() ◄─ watch ───────────┼────│   inbound msg    ─► relay            │
//!  │ flush()/close() ── Command ──────┼───►│   presence change─► relay            │
//!  └──────────────────────────────────┘    │   debounce       ─► flush            │
//!                                          │   resync / presence / reconnect      │
//!                                          │   command        ─► flush / close    │
//!                                          │ }                                    │
//!                                          └──────────────────────────────────────┘
//! ```
//!
//! The task owns the relay and the persistence engine, so every delta is
//! seen by both in edit order. Editing happens directly on the shared
//! [`CollabDoc`]; the task only reacts to the change stream.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::doc::{CollabDoc, DocChange};
use crate::persistence::{FlushOutcome, PersistError, PersistenceEngine, SaveState};
use crate::presence::{Awareness, AwarenessChange, PresenceState, SessionId};
use crate::protocol::SyncMessage;
use crate::relay::{RelayCounters, RelayState, RelayStats, SyncRelay};
use crate::store::{BackingStore, StoreError};
use crate::transport::Transport;

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session task is gone.
    Closed,
    Persist(PersistError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Closed => write!(f, "Session closed"),
            SessionError::Persist(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<PersistError> for SessionError {
    fn from(e: PersistError) -> Self {
        SessionError::Persist(e)
    }
}

/// Lifecycle flags published by the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub loaded: bool,
    pub relay: RelayState,
}

/// What closing a session did with the buffered edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// Deltas appended by the final flush.
    pub flushed: usize,
    /// Deltas still buffered when the close timeout expired or the flush failed.
    pub dropped: usize,
}

enum Command {
    Flush(oneshot::Sender<Result<FlushOutcome, PersistError>>),
    Close(oneshot::Sender<CloseReport>),
}

/// Handle to an open document.
pub struct DocumentSession {
    document_id: String,
    doc: CollabDoc,
    awareness: Awareness,
    save_state: watch::Receiver<SaveState>,
    state: watch::Receiver<SessionState>,
    relay_counters: Arc<RelayCounters>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl DocumentSession {
    /// Open `document_id`: load it from `store`, then join its channel on
    /// `transport` as `display_name`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(
        document_id: impl Into<String>,
        display_name: impl Into<String>,
        store: Arc<dyn BackingStore>,
        transport: Arc<dyn Transport>,
        config: CollabConfig,
    ) -> Self {
        let document_id = document_id.into();
        let session_id: SessionId = Uuid::new_v4();
        let doc = CollabDoc::new();
        let awareness = Awareness::new(session_id);
        awareness.set_local_state(PresenceState::new(display_name, session_id));

        let persistence = PersistenceEngine::new(
            document_id.clone(),
            store,
            config.persistence.clone(),
            config.retry,
        );
        let relay = SyncRelay::new(document_id.clone(), doc.clone(), awareness.clone(), transport);
        let relay_counters = relay.counters();
        let save_state = persistence.subscribe();
        let (state_tx, state) = watch::channel(SessionState {
            loaded: false,
            relay: RelayState::Disconnected,
        });
        let (commands, command_rx) = mpsc::channel(16);

        let worker = Worker {
            doc_rx: doc.subscribe(),
            awareness_rx: awareness.subscribe(),
            doc: doc.clone(),
            awareness: awareness.clone(),
            relay,
            persistence,
            config,
            state: state_tx,
            inbound: None,
            debounce_at: None,
            reconnect_at: None,
            reconnect_failures: 0,
            load_retry_at: None,
            load_failures: 0,
        };
        let task = tokio::spawn(worker.run(command_rx));
        log::info!("Opened session {session_id} on {document_id}");

        Self {
            document_id,
            doc,
            awareness,
            save_state,
            state,
            relay_counters,
            commands,
            task,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn session_id(&self) -> SessionId {
        self.awareness.local_id()
    }

    /// The replica. Edits made here are broadcast and persisted.
    pub fn doc(&self) -> &CollabDoc {
        &self.doc
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn save_state(&self) -> SaveState {
        *self.save_state.borrow()
    }

    /// Watch the save indicator.
    pub fn subscribe_save_state(&self) -> watch::Receiver<SaveState> {
        self.save_state.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay_counters.snapshot()
    }

    /// Wait until the durable record has been replayed.
    pub async fn wait_loaded(&self) -> Result<(), SessionError> {
        self.wait_for(|s| s.loaded).await
    }

    /// Wait until the relay holds a confirmed subscription.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        self.wait_for(|s| s.relay == RelayState::Connected).await
    }

    async fn wait_for(&self, f: impl FnMut(&SessionState) -> bool) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        state.wait_for(f).await.map(|_| ()).map_err(|_| SessionError::Closed)
    }

    /// Append buffered edits now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<FlushOutcome, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Flush (bounded by the close timeout), announce departure, and stop.
    pub async fn close(self) -> Result<CloseReport, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Close(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        let report = rx.await.map_err(|_| SessionError::Closed)?;
        let _ = self.task.await;
        Ok(report)
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("document_id", &self.document_id)
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ───────────────────────────────────────────────────────────────────
// Session task
// ───────────────────────────────────────────────────────────────────

struct Worker {
    doc_rx: mpsc::UnboundedReceiver<DocChange>,
    awareness_rx: mpsc::UnboundedReceiver<AwarenessChange>,
    doc: CollabDoc,
    awareness: Awareness,
    relay: SyncRelay,
    persistence: PersistenceEngine,
    config: CollabConfig,
    state: watch::Sender<SessionState>,
    inbound: Option<mpsc::Receiver<SyncMessage>>,
    debounce_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_failures: u32,
    load_retry_at: Option<Instant>,
    load_failures: u32,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<SyncMessage>>) -> Option<SyncMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.load().await;
        self.attach().await;

        let sync = self.config.sync.clone();
        let start = Instant::now();
        let mut resync = tokio::time::interval_at(start + sync.resync_interval, sync.resync_interval);
        let mut presence = tokio::time::interval_at(
            start + sync.presence_check_interval,
            sync.presence_check_interval,
        );

        loop {
            tokio::select! {
                Some(change) = self.doc_rx.recv() => self.on_doc_change(change),
                message = recv_inbound(&mut self.inbound) => match message {
                    Some(message) => self.on_message(message),
                    None => {
                        self.inbound = None;
                        self.relay.mark_disconnected();
                        self.schedule_reconnect();
                    }
                },
                Some(change) = self.awareness_rx.recv() => {
                    if let Err(e) = self.relay.on_awareness_change(&change) {
                        log::debug!("Presence broadcast skipped: {e}");
                    }
                    self.check_connection();
                }
                _ = sleep_until_opt(self.debounce_at) => {
                    self.debounce_at = None;
                    self.flush().await;
                }
                _ = resync.tick() => {
                    if let Err(e) = self.relay.resync_tick() {
                        log::debug!("Resync skipped: {e}");
                    }
                    self.check_connection();
                }
                _ = presence.tick() => {
                    self.awareness.renew_local(sync.presence_timeout / 2);
                    self.awareness.remove_outdated(sync.presence_timeout);
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.attach().await;
                }
                _ = sleep_until_opt(self.load_retry_at) => {
                    self.load_retry_at = None;
                    self.load().await;
                }
                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => {
                        self.drain_changes();
                        self.debounce_at = None;
                        let _ = reply.send(self.persistence.flush(&self.doc).await);
                    }
                    Some(Command::Close(reply)) => {
                        let report = self.close().await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        self.close().await;
                        break;
                    }
                },
            }
        }
    }

    fn publish(&self) {
        let state = SessionState {
            loaded: self.persistence.is_loaded(),
            relay: self.relay.state(),
        };
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn load(&mut self) {
        match self.persistence.load(&self.doc).await {
            Ok(_) => {
                self.load_failures = 0;
                // Edits made while loading are now allowed to reach the store
                if self.persistence.pending_len() > 0 {
                    self.debounce_at = Some(Instant::now() + self.persistence.config().debounce);
                }
            }
            Err(PersistError::Store(StoreError::PermissionDenied(_))) => {
                log::error!("Access to {} denied; not retrying", self.persistence.document_id());
            }
            Err(_) => {
                let delay = self.config.sync.reconnect_delay(self.load_failures);
                self.load_failures += 1;
                self.load_retry_at = Some(Instant::now() + delay);
            }
        }
        self.publish();
    }

    async fn attach(&mut self) {
        match self.relay.attach().await {
            Ok(inbound) => {
                self.inbound = Some(inbound);
                self.reconnect_failures = 0;
            }
            Err(_) => {
                self.inbound = None;
                self.relay.mark_disconnected();
                self.schedule_reconnect();
            }
        }
        self.publish();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let delay = self.config.sync.reconnect_delay(self.reconnect_failures);
        self.reconnect_failures = self.reconnect_failures.saturating_add(1);
        log::debug!("Reconnecting {} in {delay:?}", self.relay.channel());
        self.reconnect_at = Some(Instant::now() + delay);
        self.publish();
    }

    /// Start reconnecting if a send just failed.
    fn check_connection(&mut self) {
        if self.relay.state() == RelayState::Disconnected && self.reconnect_at.is_none() {
            self.inbound = None;
            self.schedule_reconnect();
        }
    }

    fn on_doc_change(&mut self, change: DocChange) {
        if self.persistence.on_change(&change) {
            self.debounce_at = Some(Instant::now() + self.persistence.config().debounce);
        }
        if let Err(e) = self.relay.on_doc_change(&change) {
            log::debug!("Broadcast of local change skipped: {e}");
        }
        self.check_connection();
    }

    fn on_message(&mut self, message: SyncMessage) {
        if let Err(e) = self.relay.handle_message(&message) {
            log::warn!("Ignoring {} from {}: {e}", message.event, message.sender);
        }
        self.check_connection();
    }

    async fn flush(&mut self) {
        match self.persistence.flush(&self.doc).await {
            Ok(_) => {}
            Err(PersistError::Store(StoreError::PermissionDenied(_))) => {}
            Err(_) => {
                // Keep the buffer and try again after another quiet period
                self.debounce_at = Some(Instant::now() + self.persistence.config().debounce);
            }
        }
    }

    /// Take in every change already made to the document.
    fn drain_changes(&mut self) {
        while let Ok(change) = self.doc_rx.try_recv() {
            self.on_doc_change(change);
        }
    }

    async fn close(&mut self) -> CloseReport {
        self.drain_changes();
        self.debounce_at = None;
        let before = self.persistence.pending_len();
        let timeout = self.config.session.close_timeout;

        let flushed = match tokio::time::timeout(timeout, self.persistence.flush(&self.doc)).await {
            Ok(Ok(FlushOutcome::Appended { deltas, .. })) => deltas,
            Ok(Ok(_)) => 0,
            Ok(Err(e)) => {
                log::warn!("Final flush of {} failed: {e}", self.persistence.document_id());
                0
            }
            Err(_) => {
                log::warn!(
                    "Final flush of {} timed out after {timeout:?}",
                    self.persistence.document_id()
                );
                0
            }
        };
        let dropped = self.persistence.pending_len();
        if dropped > 0 {
            log::warn!(
                "Closing {} with {dropped} of {before} buffered deltas unsaved",
                self.persistence.document_id()
            );
        }

        self.relay.detach();
        self.inbound = None;
        self.publish();
        log::info!("Closed session {} on {}", self.relay.session_id(), self.relay.channel());
        CloseReport { flushed, dropped }
    }
}
