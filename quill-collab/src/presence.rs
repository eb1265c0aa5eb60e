//! Ephemeral presence ("awareness") for collaborative editing sessions.
//!
//! Tracks who is in a document and where their cursor is. Presence is never
//! persisted: it lives only as long as the sessions that publish it.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! Awareness::set_local_state()      clock += 1
//!       │
//!       ▼
//! AwarenessChange { updated: [me], origin: Local }
//!       │
//!       ▼   SyncRelay encodes only the changed sessions
//! presence-update ──────────────► remote Awareness::apply_update(.., Remote)
//!                                      │  (higher clock wins)
//!                                      ▼
//!                                 AwarenessChange { origin: Remote }
//! ```
//!
//! Each session owns a monotonically increasing clock. A record replaces the
//! known record for the same session only if its clock is higher, or the
//! clock is equal and the record is a removal. Sessions that stay silent for
//! the presence timeout are expired locally; a live session renews its own
//! record at half that interval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::origin::Origin;

/// Identifier of one editor session. One user may hold several.
pub type SessionId = Uuid;

/// Cursor colors handed out to sessions.
pub const USER_COLORS: [&str; 5] = ["#30bced", "#6eeb83", "#ffbc42", "#ecd444", "#ee6352"];

/// Stable color for a session.
pub fn color_for(session: SessionId) -> &'static str {
    USER_COLORS[(session.as_u128() % USER_COLORS.len() as u128) as usize]
}

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Selection range in document index units. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }
}

/// What one session publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
}

impl PresenceState {
    /// Presence for `name` with the session's palette color and no cursor.
    pub fn new(name: impl Into<String>, session: SessionId) -> Self {
        Self {
            name: name.into(),
            color: color_for(session).to_string(),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: CursorRange) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Wire record: one session's clocked state. `state: None` means the session left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PresenceRecord {
    session: SessionId,
    clock: u64,
    state: Option<PresenceState>,
}

/// Sessions affected by one awareness mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<SessionId>,
    pub updated: Vec<SessionId>,
    pub removed: Vec<SessionId>,
    pub origin: Origin,
}

impl AwarenessChange {
    fn new(origin: Origin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    /// Every session touched by this change.
    pub fn changed(&self) -> Vec<SessionId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwarenessError::Encode(e) => write!(f, "Presence encode error: {e}"),
            AwarenessError::Decode(e) => write!(f, "Presence decode error: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

// ───────────────────────────────────────────────────────────────────
// Awareness map
// ───────────────────────────────────────────────────────────────────

struct Entry {
    clock: u64,
    state: Option<PresenceState>,
    last_seen: Instant,
}

struct Inner {
    local_id: SessionId,
    entries: HashMap<SessionId, Entry>,
    subscribers: Vec<mpsc::UnboundedSender<AwarenessChange>>,
}

impl Inner {
    fn emit(&mut self, change: AwarenessChange) {
        if change.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn bump_local(&mut self, state: Option<PresenceState>) -> AwarenessChange {
        let local_id = self.local_id;
        let now = Instant::now();
        let entry = self.entries.entry(local_id).or_insert(Entry {
            clock: 0,
            state: None,
            last_seen: now,
        });
        let previous = entry.state.take();
        entry.clock += 1;
        entry.last_seen = now;
        entry.state = state;

        let mut change = AwarenessChange::new(Origin::Local);
        match (previous.is_some(), entry.state.is_some()) {
            (false, true) => change.added.push(local_id),
            (true, true) => change.updated.push(local_id),
            (true, false) => change.removed.push(local_id),
            (false, false) => {}
        }
        change
    }
}

/// Shared presence map for one document session.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct Awareness {
    inner: Arc<Mutex<Inner>>,
}

impl Awareness {
    /// Create an empty map owned by `local_id`.
    pub fn new(local_id: SessionId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                local_id,
                entries: HashMap::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_id(&self) -> SessionId {
        self.lock().local_id
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    // ─── Local session ────────────────────────────────────────────────

    /// Publish the local session's state.
    pub fn set_local_state(&self, state: PresenceState) {
        let mut inner = self.lock();
        let change = inner.bump_local(Some(state));
        inner.emit(change);
    }

    /// Move the local cursor. No-op while the local state is unset.
    pub fn set_local_cursor(&self, cursor: Option<CursorRange>) {
        let Some(mut state) = self.local_state() else {
            return;
        };
        state.cursor = cursor;
        self.set_local_state(state);
    }

    /// Mark the local session as gone.
    pub fn clear_local_state(&self) {
        let mut inner = self.lock();
        let change = inner.bump_local(None);
        inner.emit(change);
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        let inner = self.lock();
        inner
            .entries
            .get(&inner.local_id)
            .and_then(|e| e.state.clone())
    }

    /// Re-publish the local state if it was last published at least
    /// `min_age` ago, so peers do not expire a quiet session.
    pub fn renew_local(&self, min_age: Duration) -> bool {
        let mut inner = self.lock();
        let local_id = inner.local_id;
        let state = match inner.entries.get(&local_id) {
            Some(entry) if entry.state.is_some() && entry.last_seen.elapsed() >= min_age => {
                entry.state.clone()
            }
            _ => return false,
        };
        let change = inner.bump_local(state);
        inner.emit(change);
        true
    }

    // ─── Remote sessions ──────────────────────────────────────────────

    /// Expire remote sessions not heard from for `timeout`.
    ///
    /// Expiry is a local inference about remote sessions, so it is reported
    /// with [`Origin::Remote`] and never rebroadcast.
    pub fn remove_outdated(&self, timeout: Duration) -> Vec<SessionId> {
        let mut inner = self.lock();
        let local_id = inner.local_id;
        let mut change = AwarenessChange::new(Origin::Remote);
        for (id, entry) in inner.entries.iter_mut() {
            if *id != local_id && entry.state.is_some() && entry.last_seen.elapsed() >= timeout {
                entry.state = None;
                change.removed.push(*id);
            }
        }
        let removed = change.removed.clone();
        inner.emit(change);
        removed
    }

    /// Merge an encoded presence update.
    ///
    /// Records about the local session are ignored; this process is the only
    /// authority on its own presence.
    pub fn apply_update(&self, bytes: &[u8], origin: Origin) -> Result<AwarenessChange, AwarenessError> {
        let (records, _): (Vec<PresenceRecord>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| AwarenessError::Decode(e.to_string()))?;

        let mut inner = self.lock();
        let local_id = inner.local_id;
        let now = Instant::now();
        let mut change = AwarenessChange::new(origin);

        for record in records {
            if record.session == local_id {
                continue;
            }
            let (accept, had_state, prev_state) = match inner.entries.get(&record.session) {
                None => (true, false, None),
                Some(cur) => {
                    let newer = record.clock > cur.clock
                        || (record.clock == cur.clock && record.state.is_none() && cur.state.is_some());
                    (newer, cur.state.is_some(), cur.state.clone())
                }
            };
            if !accept {
                continue;
            }

            match (had_state, record.state.is_some()) {
                (false, true) => change.added.push(record.session),
                (true, true) if prev_state != record.state => change.updated.push(record.session),
                (true, false) => change.removed.push(record.session),
                _ => {}
            }
            inner.entries.insert(
                record.session,
                Entry {
                    clock: record.clock,
                    state: record.state,
                    last_seen: now,
                },
            );
        }

        inner.emit(change.clone());
        Ok(change)
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Encode the records of the given sessions (unknown ids are skipped).
    pub fn encode_update(&self, sessions: &[SessionId]) -> Result<Vec<u8>, AwarenessError> {
        let inner = self.lock();
        let records: Vec<PresenceRecord> = sessions
            .iter()
            .filter_map(|id| {
                inner.entries.get(id).map(|e| PresenceRecord {
                    session: *id,
                    clock: e.clock,
                    state: e.state.clone(),
                })
            })
            .collect();
        encode_records(&records)
    }

    /// Encode every known record.
    pub fn encode_full(&self) -> Result<Vec<u8>, AwarenessError> {
        let inner = self.lock();
        let records: Vec<PresenceRecord> = inner
            .entries
            .iter()
            .map(|(id, e)| PresenceRecord {
                session: *id,
                clock: e.clock,
                state: e.state.clone(),
            })
            .collect();
        encode_records(&records)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Number of other sessions with live presence.
    pub fn remote_count(&self) -> usize {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .filter(|(id, e)| **id != inner.local_id && e.state.is_some())
            .count()
    }

    /// Live states, the local session included.
    pub fn states(&self) -> HashMap<SessionId, PresenceState> {
        self.lock()
            .entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    pub fn get(&self, session: &SessionId) -> Option<PresenceState> {
        self.lock().entries.get(session).and_then(|e| e.state.clone())
    }

    pub fn clock(&self, session: &SessionId) -> Option<u64> {
        self.lock().entries.get(session).map(|e| e.clock)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Awareness")
            .field("local_id", &inner.local_id)
            .field("sessions", &inner.entries.len())
            .finish()
    }
}

fn encode_records(records: &[PresenceRecord]) -> Result<Vec<u8>, AwarenessError> {
    bincode::serde::encode_to_vec(records, bincode::config::standard())
        .map_err(|e| AwarenessError::Encode(e.to_string()))
}

// ===================================================================
// Tests
// ===================================================================
