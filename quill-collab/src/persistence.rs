//! Persistence engine: snapshot + log replay, debounced appends, compaction.
//!
//! ```text
//!  load ─────► fetch_snapshot ──► apply(DbLoad)
//!              fetch_updates_after(snapshot_at) ──► apply(DbLoad) each, in order
//!              loaded = true
//!
//!  DocChange(Local) ──► pending.push(delta)   (merged in place until loaded)
//!                              │  debounce elapsed
//!                              ▼
//!  flush ─────► merge(pending) ──► append_update (retried) ──► drain pending
//!                                                         │
//!                              appends ≥ N or elapsed ≥ T ▼
//!  compact ───► catch up (snapshot + rows, DbLoad) ──► compact(full state, through, base)
//! ```
//!
//! Only changes with [`Origin::Local`](crate::origin::Origin::Local) are
//! buffered. Remote edits are persisted by the process that made them, and
//! replayed rows are already durable. Nothing is appended until the load has
//! completed, so a save can never clobber state this replica has not seen.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::PersistenceConfig;
use crate::doc::{merge_updates, CollabDoc, DocChange, DocError};
use crate::origin::Origin;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{bytea, BackingStore, StoreError, Timestamp};

/// Save indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Loading,
    Saving,
    Saved,
    Error,
    AccessDenied,
}

/// Published save state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveState {
    pub status: SaveStatus,
    /// `created_at` of the last successful append.
    pub last_saved: Option<Timestamp>,
}

impl Default for SaveState {
    fn default() -> Self {
        Self {
            status: SaveStatus::Idle,
            last_saved: None,
        }
    }
}

fn status_for(e: &StoreError) -> SaveStatus {
    match e {
        StoreError::PermissionDenied(_) => SaveStatus::AccessDenied,
        _ => SaveStatus::Error,
    }
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    Store(StoreError),
    Doc(DocError),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Store(e) => write!(f, "{e}"),
            PersistError::Doc(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        PersistError::Store(e)
    }
}

impl From<DocError> for PersistError {
    fn from(e: DocError) -> Self {
        PersistError::Doc(e)
    }
}

/// What a load replayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub snapshot_applied: bool,
    pub updates_applied: usize,
    /// Rows or snapshots that could not be decoded.
    pub skipped: usize,
}

/// Result of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The document has not finished loading; nothing was written.
    NotLoaded,
    /// No buffered changes.
    Idle,
    /// Buffered changes were appended as one row.
    Appended {
        deltas: usize,
        bytes: usize,
        created_at: Timestamp,
        compacted: bool,
    },
}

/// Loads, saves, and compacts one document.
pub struct PersistenceEngine {
    document_id: String,
    store: Arc<dyn BackingStore>,
    config: PersistenceConfig,
    retry: RetryPolicy,
    pending: Vec<Vec<u8>>,
    /// Deltas represented by `pending`.
    pending_deltas: usize,
    loaded: bool,
    /// `snapshot_at` this replica last built on.
    snapshot_at: Option<Timestamp>,
    appends_since_compaction: u32,
    last_compaction: Instant,
    state: watch::Sender<SaveState>,
}

impl PersistenceEngine {
    pub fn new(
        document_id: impl Into<String>,
        store: Arc<dyn BackingStore>,
        config: PersistenceConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SaveState::default());
        Self {
            document_id: document_id.into(),
            store,
            config,
            retry,
            pending: Vec::new(),
            pending_deltas: 0,
            loaded: false,
            snapshot_at: None,
            appends_since_compaction: 0,
            last_compaction: Instant::now(),
            state,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Watch the save state.
    pub fn subscribe(&self) -> watch::Receiver<SaveState> {
        self.state.subscribe()
    }

    pub fn save_state(&self) -> SaveState {
        *self.state.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Number of buffered deltas not yet appended.
    pub fn pending_len(&self) -> usize {
        self.pending_deltas
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn set_status(&self, status: SaveStatus) {
        self.state.send_modify(|s| s.status = status);
    }

    // ─── Load ─────────────────────────────────────────────────────────

    /// Replay the durable record into `doc` with [`Origin::DbLoad`].
    ///
    /// Malformed rows are logged and skipped. Store failures leave the
    /// engine unloaded so the caller can try again.
    pub async fn load(&mut self, doc: &CollabDoc) -> Result<LoadReport, PersistError> {
        self.set_status(SaveStatus::Loading);
        match self.replay(doc).await {
            Ok(report) => {
                self.loaded = true;
                self.last_compaction = Instant::now();
                self.set_status(SaveStatus::Idle);
                log::info!(
                    "Loaded {}: snapshot={} updates={} skipped={}",
                    self.document_id,
                    report.snapshot_applied,
                    report.updates_applied,
                    report.skipped
                );
                Ok(report)
            }
            Err(e) => {
                self.set_status(status_for(&e));
                log::error!("Loading {} failed: {e}", self.document_id);
                Err(e.into())
            }
        }
    }

    async fn replay(&mut self, doc: &CollabDoc) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::default();
        let store = &self.store;
        let id = self.document_id.as_str();

        let snapshot = with_retry(self.retry, "fetch_snapshot", || store.fetch_snapshot(id)).await?;
        let base = snapshot.as_ref().map(|s| s.snapshot_at);
        if let Some(row) = snapshot {
            match apply_stored(doc, &row.snapshot, "snapshot", id) {
                Applied::Yes => report.snapshot_applied = true,
                Applied::Skipped => report.skipped += 1,
                Applied::Empty => {}
            }
        }

        let after = base.unwrap_or(Timestamp::ZERO);
        let rows = with_retry(self.retry, "fetch_updates_after", || store.fetch_updates_after(id, after)).await?;
        for row in &rows {
            match apply_stored(doc, &row.update, "update row", id) {
                Applied::Yes => report.updates_applied += 1,
                Applied::Skipped => report.skipped += 1,
                Applied::Empty => {}
            }
        }

        self.snapshot_at = base;
        Ok(report)
    }

    // ─── Save ─────────────────────────────────────────────────────────

    /// Buffer a change if it originated locally. Returns whether it was buffered.
    ///
    /// Until the document is loaded nothing can be flushed, so the buffer is
    /// kept as a single merged delta instead of growing with every edit.
    pub fn on_change(&mut self, change: &DocChange) -> bool {
        if !change.origin.should_persist() {
            return false;
        }
        self.pending_deltas += 1;
        self.pending.push(change.update.clone());
        if !self.loaded && self.pending.len() > 1 {
            match merge_updates(&self.pending) {
                Ok(merged) => self.pending = vec![merged],
                Err(e) => log::warn!("Keeping unmerged deltas for {}: {e}", self.document_id),
            }
        }
        true
    }

    /// Append every buffered delta as one merged row.
    ///
    /// The buffer is cleared only after the append succeeded; deltas that
    /// arrive while the append is in flight stay buffered for the next flush.
    pub async fn flush(&mut self, doc: &CollabDoc) -> Result<FlushOutcome, PersistError> {
        if !self.loaded {
            return Ok(FlushOutcome::NotLoaded);
        }
        if self.pending.is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        let count = self.pending_deltas;
        let entries = self.pending.len();
        let merged = match merge_updates(&self.pending) {
            Ok(merged) => merged,
            Err(e) => {
                self.set_status(SaveStatus::Error);
                log::error!("Merging {count} deltas of {} failed: {e}", self.document_id);
                return Err(e.into());
            }
        };
        let text = bytea::encode(&merged);

        self.set_status(SaveStatus::Saving);
        let store = &self.store;
        let id = self.document_id.as_str();
        let result = with_retry(self.retry, "append_update", || store.append_update(id, &text)).await;

        match result {
            Ok(created_at) => {
                self.pending.drain(..entries);
                self.pending_deltas -= count;
                self.appends_since_compaction += 1;
                self.state.send_modify(|s| {
                    s.status = SaveStatus::Saved;
                    s.last_saved = Some(created_at);
                });
                log::debug!(
                    "Appended {count} deltas ({} bytes) to {} at {created_at}",
                    merged.len(),
                    self.document_id
                );

                let compacted = if self.needs_compaction() {
                    match self.compact(doc).await {
                        Ok(done) => done,
                        Err(e) => {
                            log::warn!("Compaction of {} failed: {e}", self.document_id);
                            false
                        }
                    }
                } else {
                    false
                };

                Ok(FlushOutcome::Appended {
                    deltas: count,
                    bytes: merged.len(),
                    created_at,
                    compacted,
                })
            }
            Err(e) => {
                self.set_status(status_for(&e));
                log::error!(
                    "Saving {} failed, keeping {count} buffered deltas: {e}",
                    self.document_id
                );
                Err(e.into())
            }
        }
    }

    // ─── Compaction ───────────────────────────────────────────────────

    /// Either compaction threshold has been reached.
    pub fn needs_compaction(&self) -> bool {
        self.loaded
            && self.appends_since_compaction > 0
            && (self.appends_since_compaction >= self.config.compact_after_appends
                || self.last_compaction.elapsed() >= self.config.compact_after)
    }

    /// Fold the log into a new snapshot.
    ///
    /// First catches up on whatever other writers stored (applied with
    /// [`Origin::DbLoad`]), then compacts through the newest row read. Rows
    /// appended afterwards keep larger timestamps and survive. Returns
    /// `false` if another writer compacted first; the next cycle retries.
    pub async fn compact(&mut self, doc: &CollabDoc) -> Result<bool, PersistError> {
        let store = &self.store;
        let id = self.document_id.as_str();

        let snapshot = with_retry(self.retry, "fetch_snapshot", || store.fetch_snapshot(id)).await?;
        let base = snapshot.as_ref().map(|s| s.snapshot_at);
        if base != self.snapshot_at {
            if let Some(row) = &snapshot {
                log::debug!("Snapshot of {id} moved to {}, catching up", row.snapshot_at);
                apply_stored(doc, &row.snapshot, "snapshot", id);
            }
        }

        let after = base.unwrap_or(Timestamp::ZERO);
        let rows = with_retry(self.retry, "fetch_updates_after", || store.fetch_updates_after(id, after)).await?;
        let Some(through) = rows.iter().map(|r| r.created_at).max() else {
            // Nothing to fold
            self.snapshot_at = base;
            self.appends_since_compaction = 0;
            self.last_compaction = Instant::now();
            return Ok(false);
        };
        for row in &rows {
            apply_stored(doc, &row.update, "update row", id);
        }

        let full = bytea::encode(&doc.encode_state());
        let result = with_retry(self.retry, "compact", || store.compact(id, &full, through, base)).await;
        match result {
            Ok(snapshot_at) => {
                log::info!(
                    "Compacted {id}: folded {} rows into snapshot at {snapshot_at}",
                    rows.len()
                );
                self.snapshot_at = Some(snapshot_at);
                self.appends_since_compaction = 0;
                self.last_compaction = Instant::now();
                Ok(true)
            }
            Err(StoreError::Conflict { expected, actual }) => {
                // `snapshot_at` stays put so the next cycle applies the winner's snapshot
                log::warn!("Compaction of {id} lost a race (expected {expected:?}, found {actual:?}); skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

enum Applied {
    Yes,
    Empty,
    Skipped,
}

/// Decode stored bytea text and apply it with [`Origin::DbLoad`].
fn apply_stored(doc: &CollabDoc, text: &str, what: &str, document_id: &str) -> Applied {
    let bytes = match bytea::decode(text) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Applied::Empty,
        Err(e) => {
            log::warn!("Skipping malformed {what} of {document_id}: {e}");
            return Applied::Skipped;
        }
    };
    match doc.apply(&bytes, Origin::DbLoad) {
        Ok(_) => Applied::Yes,
        Err(e) => {
            log::warn!("Skipping undecodable {what} of {document_id}: {e}");
            Applied::Skipped
        }
    }
}
