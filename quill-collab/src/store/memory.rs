//! In-process backing store.
//!
//! Holds every document in a mutex-guarded map. Used by tests and by
//! single-process deployments that do not need durability. Failures can be
//! injected to exercise the retry and status paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{bytea, BackingStore, SnapshotRow, StoreError, Timestamp, UpdateRow};

#[derive(Default)]
struct DocRecord {
    snapshot: Option<SnapshotRow>,
    rows: Vec<UpdateRow>,
}

#[derive(Default)]
struct State {
    clock: Timestamp,
    docs: HashMap<String, DocRecord>,
    fail_reads: u32,
    fail_appends: u32,
    fail_compactions: u32,
    denied: bool,
    appends: u64,
    compactions: u64,
}

impl State {
    fn tick(&mut self) -> Timestamp {
        self.clock = Timestamp::next_after(self.clock);
        self.clock
    }

    fn check_access(&self) -> Result<(), StoreError> {
        if self.denied {
            return Err(StoreError::PermissionDenied("access to document denied".into()));
        }
        Ok(())
    }
}

/// Consume one injected failure from `budget`, if any is left.
fn take_failure(budget: &mut u32, what: &str) -> Result<(), StoreError> {
    if *budget > 0 {
        *budget -= 1;
        return Err(StoreError::Unavailable(format!("injected {what} failure")));
    }
    Ok(())
}

/// In-memory [`BackingStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Failure injection ────────────────────────────────────────────

    /// Fail the next `n` reads (snapshot or rows) with a retryable error.
    pub fn fail_next_reads(&self, n: u32) {
        self.lock().fail_reads = n;
    }

    /// Fail the next `n` appends with a retryable error.
    pub fn fail_next_appends(&self, n: u32) {
        self.lock().fail_appends = n;
    }

    /// Fail the next `n` compactions with a retryable error.
    pub fn fail_next_compactions(&self, n: u32) {
        self.lock().fail_compactions = n;
    }

    /// Deny every operation with a permission error.
    pub fn deny_access(&self, denied: bool) {
        self.lock().denied = denied;
    }

    // ─── Direct access ────────────────────────────────────────────────

    /// Write a snapshot row directly. Returns its `snapshot_at`.
    pub fn seed_snapshot(&self, document_id: &str, snapshot: &[u8]) -> Timestamp {
        let mut state = self.lock();
        let at = state.tick();
        state.docs.entry(document_id.to_string()).or_default().snapshot = Some(SnapshotRow {
            snapshot: bytea::encode(snapshot),
            snapshot_at: at,
        });
        at
    }

    /// Append a row holding arbitrary text, bypassing failure injection.
    pub fn insert_raw_update(&self, document_id: &str, text: &str) -> Timestamp {
        let mut state = self.lock();
        let at = state.tick();
        state.docs.entry(document_id.to_string()).or_default().rows.push(UpdateRow {
            update: text.to_string(),
            created_at: at,
        });
        at
    }

    /// Append a row holding `update`, bypassing failure injection.
    pub fn insert_update(&self, document_id: &str, update: &[u8]) -> Timestamp {
        self.insert_raw_update(document_id, &bytea::encode(update))
    }

    pub fn snapshot(&self, document_id: &str) -> Option<SnapshotRow> {
        self.lock().docs.get(document_id).and_then(|d| d.snapshot.clone())
    }

    pub fn update_rows(&self, document_id: &str) -> Vec<UpdateRow> {
        self.lock()
            .docs
            .get(document_id)
            .map(|d| d.rows.clone())
            .unwrap_or_default()
    }

    /// Successful `append_update` calls so far.
    pub fn append_count(&self) -> u64 {
        self.lock().appends
    }

    /// Successful `compact` calls so far.
    pub fn compaction_count(&self) -> u64 {
        self.lock().compactions
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn fetch_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRow>, StoreError> {
        let mut state = self.lock();
        state.check_access()?;
        take_failure(&mut state.fail_reads, "read")?;
        Ok(state.docs.get(document_id).and_then(|d| d.snapshot.clone()))
    }

    async fn fetch_updates_after(
        &self,
        document_id: &str,
        after: Timestamp,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        let mut state = self.lock();
        state.check_access()?;
        take_failure(&mut state.fail_reads, "read")?;
        Ok(state
            .docs
            .get(document_id)
            .map(|d| d.rows.iter().filter(|r| r.created_at > after).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_update(&self, document_id: &str, update: &str) -> Result<Timestamp, StoreError> {
        let mut state = self.lock();
        state.check_access()?;
        take_failure(&mut state.fail_appends, "append")?;
        let at = state.tick();
        state.docs.entry(document_id.to_string()).or_default().rows.push(UpdateRow {
            update: update.to_string(),
            created_at: at,
        });
        state.appends += 1;
        Ok(at)
    }

    async fn compact(
        &self,
        document_id: &str,
        snapshot: &str,
        through: Timestamp,
        base: Option<Timestamp>,
    ) -> Result<Timestamp, StoreError> {
        let mut state = self.lock();
        state.check_access()?;
        take_failure(&mut state.fail_compactions, "compaction")?;

        let record = state.docs.entry(document_id.to_string()).or_default();
        let actual = record.snapshot.as_ref().map(|s| s.snapshot_at);
        if actual != base {
            return Err(StoreError::Conflict { expected: base, actual });
        }
        record.snapshot = Some(SnapshotRow {
            snapshot: snapshot.to_string(),
            snapshot_at: through,
        });
        record.rows.retain(|r| r.created_at > through);

        // Later appends must land after the new snapshot
        state.clock = state.clock.max(through);
        state.compactions += 1;
        Ok(through)
    }
}
