//! Durable storage for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐  append_update   ┌──────────────────────────────┐
//! │ PersistenceEngine │ ───────────────► │ BackingStore                 │
//! │ (one per session) │  compact         │                              │
//! └─────────┬─────────┘ ───────────────► │ documents(id, snapshot,      │
//!           │                            │           snapshot_at)       │
//!           │ load: snapshot + replay    │ document_updates(id, update, │
//!           ◄─────────────────────────── │                  created_at) │
//!                                        └──────────────────────────────┘
//! ```
//!
//! The durable record of a document is its snapshot plus every update row
//! created strictly after `snapshot_at`. The pair is only ever mutated
//! through [`BackingStore::append_update`] and [`BackingStore::compact`],
//! both atomic. Binary columns hold `\x`-prefixed hex text (see [`bytea`]).
//!
//! Implementations:
//! - [`memory::MemoryStore`]: in-process, with failure injection
//! - [`rocks::RocksStore`]: RocksDB column families, LZ4-compressed values

pub mod bytea;
pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Store-assigned time of a row, microseconds since the Unix epoch.
///
/// A store hands out strictly increasing timestamps, so append order and
/// timestamp order agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Wall-clock now.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Timestamp(micros as u64)
    }

    /// Wall-clock now, or one tick past `last` if the clock has not moved on.
    pub fn next_after(last: Timestamp) -> Self {
        let now = Self::now();
        if now > last {
            now
        } else {
            Timestamp(last.0.saturating_add(1))
        }
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.0)
    }
}

/// A document's compacted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    /// Bytea text; empty or `\x` means no data.
    pub snapshot: String,
    pub snapshot_at: Timestamp,
}

/// One appended update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRow {
    /// Bytea text of a merged update.
    pub update: String,
    pub created_at: Timestamp,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Internal database error
    DatabaseError(String),
    /// The store could not be reached
    Unavailable(String),
    /// The caller may not read or write this document
    PermissionDenied(String),
    /// A compaction observed a snapshot that is no longer current
    Conflict {
        expected: Option<Timestamp>,
        actual: Option<Timestamp>,
    },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl StoreError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::DatabaseError(_) | StoreError::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::PermissionDenied(e) => write!(f, "Permission denied: {e}"),
            StoreError::Conflict { expected, actual } => {
                write!(f, "Snapshot conflict: expected {expected:?}, found {actual:?}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable home of document snapshots and update logs.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// The document's snapshot row, if the document has one.
    async fn fetch_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRow>, StoreError>;

    /// Update rows created strictly after `after`, in append order.
    async fn fetch_updates_after(
        &self,
        document_id: &str,
        after: Timestamp,
    ) -> Result<Vec<UpdateRow>, StoreError>;

    /// Atomically append one update row. Returns its `created_at`.
    async fn append_update(&self, document_id: &str, update: &str) -> Result<Timestamp, StoreError>;

    /// Atomically replace the snapshot with `snapshot` at `through` and
    /// delete every row created at or before `through`.
    ///
    /// `base` is the `snapshot_at` the caller built on (`None`: no snapshot
    /// row). Fails with [`StoreError::Conflict`] if it is no longer current.
    /// Returns the new `snapshot_at`.
    async fn compact(
        &self,
        document_id: &str,
        snapshot: &str,
        through: Timestamp,
        base: Option<Timestamp>,
    ) -> Result<Timestamp, StoreError>;
}
