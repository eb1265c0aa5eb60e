//! RocksDB-backed backing store.
//!
//! Column families:
//! - `documents`: snapshot rows (LZ4-compressed bincode), keyed by document id
//! - `document_updates`: update rows (LZ4-compressed bytea text), keyed by
//!   `<id len: u32 BE><id bytes><created_at: u64 BE>`
//!
//! The length prefix keeps one document's rows contiguous and never lets an
//! id that is a prefix of another interleave with it, so a forward scan from
//! `key(id, t)` yields that document's rows in append order.
//!
//! Appends and compactions are serialized by the clock lock, which is what
//! makes timestamp assignment strictly monotonic and the base check of a
//! compaction atomic with its write batch.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BackingStore, SnapshotRow, StoreError, Timestamp, UpdateRow};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "document_updates";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write. Default: true, so an acknowledged append is durable
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk form of a snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    snapshot: String,
    snapshot_at: u64,
}

impl StoredSnapshot {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(snapshot)
    }
}

/// RocksDB-backed [`BackingStore`].
pub struct RocksStore {
    /// RocksDB instance, single-threaded mode with concurrency via tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Last timestamp handed out. Held across every write.
    clock: Mutex<Timestamp>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist and
    /// recovers the clock so new rows sort after everything on disk.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let clock = Self::recover_clock(&db)?;
        log::info!("Opened store at {} (clock {clock})", config.path.display());

        Ok(Self {
            db,
            config,
            clock: Mutex::new(clock),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, range-scanned per document
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Highest timestamp on disk, from update keys and snapshot rows.
    fn recover_clock(db: &DBWithThreadMode<SingleThreaded>) -> Result<Timestamp, StoreError> {
        let mut clock = Timestamp::ZERO;

        if let Some(cf) = db.cf_handle(CF_UPDATES) {
            for item in db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item?;
                if let Some((_, at)) = split_update_key(&key) {
                    clock = clock.max(at);
                }
            }
        }
        if let Some(cf) = db.cf_handle(CF_DOCUMENTS) {
            for item in db.iterator_cf(&cf, IteratorMode::Start) {
                let (_, value) = item?;
                match StoredSnapshot::decode(&value) {
                    Ok(s) => clock = clock.max(Timestamp(s.snapshot_at)),
                    Err(e) => log::warn!("Unreadable snapshot row during recovery: {e}"),
                }
            }
        }

        Ok(clock)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn clock(&self) -> MutexGuard<'_, Timestamp> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn read_snapshot(&self, document_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => StoredSnapshot::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Keys of `document_id`'s rows created at or before `through`.
    fn keys_through(&self, document_id: &str, through: Timestamp) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(document_id, Timestamp::ZERO);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            match split_update_key(&key) {
                Some((id, at)) if id == document_id.as_bytes() && at <= through => keys.push(key),
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl BackingStore for RocksStore {
    async fn fetch_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRow>, StoreError> {
        Ok(self.read_snapshot(document_id)?.map(|s| SnapshotRow {
            snapshot: s.snapshot,
            snapshot_at: Timestamp(s.snapshot_at),
        }))
    }

    async fn fetch_updates_after(
        &self,
        document_id: &str,
        after: Timestamp,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(document_id, Timestamp(after.0.saturating_add(1)));

        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            let created_at = match split_update_key(&key) {
                Some((id, at)) if id == document_id.as_bytes() => at,
                // Past this document's key range
                _ => break,
            };
            let text = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| e.to_string())
                .and_then(|raw| String::from_utf8(raw).map_err(|e| e.to_string()));
            match text {
                Ok(update) => rows.push(UpdateRow { update, created_at }),
                Err(e) => log::warn!("Skipping unreadable update row {created_at} of {document_id}: {e}"),
            }
        }
        Ok(rows)
    }

    async fn append_update(&self, document_id: &str, update: &str) -> Result<Timestamp, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let mut clock = self.clock();
        let at = Timestamp::next_after(*clock);

        let compressed = lz4_flex::compress_prepend_size(update.as_bytes());
        self.db
            .put_cf_opt(&cf, update_key(document_id, at), &compressed, &self.write_options())?;

        *clock = at;
        Ok(at)
    }

    async fn compact(
        &self,
        document_id: &str,
        snapshot: &str,
        through: Timestamp,
        base: Option<Timestamp>,
    ) -> Result<Timestamp, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let mut clock = self.clock();

        let actual = self.read_snapshot(document_id)?.map(|s| Timestamp(s.snapshot_at));
        if actual != base {
            return Err(StoreError::Conflict { expected: base, actual });
        }

        // Atomic batch: new snapshot + pruned rows
        let mut batch = WriteBatch::default();
        let stored = StoredSnapshot {
            snapshot: snapshot.to_string(),
            snapshot_at: through.0,
        };
        batch.put_cf(&cf_docs, document_id.as_bytes(), stored.encode()?);
        let pruned = self.keys_through(document_id, through)?;
        for key in &pruned {
            batch.delete_cf(&cf_updates, key);
        }
        self.db.write_opt(batch, &self.write_options())?;

        *clock = (*clock).max(through);
        log::debug!("Compacted {document_id} through {through}, pruned {} rows", pruned.len());
        Ok(through)
    }
}

/// Build an update key: id length (4 bytes BE) + id + created_at (8 bytes BE).
fn update_key(document_id: &str, at: Timestamp) -> Vec<u8> {
    let id = document_id.as_bytes();
    let mut key = Vec::with_capacity(4 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key.extend_from_slice(&at.0.to_be_bytes());
    key
}

/// Split an update key into its id bytes and timestamp.
fn split_update_key(key: &[u8]) -> Option<(&[u8], Timestamp)> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let id_len = u32::from_be_bytes(len_bytes) as usize;
    let id = key.get(4..4 + id_len)?;
    let ts_bytes: [u8; 8] = key.get(4 + id_len..)?.try_into().ok()?;
    Some((id, Timestamp(u64::from_be_bytes(ts_bytes))))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_update_key_roundtrip() {
        let key = update_key("doc-1", Timestamp(42));
        let (id, at) = split_update_key(&key).unwrap();
        assert_eq!(id, b"doc-1");
        assert_eq!(at, Timestamp(42));
        assert!(split_update_key(&key[..5]).is_none());
    }

    #[test]
    fn test_update_keys_sort_by_time_within_document() {
        assert!(update_key("doc", Timestamp(1)) < update_key("doc", Timestamp(2)));
        assert!(update_key("doc", Timestamp(255)) < update_key("doc", Timestamp(256)));
    }

    #[tokio::test]
    async fn test_append_and_fetch_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let t1 = store.append_update("doc", "\\x01").await.unwrap();
        let t2 = store.append_update("doc", "\\x02").await.unwrap();
        let t3 = store.append_update("doc", "\\x03").await.unwrap();
        assert!(t1 < t2 && t2 < t3);

        let rows = store.fetch_updates_after("doc", t1).await.unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r.update.as_str()).collect();
        assert_eq!(texts, vec!["\\x02", "\\x03"]);
    }

    #[tokio::test]
    async fn test_documents_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        store.append_update("doc", "\\x01").await.unwrap();
        store.append_update("doc-2", "\\x02").await.unwrap();
        store.append_update("do", "\\x03").await.unwrap();

        let rows = store.fetch_updates_after("doc", Timestamp::ZERO).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].update, "\\x01");
    }

    #[tokio::test]
    async fn test_compact_atomically_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let t1 = store.append_update("doc", "\\x01").await.unwrap();
        let t2 = store.append_update("doc", "\\x02").await.unwrap();
        store.compact("doc", "\\xaa", t1, None).await.unwrap();

        let snap = store.fetch_snapshot("doc").await.unwrap().unwrap();
        assert_eq!(snap.snapshot, "\\xaa");
        assert_eq!(snap.snapshot_at, t1);
        let rows = store.fetch_updates_after("doc", Timestamp::ZERO).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, t2);

        let err = store.compact("doc", "\\xbb", t2, None).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: None, actual: Some(t1) });
    }

    #[tokio::test]
    async fn test_reopen_recovers_rows_and_clock() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let store = open(&dir);
            store.append_update("doc", "\\x01").await.unwrap();
            store.append_update("doc", "\\x02").await.unwrap()
        };

        let store = open(&dir);
        let rows = store.fetch_updates_after("doc", Timestamp::ZERO).await.unwrap();
        assert_eq!(rows.len(), 2);
        let next = store.append_update("doc", "\\x03").await.unwrap();
        assert!(next > last);
    }
}
