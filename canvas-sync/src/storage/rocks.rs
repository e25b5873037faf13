//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `log`     : the ordered edit log (keyed by offset, 8 bytes big-endian)
//! - `snapshot`: the current checkpoint: `current` (LZ4 raster indices),
//!   `version` (u64 BE) and `meta` (bincode [`SnapshotMeta`])
//!
//! The three snapshot keys are always written in one `WriteBatch` and read
//! through one RocksDB snapshot, so a reader never pairs a raster with the
//! wrong version.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::watch;

use crate::oplog::{LogError, OrderedLog};
use crate::snapshot::{SnapshotError, SnapshotStore};

const CF_LOG: &str = "log";
const CF_SNAPSHOT: &str = "snapshot";

const COLUMN_FAMILIES: &[&str] = &[CF_LOG, CF_SNAPSHOT];

const KEY_CURRENT: &[u8] = b"current";
const KEY_VERSION: &[u8] = b"version";
const KEY_META: &[u8] = b"meta";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every log append and snapshot (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
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

/// Bookkeeping stored with every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u64,
    /// Uncompressed raster size in bytes
    pub raster_size: u64,
    /// Compressed raster size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub saved_at: u64,
}

impl SnapshotMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("snapshot has a raster but no version (or vice versa)")]
    TornSnapshot,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for LogError {
    fn from(e: StoreError) -> Self {
        LogError::Storage(e.to_string())
    }
}

impl From<StoreError> for SnapshotError {
    fn from(e: StoreError) -> Self {
        SnapshotError::Store(e.to_string())
    }
}

/// RocksDB-backed log and snapshot store.
pub struct CanvasStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes offset assignment with the write that claims it.
    append_lock: Mutex<()>,
    /// Next offset; readers may rely on every offset below it being stored.
    head: watch::Sender<u64>,
}

impl CanvasStore {
    /// Open the store, creating the database and column families if needed.
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

        let head = Self::recover_head(&db)?;
        log::info!("opened canvas store at {} (log head {head})", config.path.display());
        let (head, _) = watch::channel(head);

        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
            head,
        })
    }

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
            CF_LOG => {
                // sequential appends, sequential scans
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_SNAPSHOT => {
                // raster is already LZ4
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Next offset, from the last key in the log column family.
    fn recover_head(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_LOG)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_LOG}' not found")))?;
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_offset(&key)? + 1)
            }
            None => Ok(0),
        }
    }

    // ─── Log ──────────────────────────────────────────────────────────

    /// Append one payload under the next offset.
    pub fn log_append(&self, payload: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LOG)?;
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| StoreError::Database("append lock poisoned".into()))?;
        let offset = *self.head.borrow();

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, offset.to_be_bytes(), payload, &write_opts)?;

        self.head.send_replace(offset + 1);
        Ok(offset)
    }

    /// Up to `limit` entries starting at offset `from`.
    pub fn log_read_from(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_LOG)?;
        let start_key = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item?;
            entries.push((decode_offset(&key)?, value.to_vec()));
        }
        Ok(entries)
    }

    pub fn log_head(&self) -> u64 {
        *self.head.borrow()
    }

    // ─── Snapshot ─────────────────────────────────────────────────────

    /// Replace the current snapshot. Raster, version and metadata land in
    /// one atomic batch.
    pub fn save_snapshot(&self, raster: &[u8], version: u64) -> Result<SnapshotMeta, StoreError> {
        let cf = self.cf(CF_SNAPSHOT)?;
        let compressed = lz4_flex::compress_prepend_size(raster);
        let meta = SnapshotMeta {
            version,
            raster_size: raster.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, KEY_CURRENT, &compressed);
        batch.put_cf(&cf, KEY_VERSION, version.to_be_bytes());
        batch.put_cf(&cf, KEY_META, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    /// The current snapshot, decompressed, or `None` if none was ever saved.
    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT)?;
        let snap = self.db.snapshot();
        let version = snap.get_cf(&cf, KEY_VERSION)?;
        let current = snap.get_cf(&cf, KEY_CURRENT)?;
        match (version, current) {
            (None, None) => Ok(None),
            (Some(version), Some(compressed)) => {
                let version = decode_offset(&version)?;
                let raster = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some((raster, version)))
            }
            _ => Err(StoreError::TornSnapshot),
        }
    }

    pub fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT)?;
        self.db
            .get_cf(&cf, KEY_META)?
            .map(|bytes| SnapshotMeta::decode(&bytes))
            .transpose()
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl OrderedLog for CanvasStore {
    fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
        Ok(self.log_append(payload)?)
    }

    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, LogError> {
        Ok(self.log_read_from(from, limit)?)
    }

    fn head(&self) -> u64 {
        self.log_head()
    }

    fn watch_head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }
}

impl SnapshotStore for CanvasStore {
    fn load(&self) -> Result<Option<(Vec<u8>, u64)>, SnapshotError> {
        let loaded = self.load_snapshot()?;
        if loaded.is_some() {
            if let Ok(Some(meta)) = self.snapshot_meta() {
                log::debug!(
                    "snapshot meta: version {} ({} -> {} bytes, saved at {})",
                    meta.version,
                    meta.raster_size,
                    meta.compressed_size,
                    meta.saved_at
                );
            }
        }
        Ok(loaded)
    }

    fn save(&self, raster: &[u8], version: u64) -> Result<(), SnapshotError> {
        self.save_snapshot(raster, version)?;
        Ok(())
    }
}

fn decode_offset(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("bad 8-byte key: {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, CanvasStore) {
        let dir = TempDir::new().unwrap();
        let store = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert_eq!(store.log_head(), 0);
        assert!(store.load_snapshot().unwrap().is_none());
    }

    #[test]
    fn test_log_append_read() {
        let (_dir, store) = open_temp();
        for i in 0..300u32 {
            assert_eq!(store.log_append(&i.to_le_bytes()).unwrap(), u64::from(i));
        }
        assert_eq!(store.log_head(), 300);

        // big-endian keys keep numeric order past byte boundaries
        let read = store.log_read_from(250, 1000).unwrap();
        assert_eq!(read.len(), 50);
        assert_eq!(read[0], (250, 250u32.to_le_bytes().to_vec()));
        assert_eq!(read[49].0, 299);

        let limited = store.log_read_from(0, 10).unwrap();
        assert_eq!(limited.len(), 10);
        assert_eq!(limited[9].0, 9);
    }

    #[test]
    fn test_head_watch_follows_appends() {
        let (_dir, store) = open_temp();
        let rx = store.watch_head();
        store.log_append(b"a").unwrap();
        store.log_append(b"b").unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let raster: Vec<u8> = (0..10_000u32).map(|i| (i % 16) as u8).collect();
        let meta = store.save_snapshot(&raster, 500).unwrap();
        assert_eq!(meta.version, 500);
        assert_eq!(meta.raster_size, 10_000);
        assert!(meta.compressed_size < meta.raster_size);

        let (loaded, version) = store.load_snapshot().unwrap().unwrap();
        assert_eq!(version, 500);
        assert_eq!(loaded, raster);
        assert_eq!(store.snapshot_meta().unwrap(), Some(meta));
    }

    #[test]
    fn test_snapshot_superseded() {
        let (_dir, store) = open_temp();
        store.save_snapshot(&[1; 64], 500).unwrap();
        store.save_snapshot(&[2; 64], 1000).unwrap();
        let (raster, version) = store.load_snapshot().unwrap().unwrap();
        assert_eq!(version, 1000);
        assert_eq!(raster, vec![2; 64]);
    }

    #[test]
    fn test_torn_snapshot_detected() {
        let (_dir, store) = open_temp();
        let cf = store.cf(CF_SNAPSHOT).unwrap();
        store.db.put_cf(&cf, KEY_VERSION, 7u64.to_be_bytes()).unwrap();
        assert!(matches!(store.load_snapshot(), Err(StoreError::TornSnapshot)));
    }
}
