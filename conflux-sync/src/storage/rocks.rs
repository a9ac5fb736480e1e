//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed JSON snapshots, keyed by workspace id
//! - `meta`      — version, sizes, checksum, timestamps
//!
//! Snapshot bytes are checksummed before compression; the checksum is
//! verified on every load so a torn or bit-rotted record surfaces as
//! `StoreError::Corrupted` instead of silently resetting a workspace's
//! version counter.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use conflux_core::diff::Snapshot;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("conflux_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing: small caches, caller-provided temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub workspace_id: Uuid,
    /// Version of the stored snapshot; never moves backwards.
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// FNV-folded checksum of the uncompressed snapshot bytes.
    pub checksum: u32,
    pub created_at: u64,
    pub updated_at: u64,
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

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// Workspace snapshot absent
    NotFound(Uuid),
    /// Checksum mismatch — the stored snapshot cannot be trusted
    Corrupted(Uuid),
    /// Refused to overwrite a newer stored snapshot with an older one
    VersionRegression {
        workspace_id: Uuid,
        stored: u64,
        incoming: u64,
    },
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Compression error
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Snapshot not found: {id}"),
            StoreError::Corrupted(id) => write!(f, "Snapshot corrupted for workspace {id}"),
            StoreError::VersionRegression { workspace_id, stored, incoming } => write!(
                f,
                "Version regression for workspace {workspace_id}: stored {stored}, incoming {incoming}"
            ),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed workspace snapshot store.
pub struct WorkspaceStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl WorkspaceStore {
    /// Open the store, creating the database and column families if
    /// they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Snapshot values are LZ4-compressed by us already; keep the
        // engine-level compression cheap too.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Persist a versioned snapshot (LZ4 compressed, checksummed).
    ///
    /// Refuses to move a workspace's stored version backwards — the
    /// version counter never resets while the workspace exists.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotMeta, StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let raw = serde_json::to_vec(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let checksum = fold_checksum(&raw);
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let now = unix_now();
        let mut meta = match self.load_meta(snapshot.workspace_id) {
            Ok(existing) => {
                if existing.version > snapshot.version {
                    return Err(StoreError::VersionRegression {
                        workspace_id: snapshot.workspace_id,
                        stored: existing.version,
                        incoming: snapshot.version,
                    });
                }
                existing
            }
            Err(StoreError::NotFound(_)) => SnapshotMeta {
                workspace_id: snapshot.workspace_id,
                version: 0,
                snapshot_size: 0,
                compressed_size: 0,
                checksum: 0,
                created_at: now,
                updated_at: now,
            },
            Err(e) => return Err(e),
        };
        meta.version = snapshot.version;
        meta.snapshot_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.checksum = checksum;
        meta.updated_at = now;

        // Atomic batch: snapshot + metadata always agree.
        let key = snapshot.workspace_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snaps, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Persisted snapshot for workspace {} at version {} ({} → {} bytes)",
            snapshot.workspace_id,
            snapshot.version,
            raw.len(),
            compressed.len()
        );
        Ok(meta)
    }

    /// Load and verify a snapshot.
    pub fn load_snapshot(&self, workspace_id: Uuid) -> Result<Snapshot, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let key = workspace_id.as_bytes().to_vec();

        let compressed = self
            .db
            .get_cf(&cf, &key)?
            .ok_or(StoreError::NotFound(workspace_id))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;

        let meta = self.load_meta(workspace_id)?;
        if fold_checksum(&raw) != meta.checksum {
            return Err(StoreError::Corrupted(workspace_id));
        }

        serde_json::from_slice(&raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn load_meta(&self, workspace_id: Uuid) -> Result<SnapshotMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, workspace_id.as_bytes())? {
            Some(bytes) => SnapshotMeta::decode(&bytes),
            None => Err(StoreError::NotFound(workspace_id)),
        }
    }

    pub fn exists(&self, workspace_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, workspace_id.as_bytes())?.is_some())
    }

    /// List all workspace ids with a stored snapshot.
    pub fn list_workspaces(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Deserialization("invalid uuid key".into()))?,
                );
                ids.push(id);
            }
        }

        Ok(ids)
    }

    /// Delete a workspace's snapshot and metadata (explicit workspace
    /// deletion).
    pub fn delete(&self, workspace_id: Uuid) -> Result<(), StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let key = workspace_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snaps, &key);
        batch.delete_cf(&cf_meta, &key);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

/// FNV-folded checksum over the snapshot bytes.
fn fold_checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
    }
    hash
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
