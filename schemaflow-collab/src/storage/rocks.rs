//! RocksDB-backed workspace store.
//!
//! Column families:
//! - `snapshots`: Mergeable state per workspace (LZ4 compressed) + version
//! - `patch_documents`: JSON documents of the patch path + version
//!
//! Keys are the UTF-8 workspace id. Values are bincode records.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use schemaflow_core::{PatchedDocument, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{PatchDocumentStore, SnapshotRecord, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_PATCH_DOCUMENTS: &str = "patch_documents";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PATCH_DOCUMENTS];

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
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schemaflow_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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

/// On-disk form of a snapshot. `state` is LZ4 compressed.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    version: u64,
    last_modified: u64,
    state: Vec<u8>,
}

/// On-disk form of a patch document. JSON kept as text.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    version: u64,
    content_json: String,
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// RocksDB-backed store for both sync paths.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write cycles (version bump, CAS).
    write_lock: Mutex<()>,
}

impl RocksStore {
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
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened workspace store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Snapshot payloads are LZ4'd already; keep table compression cheap
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    fn read_snapshot(&self, workspace_id: &WorkspaceId) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, workspace_id.as_str().as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Number of persisted snapshots.
    pub fn snapshot_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, workspace_id: &WorkspaceId) -> Result<Option<SnapshotRecord>, StoreError> {
        let Some(stored) = self.read_snapshot(workspace_id)? else {
            return Ok(None);
        };
        let state = lz4_flex::decompress_size_prepended(&stored.state)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(Some(SnapshotRecord {
            workspace_id: workspace_id.clone(),
            state,
            version: stored.version,
            last_modified: stored.last_modified,
        }))
    }

    fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        state: &[u8],
        last_modified: u64,
    ) -> Result<SnapshotRecord, StoreError> {
        let _guard = self.lock()?;
        let cf = self.cf(CF_SNAPSHOTS)?;

        let version = self
            .read_snapshot(workspace_id)?
            .map_or(0, |s| s.version)
            + 1;
        let stored = StoredSnapshot {
            version,
            last_modified,
            state: lz4_flex::compress_prepend_size(state),
        };
        self.db.put_cf_opt(
            cf,
            workspace_id.as_str().as_bytes(),
            encode_record(&stored)?,
            &self.write_opts(),
        )?;

        Ok(SnapshotRecord {
            workspace_id: workspace_id.clone(),
            state: state.to_vec(),
            version,
            last_modified,
        })
    }
}

impl PatchDocumentStore for RocksStore {
    fn load_document(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<PatchedDocument>, StoreError> {
        let cf = self.cf(CF_PATCH_DOCUMENTS)?;
        let Some(bytes) = self.db.get_cf(cf, workspace_id.as_str().as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredDocument = decode_record(&bytes)?;
        let content = serde_json::from_str(&stored.content_json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(PatchedDocument::with_content(
            workspace_id.clone(),
            stored.version,
            content,
        )))
    }

    fn compare_and_swap(
        &self,
        document: &PatchedDocument,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let cf = self.cf(CF_PATCH_DOCUMENTS)?;
        let key = document.id.as_str().as_bytes();

        let current = match self.db.get_cf(cf, key)? {
            Some(bytes) => decode_record::<StoredDocument>(&bytes)?.version,
            None => 0,
        };
        if current != expected_version {
            return Ok(false);
        }

        let stored = StoredDocument {
            version: document.version,
            content_json: serde_json::to_string(&document.content)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        };
        self.db
            .put_cf_opt(cf, key, encode_record(&stored)?, &self.write_opts())?;
        Ok(true)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
