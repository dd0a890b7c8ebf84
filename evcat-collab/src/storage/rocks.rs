//! RocksDB-backed room logs.
//!
//! Column families:
//! - `snapshots`: newest compacted state per room (LZ4 compressed)
//! - `deltas`: deltas appended since that snapshot (LZ4 compressed,
//!   keyed by `<room id>\0<sequence:8 bytes BE>`)
//!
//! All rooms share one database; each room's deltas form one contiguous
//! key range.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{DurableLog, LogConnector, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DELTAS: &str = "deltas";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DELTAS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("evcat_rooms"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
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

/// Snapshots and deltas of every room.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RoomStore {
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
        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        match name {
            CF_SNAPSHOTS => opts.optimize_for_point_lookup((config.block_cache_size >> 20) as u64),
            CF_DELTAS => opts.set_max_write_buffer_number(4),
            _ => {}
        }
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

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Store a delta under the given sequence number.
    pub fn put_delta(&self, room_id: &str, sequence: u64, delta: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let key = delta_key(room_id, sequence)?;
        let compressed = lz4_flex::compress_prepend_size(delta);
        self.db.put_cf_opt(&cf, key, compressed, &self.write_options())?;
        Ok(())
    }

    /// Deltas of a room in sequence order. Entries that fail to decompress
    /// are skipped and counted in the second return value.
    pub fn deltas(&self, room_id: &str) -> Result<(Vec<(u64, Vec<u8>)>, usize), StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = room_prefix(room_id)?;
        let mut deltas = Vec::new();
        let mut corrupt = 0;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(sequence) = sequence_of(&key, &prefix) else {
                break;
            };
            match lz4_flex::decompress_size_prepended(&value) {
                Ok(delta) => deltas.push((sequence, delta)),
                Err(_) => corrupt += 1,
            }
        }
        Ok((deltas, corrupt))
    }

    /// Highest sequence number stored for a room.
    pub fn last_sequence(&self, room_id: &str) -> Result<Option<u64>, StoreError> {
        let (deltas, _) = self.deltas(room_id)?;
        Ok(deltas.last().map(|(seq, _)| *seq))
    }

    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Atomically store a snapshot and delete every delta of the room.
    pub fn compact(&self, room_id: &str, snapshot: &[u8]) -> Result<usize, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let prefix = room_prefix(room_id)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room_id.as_bytes(), lz4_flex::compress_prepend_size(snapshot));

        let mut removed = 0;
        let iter = self
            .db
            .iterator_cf(&cf_deltas, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if sequence_of(&key, &prefix).is_none() {
                break;
            }
            batch.delete_cf(&cf_deltas, &key);
            removed += 1;
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(removed)
    }

    /// Rooms with a stored snapshot.
    pub fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }
}

fn room_prefix(room_id: &str) -> Result<Vec<u8>, StoreError> {
    if room_id.as_bytes().contains(&0) {
        return Err(StoreError::InvalidRoom(room_id.escape_default().to_string()));
    }
    let mut prefix = Vec::with_capacity(room_id.len() + 1);
    prefix.extend_from_slice(room_id.as_bytes());
    prefix.push(0);
    Ok(prefix)
}

fn delta_key(room_id: &str, sequence: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = room_prefix(room_id)?;
    key.extend_from_slice(&sequence.to_be_bytes());
    Ok(key)
}

/// Sequence number of a delta key belonging to `prefix`.
fn sequence_of(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// Opens [`RocksLog`]s over one shared [`RoomStore`].
#[derive(Clone)]
pub struct RocksConnector {
    store: Arc<RoomStore>,
}

impl RocksConnector {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            store: Arc::new(RoomStore::open(config)?),
        })
    }

    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }
}

impl LogConnector for RocksConnector {
    fn open(&self, room_id: &str) -> Result<Box<dyn DurableLog>, StoreError> {
        let room_id = room_id.trim_start_matches('/').to_string();
        let next_sequence = self.store.last_sequence(&room_id)?.map_or(0, |s| s + 1);
        Ok(Box::new(RocksLog {
            store: self.store.clone(),
            room_id,
            next_sequence,
        }))
    }
}

/// The history of one room inside a [`RoomStore`].
pub struct RocksLog {
    store: Arc<RoomStore>,
    room_id: String,
    next_sequence: u64,
}

#[async_trait]
impl DurableLog for RocksLog {
    async fn append(&mut self, delta: &[u8]) -> Result<(), StoreError> {
        self.store.put_delta(&self.room_id, self.next_sequence, delta)?;
        self.next_sequence += 1;
        Ok(())
    }

    async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError> {
        let snapshot = self.store.load_snapshot(&self.room_id)?;
        let (deltas, corrupt) = self.store.deltas(&self.room_id)?;
        if corrupt > 0 {
            log::warn!("Skipped {corrupt} corrupt deltas of room {}", self.room_id);
        }
        Ok(snapshot
            .into_iter()
            .chain(deltas.into_iter().map(|(_, delta)| delta))
            .collect())
    }

    async fn compact(&mut self, snapshot: &[u8]) -> Result<(), StoreError> {
        let removed = self.store.compact(&self.room_id, snapshot)?;
        log::debug!("Compacted room {}: {removed} deltas folded into snapshot", self.room_id);
        Ok(())
    }
}
