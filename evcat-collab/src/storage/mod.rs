//! Durable room logs.
//!
//! ```text
//! ┌─────────────┐  append(delta)   ┌──────────────┐
//! │ Room        │ ───────────────► │ DurableLog   │
//! │             │  compact(state)  │              │
//! │             │ ───────────────► │  Memory      │
//! └──────┬──────┘                  │  File (.y)   │
//!        │ on open                 │  RocksDB     │
//!        ▼                         └──────────────┘
//!   replay() → [snapshot?, delta, delta, ...]
//! ```
//!
//! A log is an append-only sequence of delta records. Compaction replaces
//! every record with one snapshot of the full state; replay starts at the
//! newest snapshot.

pub mod file;
pub mod rocks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::{FileLog, FileLogConfig, FileLogConnector};
pub use rocks::{RocksConnector, RocksLog, RoomStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// The room identifier cannot be mapped to a log location.
    #[error("Invalid room identifier: {0}")]
    InvalidRoom(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Record kinds of a durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Delta = 1,
    /// Full state; earlier records are subsumed
    Snapshot = 2,
}

/// The append-only history of one room.
#[async_trait]
pub trait DurableLog: Send {
    /// Persist a delta. Returns once the record is written.
    async fn append(&mut self, delta: &[u8]) -> Result<(), StoreError>;

    /// Payloads from the newest snapshot onward, in write order.
    async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Replace the history with a single snapshot.
    async fn compact(&mut self, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Opens the durable log of a room.
pub trait LogConnector: Send + Sync {
    fn open(&self, room_id: &str) -> Result<Box<dyn DurableLog>, StoreError>;
}

/// Payloads from the last snapshot onward.
pub(crate) fn from_last_snapshot(records: Vec<(RecordKind, Vec<u8>)>) -> Vec<Vec<u8>> {
    let start = records
        .iter()
        .rposition(|(kind, _)| *kind == RecordKind::Snapshot)
        .unwrap_or(0);
    records.into_iter().skip(start).map(|(_, payload)| payload).collect()
}

/// Where rooms keep their history.
#[derive(Debug, Clone, Default)]
pub enum StorageBackend {
    /// Process-lifetime history
    #[default]
    Memory,
    /// One `.y` file per room under `dir`
    Files { dir: PathBuf },
    /// One RocksDB database at `path` for all rooms
    Rocks { path: PathBuf },
}

impl StorageBackend {
    pub fn connect(&self) -> Result<Arc<dyn LogConnector>, StoreError> {
        Ok(match self {
            StorageBackend::Memory => Arc::new(MemoryConnector::new()),
            StorageBackend::Files { dir } => Arc::new(FileLogConnector::new(dir.clone())),
            StorageBackend::Rocks { path } => {
                Arc::new(RocksConnector::open(StoreConfig::for_path(path.clone()))?)
            }
        })
    }
}

type SharedRecords = Arc<Mutex<Vec<(RecordKind, Vec<u8>)>>>;

/// In-process logs that outlive their rooms but not the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnector {
    logs: Arc<Mutex<HashMap<String, SharedRecords>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held for a room.
    pub fn record_count(&self, room_id: &str) -> usize {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(room_id)
            .map_or(0, |r| r.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

impl LogConnector for MemoryConnector {
    fn open(&self, room_id: &str) -> Result<Box<dyn DurableLog>, StoreError> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let records = logs.entry(room_id.to_string()).or_default().clone();
        Ok(Box::new(MemoryLog { records }))
    }
}

/// A log held in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: SharedRecords,
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&mut self, delta: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push((RecordKind::Delta, delta.to_vec()));
        Ok(())
    }

    async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(from_last_snapshot(records.clone()))
    }

    async fn compact(&mut self, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        *records = vec![(RecordKind::Snapshot, snapshot.to_vec())];
        Ok(())
    }
}
