//! Append-only file log, one `.y` file per room.
//!
//! Record framing:
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ len: u32 LE│ bincode(LogRecord { sequence, kind,          │
//! │            │                     payload, checksum })     │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Replay skips records whose checksum does not match and cuts a truncated
//! tail off the file, so later appends start on a frame boundary. Compaction writes the snapshot to a sibling file and
//! renames it over the log.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{from_last_snapshot, DurableLog, LogConnector, RecordKind, StoreError};

const LEN_PREFIX: usize = 4;

/// File log configuration.
#[derive(Debug, Clone, Default)]
pub struct FileLogConfig {
    /// fsync after every append (default: false)
    pub sync_writes: bool,
}

impl FileLogConfig {
    pub fn for_testing() -> Self {
        Self { sync_writes: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    sequence: u64,
    kind: RecordKind,
    payload: Vec<u8>,
    checksum: u32,
}

impl LogRecord {
    fn new(sequence: u64, kind: RecordKind, payload: Vec<u8>) -> Self {
        let checksum = checksum(sequence, kind, &payload);
        Self {
            sequence,
            kind,
            payload,
            checksum,
        }
    }

    fn verify(&self) -> bool {
        self.checksum == checksum(self.sequence, self.kind, &self.payload)
    }

    /// Length-prefixed encoding.
    fn frame(&self) -> Result<Vec<u8>, StoreError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| StoreError::Serialization(format!("record of {} bytes", body.len())))?;
        let mut framed = Vec::with_capacity(LEN_PREFIX + body.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }
}

/// FNV-1a fold over the record fields.
fn checksum(sequence: u64, kind: RecordKind, payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut mix = |byte: u8| {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    };
    sequence.to_le_bytes().into_iter().for_each(&mut mix);
    mix(kind as u8);
    payload.iter().copied().for_each(&mut mix);
    hash
}

/// Outcome of scanning a log file.
#[derive(Debug, Default)]
struct Scan {
    records: Vec<(RecordKind, Vec<u8>)>,
    next_sequence: u64,
    corrupt: usize,
    truncated: bool,
    /// End of the last complete frame.
    valid_len: usize,
}

fn scan(bytes: &[u8]) -> Scan {
    let mut scan = Scan::default();
    let mut offset = 0;
    while offset < bytes.len() {
        let Some(prefix) = bytes.get(offset..offset + LEN_PREFIX) else {
            scan.truncated = true;
            break;
        };
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(prefix);
        let start = offset + LEN_PREFIX;
        let end = start + u32::from_le_bytes(len) as usize;
        let Some(body) = bytes.get(start..end) else {
            scan.truncated = true;
            break;
        };
        offset = end;
        scan.valid_len = end;

        let decoded: Result<(LogRecord, usize), _> =
            bincode::serde::decode_from_slice(body, bincode::config::standard());
        match decoded {
            Ok((record, _)) if record.verify() => {
                scan.next_sequence = scan.next_sequence.max(record.sequence + 1);
                scan.records.push((record.kind, record.payload));
            }
            _ => scan.corrupt += 1,
        }
    }
    scan
}

/// Map a room identifier to `<dir>/<id>.y`, refusing identifiers that
/// would escape `dir`.
pub fn log_path(dir: &Path, room_id: &str) -> Result<PathBuf, StoreError> {
    let relative = Path::new(room_id.trim_start_matches('/'));
    let valid = !room_id.trim_start_matches('/').is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(StoreError::InvalidRoom(room_id.to_string()));
    }
    let mut path = dir.join(relative);
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".y");
    path.set_file_name(name);
    Ok(path)
}

/// Opens [`FileLog`]s under one directory.
#[derive(Debug, Clone)]
pub struct FileLogConnector {
    dir: PathBuf,
    config: FileLogConfig,
}

impl FileLogConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_config(dir, FileLogConfig::default())
    }

    pub fn with_config(dir: impl Into<PathBuf>, config: FileLogConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogConnector for FileLogConnector {
    fn open(&self, room_id: &str) -> Result<Box<dyn DurableLog>, StoreError> {
        let path = log_path(&self.dir, room_id)?;
        Ok(Box::new(FileLog::new(path, self.config.clone())))
    }
}

/// A room history in a single append-only file.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    config: FileLogConfig,
    file: Option<File>,
    next_sequence: u64,
}

impl FileLog {
    pub fn new(path: PathBuf, config: FileLogConfig) -> Self {
        Self {
            path,
            config,
            file: None,
            next_sequence: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn appender(&mut self) -> Result<&mut File, StoreError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        Ok(self.file.insert(file))
    }

    async fn write_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), StoreError> {
        let framed = LogRecord::new(self.next_sequence, kind, payload.to_vec()).frame()?;
        let sync = self.config.sync_writes;
        let file = self.appender().await?;
        file.write_all(&framed).await?;
        if sync {
            file.sync_data().await?;
        } else {
            file.flush().await?;
        }
        self.next_sequence += 1;
        Ok(())
    }
}

#[async_trait]
impl DurableLog for FileLog {
    async fn append(&mut self, delta: &[u8]) -> Result<(), StoreError> {
        self.write_record(RecordKind::Delta, delta).await
    }

    async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let scan = scan(&bytes);
        if scan.corrupt > 0 {
            log::warn!("Skipped {} corrupt records in {}", scan.corrupt, self.path.display());
        }
        if scan.truncated {
            log::warn!(
                "Dropping {} byte truncated tail of {}",
                bytes.len() - scan.valid_len,
                self.path.display()
            );
            self.file = None;
            let file = OpenOptions::new().write(true).open(&self.path).await?;
            file.set_len(scan.valid_len as u64).await?;
            file.sync_all().await?;
        }
        self.next_sequence = self.next_sequence.max(scan.next_sequence);
        Ok(from_last_snapshot(scan.records))
    }

    async fn compact(&mut self, snapshot: &[u8]) -> Result<(), StoreError> {
        let framed = LogRecord::new(self.next_sequence, RecordKind::Snapshot, snapshot.to_vec()).frame()?;
        let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".compact");
        let tmp = self.path.with_file_name(tmp_name);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&tmp).await?;
        file.write_all(&framed).await?;
        file.sync_all().await?;
        drop(file);

        self.file = None;
        fs::rename(&tmp, &self.path).await?;
        self.next_sequence += 1;
        log::debug!("Compacted {} to a {} byte snapshot", self.path.display(), snapshot.len());
        Ok(())
    }
}
