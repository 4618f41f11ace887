//! Log-structured node store — a durable `KvDB` over append-only files
//!
//! Records append to the current `nodes-{seq}.arbr` file and are durably
//! synced before the call returns; files rotate at a size threshold. An
//! in-memory index maps each node key to its latest record location.
//!
//! The index is rebuilt at open by scanning every file in sequence order:
//! each record's CRC32C is verified, corrupt regions are skipped by
//! scanning forward for the next magic, and a torn record at the end of a
//! file marks the crash point and stops that file's scan. Tombstones drop
//! index entries during replay, so a delete stays a delete across
//! restarts.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use arbor_core::encoding::{decode_node, encode_node};
use arbor_core::{ArborError, ArborResult, KvDB, Node, NodeKey};

use crate::durability::durable_sync;
use crate::format::{encode_record, find_next_magic, RecordHeader, RECORD_HEADER_SIZE};

/// File store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Node file rotation threshold (bytes)
    pub rotation_size_bytes: u64,
    /// Compact a rotated file once this fraction of its records is dead
    pub compaction_trigger_ratio: f64,
}

impl StoreConfig {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.rotation_size_bytes < 1024 {
            return Err("rotation_size_bytes must be >= 1KB".into());
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err("compaction_trigger_ratio must be in (0.0, 1.0)".into());
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rotation_size_bytes: 256 * 1024 * 1024,
            compaction_trigger_ratio: 0.3,
        }
    }
}

/// Where a node's latest record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub(crate) file_seq: u64,
    pub(crate) offset: u64,
}

/// Store state guarded by one mutex: the active file and the index.
pub(crate) struct StoreInner {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
    pub(crate) sequence: u64,
    pub(crate) index: HashMap<NodeKey, Location>,
}

/// Durable node store over append-only, checksummed files.
pub struct FileStore {
    dir: PathBuf,
    pub(crate) config: StoreConfig,
    pub(crate) inner: Mutex<StoreInner>,
    /// Node records appended since open
    total_records: AtomicU64,
    /// Tombstones appended since open
    total_tombstones: AtomicU64,
}

impl FileStore {
    /// Open or create a store in `dir`, replaying existing files to
    /// rebuild the index.
    pub fn open<P: AsRef<Path>>(dir: P, config: StoreConfig) -> ArborResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e, "failed to create store directory"))?;

        let files = list_node_files(&dir)?;
        let mut index = HashMap::new();
        let mut max_seq = 0u64;
        for (seq, path) in &files {
            max_seq = max_seq.max(*seq);
            let buffer =
                std::fs::read(path).map_err(|e| io_error(path, &e, "failed to read node file"))?;
            for record in scan_records(&buffer, path) {
                if record.header.is_tombstone() {
                    index.remove(&record.header.node_key);
                } else {
                    index.insert(
                        record.header.node_key,
                        Location { file_seq: *seq, offset: record.offset },
                    );
                }
            }
        }
        if !index.is_empty() {
            log::info!("recovered {} nodes from {} files in {}", index.len(), files.len(), dir.display());
        }

        let sequence = max_seq + 1;
        let path = node_file_path(&dir, sequence);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, &e, "failed to open node file"))?;
        let size = file
            .metadata()
            .map_err(|e| io_error(&path, &e, "failed to stat node file"))?
            .len();

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(StoreInner { file, path, size, sequence, index }),
            total_records: AtomicU64::new(0),
            total_tombstones: AtomicU64::new(0),
        })
    }

    /// Store directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// True if no node is live.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Node records appended since open.
    pub fn total_records(&self) -> u64 {
        self.total_records.load(Ordering::Relaxed)
    }

    /// Tombstones appended since open.
    pub fn total_tombstones(&self) -> u64 {
        self.total_tombstones.load(Ordering::Relaxed)
    }

    fn append(&self, inner: &mut StoreInner, record: &[u8]) -> ArborResult<u64> {
        if inner.size > 0 && inner.size + record.len() as u64 > self.config.rotation_size_bytes {
            self.rotate(inner)?;
        }
        let offset = inner.size;
        inner
            .file
            .write_all(record)
            .map_err(|e| io_error(&inner.path, &e, "node file write failed"))?;
        durable_sync(&inner.file).map_err(|e| io_error(&inner.path, &e, "node file durable_sync failed"))?;
        inner.size += record.len() as u64;
        Ok(offset)
    }

    /// Switch to a fresh file; the current one is synced first and becomes
    /// eligible for compaction.
    fn rotate(&self, inner: &mut StoreInner) -> ArborResult<()> {
        durable_sync(&inner.file)
            .map_err(|e| io_error(&inner.path, &e, "sync before rotation failed"))?;
        inner.sequence += 1;
        let path = node_file_path(&self.dir, inner.sequence);
        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, &e, "failed to create rotated node file"))?;
        inner.path = path;
        inner.size = 0;
        Ok(())
    }
}

impl KvDB for FileStore {
    fn get(&self, node_key: &NodeKey) -> ArborResult<Option<Node>> {
        let inner = self.inner.lock();
        let location = match inner.index.get(node_key) {
            Some(location) => *location,
            None => return Ok(None),
        };
        let path = node_file_path(&self.dir, location.file_seq);
        read_record(&path, location.offset, *node_key).map(Some)
    }

    fn set(&self, node: &Node) -> ArborResult<usize> {
        let node_key = node.node_key().ok_or_else(|| ArborError::Decode {
            reason: "cannot store a node without an assigned node key".to_string(),
        })?;
        let payload = encode_node(node)?;
        let record = encode_record(node_key, &payload, false);

        let mut inner = self.inner.lock();
        let offset = self.append(&mut inner, &record)?;
        let file_seq = inner.sequence;
        inner.index.insert(node_key, Location { file_seq, offset });
        self.total_records.fetch_add(1, Ordering::Relaxed);
        Ok(record.len())
    }

    fn delete(&self, node_key: &NodeKey) -> ArborResult<()> {
        let mut inner = self.inner.lock();
        // absent keys need no tombstone: there is nothing to mask
        if inner.index.remove(node_key).is_none() {
            return Ok(());
        }
        let record = encode_record(*node_key, &[], true);
        self.append(&mut inner, &record)?;
        self.total_tombstones.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A record recovered from a file scan.
pub(crate) struct ScannedRecord {
    pub(crate) header: RecordHeader,
    pub(crate) offset: u64,
    pub(crate) payload: Vec<u8>,
}

/// Scan a file buffer for valid records.
///
/// Corrupt headers and checksum failures are skipped by resynchronizing on
/// the next magic; a torn record at the tail is the crash point and ends
/// the scan.
pub(crate) fn scan_records(buffer: &[u8], path: &Path) -> Vec<ScannedRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + RECORD_HEADER_SIZE <= buffer.len() {
        let header_bytes: [u8; RECORD_HEADER_SIZE] = buffer[offset..offset + RECORD_HEADER_SIZE]
            .try_into()
            .expect("fixed-size slice");
        if !RecordHeader::magic_matches(&header_bytes) {
            log::warn!("{}: bad magic at offset {}, scanning for next record", path.display(), offset);
            match find_next_magic(buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        let header = RecordHeader::from_bytes(&header_bytes);
        let total = RECORD_HEADER_SIZE + header.payload_len as usize;
        if offset + total > buffer.len() {
            // torn write: the record started but never completed
            log::warn!(
                "{}: torn record at offset {}: need {} bytes, have {}",
                path.display(),
                offset,
                total,
                buffer.len() - offset
            );
            break;
        }

        let payload = &buffer[offset + RECORD_HEADER_SIZE..offset + total];
        if crc32c::crc32c(payload) != header.checksum {
            log::warn!("{}: checksum mismatch at offset {}, skipping record", path.display(), offset);
            match find_next_magic(buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        records.push(ScannedRecord { header, offset: offset as u64, payload: payload.to_vec() });
        offset += total;
    }

    records
}

/// Read one record back by location, verifying magic, identity and CRC.
fn read_record(path: &Path, offset: u64, node_key: NodeKey) -> ArborResult<Node> {
    let mut file = File::open(path).map_err(|e| io_error(path, &e, "failed to open node file"))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| io_error(path, &e, "failed to seek node file"))?;

    let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header_bytes)
        .map_err(|e| io_error(path, &e, "failed to read record header"))?;
    if !RecordHeader::magic_matches(&header_bytes) {
        return Err(ArborError::StoreCorrupted {
            path: path.to_path_buf(),
            offset,
            reason: "record magic not found".to_string(),
        });
    }
    let header = RecordHeader::from_bytes(&header_bytes);
    if header.node_key != node_key {
        return Err(ArborError::StoreCorrupted {
            path: path.to_path_buf(),
            offset,
            reason: format!("index points at record for {}", header.node_key),
        });
    }
    if header.is_tombstone() {
        return Err(ArborError::StoreCorrupted {
            path: path.to_path_buf(),
            offset,
            reason: "index points at a tombstone".to_string(),
        });
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    file.read_exact(&mut payload)
        .map_err(|e| io_error(path, &e, "failed to read record payload"))?;
    let actual = crc32c::crc32c(&payload);
    if actual != header.checksum {
        return Err(ArborError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual,
            offset,
        });
    }

    decode_node(node_key, &payload)
}

/// Node files in `dir`, sorted by sequence number.
pub(crate) fn list_node_files(dir: &Path) -> ArborResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    let entries =
        std::fs::read_dir(dir).map_err(|e| io_error(dir, &e, "failed to read store directory"))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, &e, "failed to read directory entry"))?;
        let path = entry.path();
        if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_file_seq) {
            files.push((seq, path));
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn node_file_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("nodes-{:016x}.arbr", sequence))
}

fn parse_file_seq(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("nodes-")?.strip_suffix(".arbr")?;
    u64::from_str_radix(hex, 16).ok()
}

pub(crate) fn io_error(path: &Path, err: &std::io::Error, what: &str) -> ArborError {
    ArborError::Io {
        path: Some(path.to_path_buf()),
        kind: err.kind(),
        message: format!("{}: {}", what, err),
    }
}
