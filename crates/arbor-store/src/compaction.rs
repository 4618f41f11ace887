//! Compaction — dead space reclamation for rotated node files
//!
//! Rotated files accumulate superseded records: nodes rewritten by a later
//! checkpoint or deleted outright. Compaction rewrites a file keeping only
//! records the index still points at, then atomically replaces the
//! original:
//!
//! 1. Write surviving records to `nodes-{seq}.arbr.compact`
//! 2. durable_sync the new file
//! 3. Rename over the original (atomic on POSIX)
//! 4. durable_sync the parent directory
//!
//! A crash before the rename leaves the original intact and an orphaned
//! temp file; a crash after leaves the compacted file. Both replay
//! correctly.
//!
//! Tombstones are kept: one may mask a record for the same node key in an
//! older file, and replay order is the only thing standing between that
//! record and resurrection. Record order within the file is preserved for
//! the same reason.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use arbor_core::{ArborResult, NodeKey};

use crate::durability::{durable_sync, sync_dir};
use crate::format::encode_record;
use crate::store::{io_error, list_node_files, scan_records, FileStore, Location, StoreInner};

/// Result of compacting one file.
#[derive(Debug)]
pub struct CompactionResult {
    /// Path to the compacted file
    pub file_path: PathBuf,
    /// Records in the original file
    pub original_records: usize,
    /// Live records kept
    pub live_records: usize,
    /// Tombstones kept
    pub tombstone_records: usize,
    /// Superseded records removed
    pub removed_records: usize,
    /// Original file size in bytes
    pub original_bytes: u64,
    /// Compacted file size in bytes
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Fraction of the original records that were dead.
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_records == 0 {
            return 0.0;
        }
        self.removed_records as f64 / self.original_records as f64
    }

    /// Space reclaimed in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

impl FileStore {
    /// Compact every rotated file whose dead-space ratio exceeds the
    /// configured trigger. The active file is never touched.
    ///
    /// Holds the store lock for the duration: reads and writes wait while
    /// files are rewritten.
    pub fn compact(&self) -> ArborResult<Vec<CompactionResult>> {
        let mut inner = self.inner.lock();
        let trigger = self.config.compaction_trigger_ratio;
        let mut results = Vec::new();
        for (seq, path) in list_node_files(self.dir())? {
            if seq == inner.sequence {
                continue;
            }
            if let Some(result) = compact_file(&mut inner, seq, &path, trigger)? {
                log::info!(
                    "compacted {}: {} -> {} records, {} bytes saved",
                    result.file_path.display(),
                    result.original_records,
                    result.live_records + result.tombstone_records,
                    result.bytes_saved()
                );
                results.push(result);
            }
        }
        Ok(results)
    }
}

/// Compact a single rotated file when its dead-space ratio warrants it.
fn compact_file(
    inner: &mut StoreInner,
    seq: u64,
    path: &Path,
    trigger_ratio: f64,
) -> ArborResult<Option<CompactionResult>> {
    let buffer = std::fs::read(path).map_err(|e| io_error(path, &e, "failed to read file for compaction"))?;
    let original_bytes = buffer.len() as u64;
    let records = scan_records(&buffer, path);
    let original_records = records.len();
    if original_records == 0 {
        return Ok(None);
    }

    // a record is live only while the index still points at it
    let mut survivors = Vec::new();
    let mut live_records = 0usize;
    let mut tombstone_records = 0usize;
    for record in records {
        if record.header.is_tombstone() {
            tombstone_records += 1;
            survivors.push(record);
        } else {
            let current = inner.index.get(&record.header.node_key);
            if current == Some(&Location { file_seq: seq, offset: record.offset }) {
                live_records += 1;
                survivors.push(record);
            }
        }
    }
    let removed_records = original_records - live_records - tombstone_records;
    let ratio = removed_records as f64 / original_records as f64;
    if ratio < trigger_ratio {
        return Ok(None);
    }

    // rewrite survivors in original order to a temp file
    let compact_path = path.with_extension("arbr.compact");
    let mut new_offsets: Vec<(NodeKey, u64)> = Vec::with_capacity(live_records);
    let mut compacted_bytes = 0u64;
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&compact_path)
            .map_err(|e| io_error(&compact_path, &e, "failed to create compact file"))?;

        for record in &survivors {
            let bytes =
                encode_record(record.header.node_key, &record.payload, record.header.is_tombstone());
            if !record.header.is_tombstone() {
                new_offsets.push((record.header.node_key, compacted_bytes));
            }
            file.write_all(&bytes)
                .map_err(|e| io_error(&compact_path, &e, "compact file write failed"))?;
            compacted_bytes += bytes.len() as u64;
        }
        durable_sync(&file).map_err(|e| io_error(&compact_path, &e, "compact file sync failed"))?;
    }

    // atomic swap, then make the rename itself durable
    std::fs::rename(&compact_path, path)
        .map_err(|e| io_error(path, &e, "failed to rename compact file"))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).map_err(|e| io_error(parent, &e, "failed to sync directory after rename"))?;
    }

    // surviving records moved; repoint their index entries
    for (node_key, offset) in new_offsets {
        inner.index.insert(node_key, Location { file_seq: seq, offset });
    }

    Ok(Some(CompactionResult {
        file_path: path.to_path_buf(),
        original_records,
        live_records,
        tombstone_records,
        removed_records,
        original_bytes,
        compacted_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use arbor_core::{KvDB, Node};
    use tempfile::TempDir;

    fn leaf(key: &[u8], value: &[u8], nk: NodeKey) -> Node {
        Node::durable_leaf(nk, key.to_vec(), value.to_vec())
    }

    /// Store with tiny files so rotation happens quickly.
    fn store(dir: &Path, trigger: f64) -> FileStore {
        let config = StoreConfig { rotation_size_bytes: 1024, compaction_trigger_ratio: trigger };
        FileStore::open(dir, config).unwrap()
    }

    #[test]
    fn test_compaction_result_math() {
        let result = CompactionResult {
            file_path: PathBuf::from("/tmp/nodes-01.arbr"),
            original_records: 10,
            live_records: 3,
            tombstone_records: 1,
            removed_records: 6,
            original_bytes: 1000,
            compacted_bytes: 400,
        };
        assert!((result.dead_space_ratio() - 0.6).abs() < 1e-9);
        assert_eq!(result.bytes_saved(), 600);
    }

    #[test]
    fn test_compact_reclaims_superseded_records() {
        let tmp = TempDir::new().unwrap();
        let fs = store(tmp.path(), 0.3);

        // fill several files
        for i in 1..=40i64 {
            fs.set(&leaf(format!("key{:02}", i).as_bytes(), b"value-one", NodeKey::new(1, i))).unwrap();
        }
        // supersede most of them with rewrites landing in later files
        for i in 1..=30i64 {
            fs.set(&leaf(format!("key{:02}", i).as_bytes(), b"value-two", NodeKey::new(1, i))).unwrap();
        }

        let before: u64 = file_bytes(tmp.path());
        let results = fs.compact().unwrap();
        assert!(!results.is_empty(), "early files should cross the dead-space trigger");
        let after: u64 = file_bytes(tmp.path());
        assert!(after < before, "compaction should shrink the store");

        // every node still resolves, with the latest value
        for i in 1..=30i64 {
            let node = fs.get(&NodeKey::new(1, i)).unwrap().unwrap();
            assert_eq!(node.value(), b"value-two");
        }
        for i in 31..=40i64 {
            let node = fs.get(&NodeKey::new(1, i)).unwrap().unwrap();
            assert_eq!(node.value(), b"value-one");
        }
    }

    #[test]
    fn test_compact_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let fs = store(tmp.path(), 0.2);
            for i in 1..=40i64 {
                fs.set(&leaf(format!("key{:02}", i).as_bytes(), b"first", NodeKey::new(1, i))).unwrap();
            }
            for i in 1..=20i64 {
                fs.delete(&NodeKey::new(1, i)).unwrap();
            }
            fs.compact().unwrap();
        }
        {
            let fs = store(tmp.path(), 0.2);
            assert_eq!(fs.len(), 20);
            for i in 1..=20i64 {
                assert!(fs.get(&NodeKey::new(1, i)).unwrap().is_none());
            }
            for i in 21..=40i64 {
                assert!(fs.get(&NodeKey::new(1, i)).unwrap().is_some());
            }
        }
    }

    #[test]
    fn test_clean_files_left_alone() {
        let tmp = TempDir::new().unwrap();
        let fs = store(tmp.path(), 0.3);
        for i in 1..=40i64 {
            fs.set(&leaf(format!("key{:02}", i).as_bytes(), b"value", NodeKey::new(1, i))).unwrap();
        }
        // nothing superseded: nothing crosses the trigger
        let results = fs.compact().unwrap();
        assert!(results.is_empty());
        for i in 1..=40i64 {
            assert!(fs.get(&NodeKey::new(1, i)).unwrap().is_some());
        }
    }

    fn file_bytes(dir: &Path) -> u64 {
        list_node_files(dir)
            .unwrap()
            .iter()
            .map(|(_, path)| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}
