//! On-disk record format for node files
//!
//! Every record is a fixed header followed by the encoded node payload:
//! RecordHeader (32 bytes) + payload bytes. Tombstones carry an empty
//! payload and mark a node key as deleted for replay.
//!
//! The CRC32C over the payload catches silent SSD corruption (bit rot);
//! the magic bytes let recovery resynchronize after a damaged region.

use arbor_core::{NodeKey, NODE_KEY_SIZE};

/// Magic bytes identifying arbor node records: "ARBR" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x41, 0x52, 0x42, 0x52];

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 32;

/// Tombstone flag in the flags byte
pub const FLAG_TOMBSTONE: u8 = 0x01;

/// Fixed-size header ahead of each record.
/// Size: 32 bytes
///
/// Layout:
///   [0..4]   magic:       [u8;4] - "ARBR"
///   [4..20]  node_key:    16 bytes, big-endian (version, sequence)
///   [20..24] payload_len: u32 LE - encoded node length (0 for tombstones)
///   [24..28] checksum:    u32 LE - CRC32C of the payload bytes
///   [28]     flags:       u8     - bit 0 = tombstone
///   [29..32] reserved:    [u8;3]
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub node_key: NodeKey,
    pub payload_len: u32,
    pub checksum: u32,
    pub flags: u8,
}

impl RecordHeader {
    pub fn new(node_key: NodeKey, payload_len: u32, checksum: u32, flags: u8) -> Self {
        Self { node_key, payload_len, checksum, flags }
    }

    pub fn is_tombstone(&self) -> bool {
        (self.flags & FLAG_TOMBSTONE) != 0
    }

    /// Serialize the header for writing.
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_ARRAY);
        buf[4..4 + NODE_KEY_SIZE].copy_from_slice(&self.node_key.to_bytes());
        buf[20..24].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[28] = self.flags;
        // bytes 29..32 are reserved, already zero
        buf
    }

    /// Parse a header; the caller validates the magic separately so scans
    /// can resynchronize on mismatch.
    pub fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut key_bytes = [0u8; NODE_KEY_SIZE];
        key_bytes.copy_from_slice(&buf[4..4 + NODE_KEY_SIZE]);
        Self {
            node_key: NodeKey::from_bytes(&key_bytes),
            payload_len: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            checksum: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            flags: buf[28],
        }
    }

    /// True when the first four bytes of `buf` are the record magic.
    pub fn magic_matches(buf: &[u8; RECORD_HEADER_SIZE]) -> bool {
        buf[0..4] == MAGIC_ARRAY
    }
}

/// Assemble a complete record: header + payload.
pub fn encode_record(node_key: NodeKey, payload: &[u8], tombstone: bool) -> Vec<u8> {
    let checksum = crc32c::crc32c(payload);
    let flags = if tombstone { FLAG_TOMBSTONE } else { 0 };
    let header = RecordHeader::new(node_key, payload.len() as u32, checksum, flags);

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Scan forward in a buffer for the next occurrence of the record magic.
/// Used to resynchronize after corruption.
pub fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    (start..=buffer.len() - 4).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}
