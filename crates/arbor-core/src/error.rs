//! Error types for arbor operations
//!
//! All arbor errors are represented by the ArborError enum, which carries
//! enough context to pinpoint the failing node or file region.
//!
//! Absence is never an error: `get` on a missing key and `delete` of an
//! absent node key are answered with `Option`/no-op results. Errors are
//! reserved for I/O failures and consistency violations, both of which are
//! fatal to the operation in progress.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::node::NodeKey;

/// arbor error types with detailed context
#[derive(Debug, Clone)]
pub enum ArborError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A referenced node resolved in neither the pool nor the backend.
    /// This is a consistency violation, fatal to the operation in progress.
    NodeMissing {
        /// The node key that failed to resolve
        node_key: NodeKey,
    },

    /// Node bytes read from a backend could not be decoded
    Decode {
        /// Description of the malformation
        reason: String,
    },

    /// A node file is structurally damaged
    StoreCorrupted {
        /// Path to the damaged file
        path: PathBuf,
        /// Byte offset where the damage was detected
        offset: u64,
        /// Description of the damage
        reason: String,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        /// File where the checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// The checkpoint worker is no longer running
    CheckpointClosed {
        /// Why the worker is gone (its terminal error, or a plain shutdown)
        reason: String,
    },
}

impl fmt::Display for ArborError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArborError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            ArborError::NodeMissing { node_key } => {
                write!(f, "node {} resolves in neither pool nor backend", node_key)
            }

            ArborError::Decode { reason } => {
                write!(f, "failed to decode node record: {}", reason)
            }

            ArborError::StoreCorrupted { path, offset, reason } => {
                write!(f, "store corrupted in {} at offset {}: {}", path.display(), offset, reason)
            }

            ArborError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(f, "checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), offset, expected, actual)
            }

            ArborError::CheckpointClosed { reason } => {
                write!(f, "checkpoint worker is not running: {}", reason)
            }
        }
    }
}

impl Error for ArborError {}

/// Convert std::io::Error to ArborError::Io
impl From<std::io::Error> for ArborError {
    fn from(err: std::io::Error) -> Self {
        ArborError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for arbor operations
pub type ArborResult<T> = Result<T, ArborError>;
