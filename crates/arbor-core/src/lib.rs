//! arbor-core — Versioned Merkle-AVL key-value engine
//!
//! A balanced binary search tree whose every node carries a content hash,
//! used as the state backend for deterministic ledgers. Every mutation
//! produces a new immutable version that shares unmodified subtrees with
//! prior versions, so historical roots stay readable and independent
//! replicas reproduce identical state roots from identical input.
//!
//! # Architecture
//!
//! - **Mutation path**: copy-on-write AVL insert/remove over pool slots;
//!   finalized nodes are never touched, only superseded
//! - **Versioning**: `save_version` hashes the dirty set bottom-up and
//!   assigns `(version, sequence)` identities in fixed post-order
//! - **Background**: a checkpoint worker drains finalized nodes to the
//!   durable backend over a rendezvous handoff, one batch in flight
//!
//! # Pluggable durability
//!
//! The engine persists through the narrow `KvDB` contract and ships an
//! in-memory reference backend. Durable backends live in separate crates
//! (e.g. arbor-store's log-structured file store).

pub mod backend;
mod checkpoint;
pub mod config;
pub mod encoding;
pub mod error;
pub mod node;
pub mod pool;
pub mod tree;

// Re-export key types for convenience
pub use backend::{KvDB, MemoryKv};
pub use config::TreeConfig;
pub use error::{ArborError, ArborResult};
pub use node::{Node, NodeHash, NodeKey, NODE_KEY_SIZE};
pub use pool::NodePool;
pub use tree::Tree;
