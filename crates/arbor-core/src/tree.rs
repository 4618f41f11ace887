//! Versioned Merkle-AVL tree — the engine's public surface
//!
//! The tree exposes a plain key-value contract (`get`, `set`, `remove`)
//! over copy-on-write versions. Mutations never touch a finalized node:
//! every finalized node on a mutation path is copied into a fresh pool
//! slot and the original's identity is queued for deletion at the next
//! checkpoint. Nodes created within the open version are mutated freely;
//! no finalized version can reach them.
//!
//! `save_version` freezes the open version: it walks the dirty set in
//! post-order, hashes bottom-up, assigns `(version, sequence)` identities
//! in that fixed order, and accumulates the finalized nodes for the
//! checkpoint pipeline. Identical operation sequences therefore produce
//! identical root hashes and identical identities, which is what lets
//! independent replicas agree on state roots.
//!
//! One logical writer per tree; readers of finalized versions are safe
//! concurrently because finalized subtrees never change.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::backend::KvDB;
use crate::checkpoint::{CheckpointBatch, Checkpointer};
use crate::config::TreeConfig;
use crate::error::{ArborError, ArborResult};
use crate::node::{hash_empty, hash_internal, hash_leaf, Node, NodeHash, NodeKey, NodeRef, SlotId};
use crate::pool::{NodePool, PoolInner};

/// Versioned Merkle-AVL key-value tree.
pub struct Tree {
    pool: Arc<NodePool>,
    db: Arc<dyn KvDB>,
    checkpointer: Option<Checkpointer>,
    config: TreeConfig,
    /// Root of the working version; `Key` form when unchanged since the
    /// last `save_version`
    root: Option<NodeRef>,
    /// Last finalized version; the open working version is `version + 1`
    version: i64,
    last_saved_hash: Option<NodeHash>,
    root_height: i8,
    root_size: i64,
    /// Finalized nodes awaiting the next checkpoint
    pending_set: Vec<Node>,
    /// Superseded identities awaiting the next checkpoint
    pending_delete: Vec<NodeKey>,
    last_checkpoint_version: i64,
}

impl Tree {
    /// Create an empty tree over the given backend and start its
    /// checkpoint worker.
    pub fn new(db: Arc<dyn KvDB>, config: TreeConfig) -> ArborResult<Self> {
        let pool = Arc::new(NodePool::new(config.pool_capacity));
        let checkpointer = Checkpointer::start(Arc::clone(&db), Arc::clone(&pool))?;
        Ok(Self {
            pool,
            db,
            checkpointer: Some(checkpointer),
            config,
            root: None,
            version: 0,
            last_saved_hash: None,
            root_height: 0,
            root_size: 0,
            pending_set: Vec::new(),
            pending_delete: Vec::new(),
            last_checkpoint_version: 0,
        })
    }

    /// Read a key. Never dirties a node; cold subtrees are pulled from the
    /// backend into the pool as clean residents.
    pub fn get(&self, key: &[u8]) -> ArborResult<Option<Vec<u8>>> {
        let mut cur = match self.root {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut inner = self.pool.lock();
        let result = loop {
            let slot = resolve(&mut inner, self.db.as_ref(), cur)?;
            let node = inner.node(slot);
            if node.is_leaf() {
                break if node.key() == key { Some(node.value().to_vec()) } else { None };
            }
            let next = if key < node.key() { node.left } else { node.right };
            cur = next.expect("internal node has two children");
        };
        self.pool.record_evicted(inner.sweep());
        Ok(result)
    }

    /// Insert or update a key. Returns true when an existing value was
    /// replaced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> ArborResult<bool> {
        let pool = Arc::clone(&self.pool);
        let mut inner = pool.lock();
        let (root_slot, updated) = match self.root {
            None => (inner.allocate(Node::leaf(key.to_vec(), value.to_vec())), false),
            Some(r) => recursive_set(
                &mut inner,
                self.db.as_ref(),
                &mut self.pending_delete,
                r,
                key,
                value,
            )?,
        };
        let node = inner.node(root_slot);
        self.root_height = node.subtree_height();
        self.root_size = node.size();
        self.root = Some(NodeRef::Slot(root_slot));
        self.pool.record_evicted(inner.sweep());
        Ok(updated)
    }

    /// Remove a key, returning its value when present. An absent key is
    /// not an error.
    pub fn remove(&mut self, key: &[u8]) -> ArborResult<Option<Vec<u8>>> {
        let root_ref = match self.root {
            Some(r) => r,
            None => return Ok(None),
        };
        let pool = Arc::clone(&self.pool);
        let mut inner = pool.lock();
        let step = recursive_remove(
            &mut inner,
            self.db.as_ref(),
            &mut self.pending_delete,
            root_ref,
            key,
        )?;
        if step.value.is_some() {
            match step.subtree {
                None => {
                    self.root = None;
                    self.root_height = 0;
                    self.root_size = 0;
                }
                Some(r) => {
                    let slot = resolve(&mut inner, self.db.as_ref(), r)?;
                    let node = inner.node(slot);
                    self.root_height = node.subtree_height();
                    self.root_size = node.size();
                    self.root = Some(r);
                }
            }
        }
        self.pool.record_evicted(inner.sweep());
        Ok(step.value)
    }

    /// Finalize the open version: hash bottom-up, assign identities in
    /// post-order, accumulate the checkpoint batch, and bump the version.
    /// Triggers a checkpoint every `checkpoint_interval` versions.
    pub fn save_version(&mut self) -> ArborResult<(NodeHash, i64)> {
        let version = self.version + 1;
        let root_hash = {
            let pool = Arc::clone(&self.pool);
            let mut inner = pool.lock();
            let hash = match self.root {
                None => hash_empty(),
                Some(NodeRef::Key(node_key)) => {
                    // no structural change this version; the root hash is
                    // already fixed
                    let slot = resolve(&mut inner, self.db.as_ref(), NodeRef::Key(node_key))?;
                    inner.node(slot).hash().copied().expect("finalized nodes carry a hash")
                }
                Some(NodeRef::Slot(root_slot)) => {
                    let mut sequence = 0i64;
                    let (root_key, root_hash) = finalize(
                        &mut inner,
                        self.db.as_ref(),
                        root_slot,
                        version,
                        &mut sequence,
                        &mut self.pending_set,
                    )?;
                    self.root = Some(NodeRef::Key(root_key));
                    root_hash
                }
            };
            self.pool.record_evicted(inner.sweep());
            hash
        };
        self.version = version;
        self.last_saved_hash = Some(root_hash);
        log::debug!(
            "saved version={} root={} size={}",
            version,
            hex::encode(root_hash),
            self.root_size
        );
        if version - self.last_checkpoint_version >= self.config.checkpoint_interval {
            self.checkpoint()?;
        }
        Ok((root_hash, version))
    }

    /// Hand the accumulated batch to the checkpoint worker. Blocks until
    /// the worker accepts it, not until it is durable.
    pub fn checkpoint(&mut self) -> ArborResult<()> {
        if self.pending_set.is_empty() && self.pending_delete.is_empty() {
            self.last_checkpoint_version = self.version;
            return Ok(());
        }
        let batch = CheckpointBatch {
            set: std::mem::take(&mut self.pending_set),
            delete: std::mem::take(&mut self.pending_delete),
            version: self.version,
        };
        let checkpointer = self.checkpointer.as_ref().ok_or_else(|| ArborError::CheckpointClosed {
            reason: "tree is closed".to_string(),
        })?;
        checkpointer.submit(batch)?;
        self.last_checkpoint_version = self.version;
        Ok(())
    }

    /// Flush pending work and stop the checkpoint worker, surfacing any
    /// error it hit.
    pub fn close(mut self) -> ArborResult<()> {
        self.checkpoint()?;
        match self.checkpointer.take() {
            Some(checkpointer) => checkpointer.shutdown(),
            None => Ok(()),
        }
    }

    /// Last finalized version; 0 before the first `save_version`.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Number of leaves in the working tree.
    pub fn size(&self) -> i64 {
        self.root_size
    }

    /// Height of the working tree: the root's subtree height, 0 when
    /// empty or a single leaf.
    pub fn height(&self) -> i8 {
        self.root_height
    }

    /// Root hash of the last finalized version.
    pub fn root_hash(&self) -> Option<NodeHash> {
        self.last_saved_hash
    }

    /// Durable identity of the root, available while the tree is
    /// unchanged since the last `save_version`.
    pub fn root_node_key(&self) -> Option<NodeKey> {
        self.root.and_then(|r| r.node_key())
    }

    /// Nodes created or mutated since the last completed checkpoint.
    pub fn dirty_count(&self) -> usize {
        self.pool.dirty_count()
    }

    /// The shared node pool, for residency and reclamation statistics.
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }
}

/// Child references of an internal node.
fn children(node: &Node) -> (NodeRef, NodeRef) {
    debug_assert!(!node.is_leaf());
    (
        node.left.expect("internal node has a left child"),
        node.right.expect("internal node has a right child"),
    )
}

/// Resolve a reference to a pool slot: working slot as-is, finalized key
/// through the resident index, then the backend. A total miss is fatal.
fn resolve(pool: &mut PoolInner, db: &dyn KvDB, r: NodeRef) -> ArborResult<SlotId> {
    match r {
        NodeRef::Slot(slot) => Ok(slot),
        NodeRef::Key(node_key) => {
            if let Some(slot) = pool.lookup(&node_key) {
                return Ok(slot);
            }
            let node = db.get(&node_key)?.ok_or(ArborError::NodeMissing { node_key })?;
            Ok(pool.admit(node))
        }
    }
}

/// Get a mutable working slot for a node on the mutation path. A working
/// slot passes through; a finalized node is copied and its identity is
/// recorded as superseded.
fn working_copy(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    r: NodeRef,
) -> ArborResult<SlotId> {
    match r {
        NodeRef::Slot(slot) => Ok(slot),
        NodeRef::Key(node_key) => {
            let slot = resolve(pool, db, r)?;
            let copy = pool.node(slot).working_clone();
            obsolete.push(node_key);
            Ok(pool.allocate(copy))
        }
    }
}

/// Drop a node that is no longer part of the working tree: a working node
/// goes back to the free list, a finalized one is queued for backend
/// deletion.
fn supersede(pool: &mut PoolInner, obsolete: &mut Vec<NodeKey>, r: NodeRef) {
    match r {
        NodeRef::Slot(slot) => pool.discard(slot),
        NodeRef::Key(node_key) => obsolete.push(node_key),
    }
}

/// Recompute a working internal node's height and size from its children.
fn update_height_size(pool: &mut PoolInner, db: &dyn KvDB, slot: SlotId) -> ArborResult<()> {
    let (left_ref, right_ref) = children(pool.node(slot));
    let left_slot = resolve(pool, db, left_ref)?;
    let (left_height, left_size) = {
        let n = pool.node(left_slot);
        (n.subtree_height(), n.size())
    };
    let right_slot = resolve(pool, db, right_ref)?;
    let (right_height, right_size) = {
        let n = pool.node(right_slot);
        (n.subtree_height(), n.size())
    };
    let node = pool.node_mut(slot);
    node.subtree_height = 1 + left_height.max(right_height);
    node.size = left_size + right_size;
    Ok(())
}

/// Left height minus right height.
fn balance_factor(pool: &mut PoolInner, db: &dyn KvDB, slot: SlotId) -> ArborResult<i32> {
    if pool.node(slot).is_leaf() {
        return Ok(0);
    }
    let (left_ref, right_ref) = children(pool.node(slot));
    let left_slot = resolve(pool, db, left_ref)?;
    let left_height = pool.node(left_slot).subtree_height();
    let right_slot = resolve(pool, db, right_ref)?;
    let right_height = pool.node(right_slot).subtree_height();
    Ok(left_height as i32 - right_height as i32)
}

/// Rotate the subtree at `r` right; returns the new subtree root's slot.
fn rotate_right(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    r: NodeRef,
) -> ArborResult<SlotId> {
    let slot = working_copy(pool, db, obsolete, r)?;
    let (left_ref, _) = children(pool.node(slot));
    let pivot = working_copy(pool, db, obsolete, left_ref)?;
    let (_, pivot_right) = children(pool.node(pivot));

    pool.node_mut(slot).left = Some(pivot_right);
    update_height_size(pool, db, slot)?;
    pool.node_mut(pivot).right = Some(NodeRef::Slot(slot));
    update_height_size(pool, db, pivot)?;
    Ok(pivot)
}

/// Rotate the subtree at `r` left; returns the new subtree root's slot.
fn rotate_left(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    r: NodeRef,
) -> ArborResult<SlotId> {
    let slot = working_copy(pool, db, obsolete, r)?;
    let (_, right_ref) = children(pool.node(slot));
    let pivot = working_copy(pool, db, obsolete, right_ref)?;
    let (pivot_left, _) = children(pool.node(pivot));

    pool.node_mut(slot).right = Some(pivot_left);
    update_height_size(pool, db, slot)?;
    pool.node_mut(pivot).left = Some(NodeRef::Slot(slot));
    update_height_size(pool, db, pivot)?;
    Ok(pivot)
}

/// Restore the AVL invariant at a working node whose height and size are
/// current. Single or double rotation as the child balance dictates.
fn rebalance(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    slot: SlotId,
) -> ArborResult<SlotId> {
    let factor = balance_factor(pool, db, slot)?;
    if factor > 1 {
        let (left_ref, _) = children(pool.node(slot));
        let left_slot = resolve(pool, db, left_ref)?;
        if balance_factor(pool, db, left_slot)? >= 0 {
            rotate_right(pool, db, obsolete, NodeRef::Slot(slot))
        } else {
            let new_left = rotate_left(pool, db, obsolete, left_ref)?;
            pool.node_mut(slot).left = Some(NodeRef::Slot(new_left));
            rotate_right(pool, db, obsolete, NodeRef::Slot(slot))
        }
    } else if factor < -1 {
        let (_, right_ref) = children(pool.node(slot));
        let right_slot = resolve(pool, db, right_ref)?;
        if balance_factor(pool, db, right_slot)? <= 0 {
            rotate_left(pool, db, obsolete, NodeRef::Slot(slot))
        } else {
            let new_right = rotate_right(pool, db, obsolete, right_ref)?;
            pool.node_mut(slot).right = Some(NodeRef::Slot(new_right));
            rotate_left(pool, db, obsolete, NodeRef::Slot(slot))
        }
    } else {
        Ok(slot)
    }
}

/// Copy-on-write insert or update. Returns the new subtree root and
/// whether an existing value was replaced.
fn recursive_set(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    r: NodeRef,
    key: &[u8],
    value: &[u8],
) -> ArborResult<(SlotId, bool)> {
    let slot = resolve(pool, db, r)?;

    if pool.node(slot).is_leaf() {
        let ordering = key.cmp(pool.node(slot).key());
        return match ordering {
            CmpOrdering::Equal => {
                let working = working_copy(pool, db, obsolete, r)?;
                let node = pool.node_mut(working);
                node.value = value.to_vec();
                node.hash = None;
                Ok((working, true))
            }
            CmpOrdering::Less => {
                // split: the new leaf goes left, the existing leaf's key
                // becomes the routing key
                let routing = pool.node(slot).key().to_vec();
                let leaf = pool.allocate(Node::leaf(key.to_vec(), value.to_vec()));
                let inner = pool.allocate(Node::internal(routing, NodeRef::Slot(leaf), r, 1, 2));
                Ok((inner, false))
            }
            CmpOrdering::Greater => {
                let leaf = pool.allocate(Node::leaf(key.to_vec(), value.to_vec()));
                let inner = pool.allocate(Node::internal(key.to_vec(), r, NodeRef::Slot(leaf), 1, 2));
                Ok((inner, false))
            }
        };
    }

    let working = working_copy(pool, db, obsolete, r)?;
    let go_left = key < pool.node(working).key();
    let child_ref = {
        let (left_ref, right_ref) = children(pool.node(working));
        if go_left { left_ref } else { right_ref }
    };
    let (new_child, updated) = recursive_set(pool, db, obsolete, child_ref, key, value)?;
    {
        let node = pool.node_mut(working);
        if go_left {
            node.left = Some(NodeRef::Slot(new_child));
        } else {
            node.right = Some(NodeRef::Slot(new_child));
        }
    }
    if updated {
        // value replacement: shape, heights and sizes are unchanged
        return Ok((working, true));
    }
    update_height_size(pool, db, working)?;
    let balanced = rebalance(pool, db, obsolete, working)?;
    Ok((balanced, false))
}

/// Result of one removal step.
struct RemoveStep {
    /// Replacement subtree; `None` when the subtree vanished entirely
    subtree: Option<NodeRef>,
    /// Replacement routing key for the nearest ancestor that branched
    /// right onto this path
    routing_key: Option<Vec<u8>>,
    /// The removed value, when the key was found
    value: Option<Vec<u8>>,
}

impl RemoveStep {
    fn not_found(r: NodeRef) -> Self {
        Self { subtree: Some(r), routing_key: None, value: None }
    }
}

/// Copy-on-write removal with AVL rebalancing along the affected path.
fn recursive_remove(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    obsolete: &mut Vec<NodeKey>,
    r: NodeRef,
    key: &[u8],
) -> ArborResult<RemoveStep> {
    let slot = resolve(pool, db, r)?;

    if pool.node(slot).is_leaf() {
        if pool.node(slot).key() != key {
            return Ok(RemoveStep::not_found(r));
        }
        let value = pool.node(slot).value().to_vec();
        supersede(pool, obsolete, r);
        return Ok(RemoveStep { subtree: None, routing_key: None, value: Some(value) });
    }

    let (routing, left_ref, right_ref) = {
        let node = pool.node(slot);
        let (left_ref, right_ref) = children(node);
        (node.key().to_vec(), left_ref, right_ref)
    };

    if key < routing.as_slice() {
        let step = recursive_remove(pool, db, obsolete, left_ref, key)?;
        if step.value.is_none() {
            return Ok(RemoveStep::not_found(r));
        }
        match step.subtree {
            None => {
                // the left leaf is gone: this node collapses to its right
                // child, and the nearest right-branching ancestor takes
                // this node's routing key
                supersede(pool, obsolete, r);
                Ok(RemoveStep {
                    subtree: Some(right_ref),
                    routing_key: Some(routing),
                    value: step.value,
                })
            }
            Some(new_left) => {
                let working = working_copy(pool, db, obsolete, r)?;
                pool.node_mut(working).left = Some(new_left);
                update_height_size(pool, db, working)?;
                let balanced = rebalance(pool, db, obsolete, working)?;
                Ok(RemoveStep {
                    subtree: Some(NodeRef::Slot(balanced)),
                    routing_key: step.routing_key,
                    value: step.value,
                })
            }
        }
    } else {
        let step = recursive_remove(pool, db, obsolete, right_ref, key)?;
        if step.value.is_none() {
            return Ok(RemoveStep::not_found(r));
        }
        match step.subtree {
            None => {
                // the right leaf is gone: collapse to the left child
                supersede(pool, obsolete, r);
                Ok(RemoveStep { subtree: Some(left_ref), routing_key: None, value: step.value })
            }
            Some(new_right) => {
                let working = working_copy(pool, db, obsolete, r)?;
                {
                    let node = pool.node_mut(working);
                    node.right = Some(new_right);
                    if let Some(routing_key) = step.routing_key {
                        node.key = routing_key;
                    }
                }
                update_height_size(pool, db, working)?;
                let balanced = rebalance(pool, db, obsolete, working)?;
                Ok(RemoveStep {
                    subtree: Some(NodeRef::Slot(balanced)),
                    routing_key: None,
                    value: step.value,
                })
            }
        }
    }
}

/// Post-order finalization: hash children before parents, then assign the
/// next sequence. The fixed order makes identities and hashes reproducible
/// across runs.
fn finalize(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    slot: SlotId,
    version: i64,
    sequence: &mut i64,
    out: &mut Vec<Node>,
) -> ArborResult<(NodeKey, NodeHash)> {
    let hash = if pool.node(slot).is_leaf() {
        let node = pool.node(slot);
        hash_leaf(node.key(), node.value())
    } else {
        let (left_ref, right_ref) = children(pool.node(slot));
        let (left_key, left_hash) = finalize_child(pool, db, left_ref, version, sequence, out)?;
        let (right_key, right_hash) = finalize_child(pool, db, right_ref, version, sequence, out)?;
        let node = pool.node_mut(slot);
        node.left = Some(NodeRef::Key(left_key));
        node.right = Some(NodeRef::Key(right_key));
        hash_internal(node.subtree_height, node.size, &left_hash, &right_hash)
    };

    *sequence += 1;
    let node_key = NodeKey::new(version, *sequence);
    {
        let node = pool.node_mut(slot);
        node.hash = Some(hash);
        node.node_key = Some(node_key);
    }
    pool.register(node_key, slot);
    out.push(pool.node(slot).clone());
    Ok((node_key, hash))
}

/// Finalize a child reference: descend into working slots, read the fixed
/// hash of already-finalized subtrees.
fn finalize_child(
    pool: &mut PoolInner,
    db: &dyn KvDB,
    r: NodeRef,
    version: i64,
    sequence: &mut i64,
    out: &mut Vec<Node>,
) -> ArborResult<(NodeKey, NodeHash)> {
    match r {
        NodeRef::Slot(slot) => finalize(pool, db, slot, version, sequence, out),
        NodeRef::Key(node_key) => {
            let slot = resolve(pool, db, r)?;
            let hash = pool.node(slot).hash().copied().expect("finalized nodes carry a hash");
            Ok((node_key, hash))
        }
    }
}
