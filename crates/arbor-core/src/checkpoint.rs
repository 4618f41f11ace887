//! Checkpoint worker — persists finalized nodes without stalling mutation
//!
//! The tree hands finished batches to a dedicated worker thread over a
//! zero-capacity rendezvous channel: `submit` blocks until the worker takes
//! the batch, and the worker blocks between batches until one arrives. That
//! gives backpressure for free and guarantees at most one batch is ever in
//! flight, so backend writes are never interleaved.
//!
//! Within a batch, deletions are applied before writes. A node finalized
//! and then superseded between two checkpoints appears in both lists, and
//! delete-before-set keeps its durable copy alive, so every version inside
//! the window stays readable from the backend.
//!
//! A backend error terminates the run loop; it is stored for the owner and
//! surfaces from the next `submit` or from `shutdown`. Restarting is the
//! caller's concern.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

use crate::backend::KvDB;
use crate::error::{ArborError, ArborResult};
use crate::node::{Node, NodeKey};
use crate::pool::NodePool;

/// One checkpoint's worth of durable work.
pub(crate) struct CheckpointBatch {
    /// Finalized nodes to persist
    pub(crate) set: Vec<Node>,
    /// Superseded identities to remove
    pub(crate) delete: Vec<NodeKey>,
    /// Highest version covered by this batch
    pub(crate) version: i64,
}

/// Handle to the running checkpoint worker. Dropping it stops the thread.
pub(crate) struct Checkpointer {
    batch_tx: Option<Sender<CheckpointBatch>>,
    shutdown_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<ArborError>>>,
}

impl Checkpointer {
    /// Spawn the worker thread.
    pub(crate) fn start(db: Arc<dyn KvDB>, pool: Arc<NodePool>) -> ArborResult<Checkpointer> {
        let (batch_tx, batch_rx) = bounded::<CheckpointBatch>(0);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let failure: Arc<Mutex<Option<ArborError>>> = Arc::new(Mutex::new(None));
        let failure_slot = Arc::clone(&failure);

        let thread = thread::Builder::new()
            .name("arbor-checkpoint".to_string())
            .spawn(move || {
                if let Err(err) = run(batch_rx, shutdown_rx, &*db, &pool) {
                    log::error!("checkpoint worker stopped: {}", err);
                    *failure_slot.lock() = Some(err);
                }
            })
            .map_err(|e| ArborError::Io {
                path: None,
                kind: e.kind(),
                message: format!("Failed to spawn checkpoint thread: {}", e),
            })?;

        Ok(Checkpointer {
            batch_tx: Some(batch_tx),
            shutdown_tx,
            thread: Some(thread),
            failure,
        })
    }

    /// Hand a batch to the worker. Blocks until the worker accepts it,
    /// not until it is durable.
    pub(crate) fn submit(&self, batch: CheckpointBatch) -> ArborResult<()> {
        let tx = match &self.batch_tx {
            Some(tx) => tx,
            None => return Err(self.closed_error()),
        };
        tx.send(batch).map_err(|_| self.closed_error())
    }

    /// Stop the worker and surface any error it hit.
    pub(crate) fn shutdown(mut self) -> ArborResult<()> {
        self.stop();
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        // disconnecting the batch channel wakes a blocked recv; the signal
        // covers the select path
        self.batch_tx = None;
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn closed_error(&self) -> ArborError {
        match self.failure.lock().clone() {
            Some(err) => err,
            None => ArborError::CheckpointClosed {
                reason: "worker terminated".to_string(),
            },
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: one batch at a time, prompt exit on shutdown or disconnect.
fn run(
    batch_rx: Receiver<CheckpointBatch>,
    shutdown_rx: Receiver<()>,
    db: &dyn KvDB,
    pool: &NodePool,
) -> ArborResult<()> {
    loop {
        select! {
            recv(batch_rx) -> msg => match msg {
                Ok(batch) => apply(db, pool, batch)?,
                Err(_) => return Ok(()),
            },
            recv(shutdown_rx) -> _ => return Ok(()),
        }
    }
}

/// Apply one batch: deletes first, then writes, in NodeKey byte order.
fn apply(db: &dyn KvDB, pool: &NodePool, mut batch: CheckpointBatch) -> ArborResult<()> {
    let start = Instant::now();
    log::info!(
        "checkpoint start version={} set={} delete={}",
        batch.version,
        batch.set.len(),
        batch.delete.len()
    );

    // NodeKey's derived order equals its byte order, so these sorts give
    // byte-ordered, sequential backend writes.
    batch.delete.sort_unstable();
    batch.set.sort_by_key(|node| node.node_key());

    for node_key in &batch.delete {
        db.delete(node_key)?;
    }

    let mut db_bytes = 0usize;
    for node in &batch.set {
        db_bytes += db.set(node)?;
        if let Some(node_key) = node.node_key() {
            pool.put(&node_key);
        }
    }

    log::info!(
        "checkpoint done version={} set={} delete={} db_bytes={} elapsed={:?}",
        batch.version,
        batch.set.len(),
        batch.delete.len(),
        db_bytes,
        start.elapsed()
    );
    Ok(())
}
