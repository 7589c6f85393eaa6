//! Durable store backed by `sled`
//!
//! One `sled` database per node, one tree per queue. Outgoing messages live in
//! the reserved `__outgoing` tree, which is created when the store is opened.
//!
//! Writes are buffered in a [`Transaction`] and applied by the single writer
//! thread as one multi-tree `sled` transaction followed by a flush, so a batch
//! is either entirely on disk or not there at all. Reads go straight to the
//! trees.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use sled::transaction::{ConflictableTransactionResult, Transactional};
use sled::{Db, Tree};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::{Message, OutgoingMessage};
use crate::config::StoreSettings;
use crate::persistence::codec;
use crate::persistence::transaction::{Batch, Op, Transaction};
use crate::persistence::writer::{Job, Writer};
use crate::utils::{QueueError, Result};

/// Tree holding messages waiting to be handed to the network sender.
pub const OUTGOING_TREE: &str = "__outgoing";

const RESERVED_PREFIX: &str = "__";

const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// A handle that does not keep the database open.
#[derive(Clone)]
pub(crate) struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

struct StoreInner {
    db: Db,
    outgoing: Tree,
    writer: Writer,
    path: PathBuf,
}

impl Store {
    /// Open or create a store at `path` with the default writer queue size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_WRITER_QUEUE_CAPACITY)
    }

    pub fn open_with(settings: &StoreSettings) -> Result<Self> {
        Self::open_with_capacity(&settings.path, settings.writer_queue_capacity)
    }

    fn open_with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let outgoing = db.open_tree(OUTGOING_TREE)?;
        db.flush()?;
        let writer = Writer::spawn(db.clone(), capacity)?;

        info!(path = %path.display(), "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                outgoing,
                writer,
                path,
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Create the queue if it does not exist yet. Committed on its own.
    pub async fn create_queue(&self, name: &str) -> Result<()> {
        validate_queue_name(name)?;
        let name = name.to_string();
        self.run_on_writer(move |db| create_tree(db, &name)).await
    }

    pub fn create_queue_blocking(&self, name: &str) -> Result<()> {
        validate_queue_name(name)?;
        let name = name.to_string();
        self.run_on_writer_blocking(move |db| create_tree(db, &name))
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        tree_exists(&self.inner.db, name)
    }

    /// Names of all user queues, in key order.
    pub fn queue_names(&self) -> Vec<String> {
        self.inner
            .db
            .tree_names()
            .into_iter()
            .filter_map(|raw| String::from_utf8(raw.to_vec()).ok())
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .collect()
    }

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Run `work` on the writer against a fresh transaction.
    ///
    /// The transaction is committed when `work` returns `Ok`. On `Err`, or if
    /// `work` panics, it is rolled back before the error is returned.
    pub async fn execute<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, reply) = self.unit_of_work(work);
        self.inner.writer.submit(job).await?;
        reply.await.map_err(|_| QueueError::WriterClosed)?
    }

    /// Blocking variant of [`Store::execute`] for callers outside a runtime.
    pub fn execute_blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, reply) = self.unit_of_work(work);
        self.inner.writer.submit_blocking(job)?;
        reply.blocking_recv().map_err(|_| QueueError::WriterClosed)?
    }

    fn unit_of_work<T, F>(&self, work: F) -> (Job, oneshot::Receiver<Result<T>>)
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let store = self.clone();
        let job: Job = Box::new(move |db: &Db| {
            let mut tx = Transaction::new(store);
            let result = match panic::catch_unwind(AssertUnwindSafe(|| work(&mut tx))) {
                Ok(Ok(value)) => apply_batch(db, tx.take_batch()).map(|()| value),
                Ok(Err(e)) => {
                    debug!(error = %e, "unit of work failed, rolling back");
                    tx.rollback();
                    Err(e)
                }
                Err(_) => {
                    warn!("unit of work panicked, rolling back");
                    tx.rollback();
                    Err(QueueError::WorkPanicked)
                }
            };
            let _ = reply_tx.send(result);
        });
        (job, reply_rx)
    }

    pub(crate) async fn apply(&self, batch: Batch) -> Result<()> {
        self.run_on_writer(move |db| apply_batch(db, batch)).await
    }

    pub(crate) fn apply_blocking(&self, batch: Batch) -> Result<()> {
        self.run_on_writer_blocking(move |db| apply_batch(db, batch))
    }

    async fn run_on_writer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Db) -> Result<()> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |db: &Db| {
            let _ = reply_tx.send(f(db));
        });
        self.inner.writer.submit(job).await?;
        reply_rx.await.map_err(|_| QueueError::WriterClosed)?
    }

    fn run_on_writer_blocking<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Db) -> Result<()> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |db: &Db| {
            let _ = reply_tx.send(f(db));
        });
        self.inner.writer.submit_blocking(job)?;
        reply_rx.blocking_recv().map_err(|_| QueueError::WriterClosed)?
    }

    /// Committed value of `key` in `queue`.
    pub fn get(&self, queue: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.existing_tree(queue)?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Every committed key of `queue`.
    pub(crate) fn keys(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let tree = self.existing_tree(queue)?;
        let mut keys = Vec::new();
        for key in tree.iter().keys() {
            keys.push(key?.to_vec());
        }
        Ok(keys)
    }

    pub fn message(&self, queue: &str, id: Uuid) -> Result<Option<Message>> {
        let tree = self.existing_tree(queue)?;
        codec::decode_message(queue, id, |key| Ok(tree.get(key)?.map(|v| v.to_vec())))
    }

    /// Messages of `queue` in `sub_queue` (`None` = not yet received), oldest
    /// first.
    pub fn messages(&self, queue: &str, sub_queue: Option<&str>) -> Result<Vec<Message>> {
        let tree = self.existing_tree(queue)?;
        let mut messages = Vec::new();
        for id in message_ids(&tree)? {
            let decoded =
                codec::decode_message(queue, id, |key| Ok(tree.get(key)?.map(|v| v.to_vec())))?;
            if let Some(message) = decoded {
                if message.sub_queue.as_deref() == sub_queue {
                    messages.push(message);
                }
            }
        }
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// All persisted outgoing messages, oldest first.
    pub fn outgoing_messages(&self) -> Result<Vec<OutgoingMessage>> {
        let tree = &self.inner.outgoing;
        let mut messages = Vec::new();
        for id in message_ids(tree)? {
            let decoded = codec::decode_outgoing(id, |key| Ok(tree.get(key)?.map(|v| v.to_vec())))?;
            if let Some(outgoing) = decoded {
                messages.push(outgoing);
            }
        }
        messages.sort_by(|a, b| {
            a.message
                .sent_at
                .cmp(&b.message.sent_at)
                .then(a.message.id.cmp(&b.message.id))
        });
        Ok(messages)
    }

    pub fn outgoing_message(&self, id: Uuid) -> Result<Option<OutgoingMessage>> {
        let tree = &self.inner.outgoing;
        codec::decode_outgoing(id, |key| Ok(tree.get(key)?.map(|v| v.to_vec())))
    }

    /// Flush, stop the writer and release this handle.
    ///
    /// The database itself is released once every clone of the store, and
    /// every transaction holding one, has been dropped.
    pub fn close(self) -> Result<()> {
        self.inner.writer.shutdown();
        self.inner.db.flush()?;
        info!(path = %self.inner.path.display(), "store closed");
        Ok(())
    }

    fn existing_tree(&self, queue: &str) -> Result<Tree> {
        if queue == OUTGOING_TREE {
            return Ok(self.inner.outgoing.clone());
        }
        if !tree_exists(&self.inner.db, queue) {
            return Err(QueueError::QueueDoesNotExist(queue.to_string()));
        }
        Ok(self.inner.db.open_tree(queue)?)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("db", &"sled::Db")
            .finish()
    }
}

fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
        return Err(QueueError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

fn tree_exists(db: &Db, name: &str) -> bool {
    db.tree_names().iter().any(|n| n.as_ref() == name.as_bytes())
}

fn create_tree(db: &Db, name: &str) -> Result<()> {
    if tree_exists(db, name) {
        return Ok(());
    }
    db.open_tree(name)?;
    db.flush()?;
    info!(queue = name, "queue created");
    Ok(())
}

fn message_ids(tree: &Tree) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    for key in tree.iter().keys() {
        if let Some(id) = codec::parse_payload_key(&key?) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Apply `batch` as a single `sled` transaction and flush it.
///
/// Runs on the writer thread only. Every queue is checked before anything is
/// written, so a missing queue leaves the store untouched.
fn apply_batch(db: &Db, batch: Batch) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    for queue in batch.keys() {
        if !tree_exists(db, queue) {
            return Err(QueueError::QueueDoesNotExist(queue.clone()));
        }
    }

    let mut trees = Vec::with_capacity(batch.len());
    let mut groups = Vec::with_capacity(batch.len());
    for (queue, ops) in &batch {
        trees.push(db.open_tree(queue)?);
        groups.push(ops.as_slice());
    }

    trees
        .as_slice()
        .transaction(|views| -> ConflictableTransactionResult<(), QueueError> {
            for (view, ops) in views.iter().zip(&groups) {
                for op in ops.iter() {
                    match op {
                        Op::Put(key, value) => {
                            view.insert(key.as_slice(), value.as_slice())?;
                        }
                        Op::Delete(key) => {
                            view.remove(key.as_slice())?;
                        }
                    }
                }
            }
            Ok(())
        })?;
    db.flush()?;

    debug!(
        queues = batch.len(),
        ops = batch.values().map(Vec::len).sum::<usize>(),
        "batch committed"
    );
    Ok(())
}

