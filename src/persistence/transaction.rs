use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::broker::message::{Message, OutgoingMessage};
use crate::persistence::codec;
use crate::persistence::sled_store::{OUTGOING_TREE, Store};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Buffered mutations, grouped by queue so every queue of a batch can be
/// checked before any of it is written.
pub(crate) type Batch = BTreeMap<String, Vec<Op>>;

/// A write transaction against a [`Store`].
///
/// Puts and deletes are buffered in memory and reach the disk only through
/// [`Transaction::commit`], which hands the whole batch to the store's writer.
/// Nothing survives a transaction that is rolled back, dropped, or lost to a
/// crash before commit.
pub struct Transaction {
    store: Store,
    ops: Batch,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(store: Store) -> Self {
        Self {
            store,
            ops: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn put(&mut self, queue: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.push(queue, Op::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, queue: &str, key: impl Into<Vec<u8>>) {
        self.push(queue, Op::Delete(key.into()));
    }

    fn push(&mut self, queue: &str, op: Op) {
        self.ops.entry(queue.to_string()).or_default().push(op);
    }

    /// Value of `key` as this transaction would leave it.
    ///
    /// Buffered writes win over committed state. Reading a queue that does not
    /// exist fails with `QueueDoesNotExist`, unless this transaction has
    /// already written that key.
    pub fn get(&self, queue: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(ops) = self.ops.get(queue) {
            for op in ops.iter().rev() {
                match op {
                    Op::Put(k, v) if k.as_slice() == key => return Ok(Some(v.clone())),
                    Op::Delete(k) if k.as_slice() == key => return Ok(None),
                    _ => {}
                }
            }
        }
        self.store.get(queue, key)
    }

    /// Buffer the records of messages received into their queues.
    pub fn store_incoming(&mut self, messages: &[Message]) -> Result<()> {
        for message in messages {
            for (key, value) in codec::encode_message(message)? {
                self.push(&message.queue, Op::Put(key, value));
            }
        }
        Ok(())
    }

    /// Buffer the records of messages waiting to be sent.
    pub fn store_outgoing(&mut self, messages: &[OutgoingMessage]) -> Result<()> {
        for outgoing in messages {
            for (key, value) in codec::encode_outgoing(outgoing)? {
                self.push(OUTGOING_TREE, Op::Put(key, value));
            }
        }
        Ok(())
    }

    /// Buffer removal of every entry of message `id` in `queue`.
    pub fn delete_message(&mut self, queue: &str, id: Uuid) {
        for key in codec::all_keys(&id) {
            self.push(queue, Op::Delete(key));
        }
    }

    pub fn delete_outgoing(&mut self, id: Uuid) {
        self.delete_message(OUTGOING_TREE, id);
    }

    /// Buffer moving message `id` of `queue` into `sub_queue`.
    pub fn move_to_sub_queue(&mut self, queue: &str, id: Uuid, sub_queue: &str) {
        self.push(
            queue,
            Op::Put(codec::entry_key(&id, codec::SUB_QUEUE), sub_queue.into()),
        );
    }

    /// Buffer removal of every committed entry of `queue`.
    pub fn clear_queue(&mut self, queue: &str) -> Result<()> {
        for key in self.store.keys(queue)? {
            self.push(queue, Op::Delete(key));
        }
        Ok(())
    }

    /// Message `id` of `queue` as this transaction would leave it.
    pub fn message(&self, queue: &str, id: Uuid) -> Result<Option<Message>> {
        codec::decode_message(queue, id, |key| self.get(queue, key))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(Vec::is_empty)
    }

    /// Apply every buffered mutation atomically.
    ///
    /// Fails with `QueueDoesNotExist` if any referenced queue is missing; in
    /// that case, as with any other failure, nothing is written.
    pub async fn commit(self) -> Result<()> {
        let store = self.store.clone();
        store.apply(self.take_batch()).await
    }

    /// Blocking variant of [`Transaction::commit`].
    pub fn commit_blocking(self) -> Result<()> {
        let store = self.store.clone();
        store.apply_blocking(self.take_batch())
    }

    /// Discard every buffered mutation.
    pub fn rollback(mut self) {
        self.finished = true;
        self.ops.clear();
    }

    /// Append mutations buffered elsewhere, after this transaction's own.
    pub(crate) fn extend(&mut self, batch: Batch) {
        for (queue, ops) in batch {
            self.ops.entry(queue).or_default().extend(ops);
        }
    }

    pub(crate) fn take_batch(mut self) -> Batch {
        self.finished = true;
        std::mem::take(&mut self.ops)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.is_empty() {
            warn!("transaction dropped without commit, discarding buffered writes");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("queues", &self.ops.keys().collect::<Vec<_>>())
            .field("finished", &self.finished)
            .finish()
    }
}
