use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::{Destination, Message, OutgoingMessage, PROCESSED_SUB_QUEUE};
use crate::delivery::OutboundSender;
use crate::persistence::{Store, Transaction};
use crate::utils::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committed,
    RolledBack,
}

/// A unit of application work: messages sent and received inside a scope
/// take effect together on [`TransactionalScope::commit`], or not at all.
///
/// A received message is handed out optimistically. It only counts as
/// consumed once the scope commits; until then another scope may take it,
/// in which case this scope's commit fails with `MessageUnavailable`.
pub struct TransactionalScope {
    store: Store,
    outbound: OutboundSender,
    tx: Option<Transaction>,
    outgoing: Vec<OutgoingMessage>,
    received: Vec<(String, Uuid)>,
    state: ScopeState,
}

impl TransactionalScope {
    pub(crate) fn new(store: Store, outbound: OutboundSender) -> Self {
        let tx = store.begin_transaction();
        Self {
            store,
            outbound,
            tx: Some(tx),
            outgoing: Vec::new(),
            received: Vec::new(),
            state: ScopeState::Active,
        }
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Buffer a message for `destination`. Returns its id.
    pub fn send(
        &mut self,
        destination: Destination,
        payload: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> Result<Uuid> {
        let mut outgoing = OutgoingMessage::new(destination, payload);
        outgoing.message.headers = headers;
        self.send_message(outgoing)
    }

    /// Buffer a prepared outgoing message, keeping its delivery policy.
    pub fn send_message(&mut self, outgoing: OutgoingMessage) -> Result<Uuid> {
        let tx = self.active_tx("send after scope completed")?;
        tx.store_outgoing(std::slice::from_ref(&outgoing))?;
        let id = outgoing.id();
        self.outgoing.push(outgoing);
        Ok(id)
    }

    /// Take the oldest pending message of `queue`.
    ///
    /// The message is moved to the `processed` sub-queue when the scope
    /// commits. Returns `Ok(None)` when nothing is pending.
    pub fn receive(&mut self, queue: &str) -> Result<Option<Message>> {
        self.active_tx("receive after scope completed")?;
        let taken: HashSet<Uuid> = self
            .received
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, id)| *id)
            .collect();

        let next = self
            .store
            .messages(queue, None)?
            .into_iter()
            .find(|message| !taken.contains(&message.id));
        let Some(message) = next else {
            return Ok(None);
        };

        let tx = self.active_tx("receive after scope completed")?;
        tx.move_to_sub_queue(queue, message.id, PROCESSED_SUB_QUEUE);
        self.received.push((queue.to_string(), message.id));
        debug!(queue, id = %message.id, "message received");
        Ok(Some(message))
    }

    /// Apply everything this scope buffered as one unit of work.
    ///
    /// On success the sent messages are handed to the outbound channel. On
    /// failure nothing was written and the scope counts as rolled back.
    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.finish("commit after scope completed")?;
        let received = std::mem::take(&mut self.received);
        let outgoing = std::mem::take(&mut self.outgoing);
        self.state = ScopeState::RolledBack;

        let batch = tx.take_batch();
        self.store
            .execute(move |work| {
                for (queue, id) in &received {
                    match work.message(queue, *id)? {
                        Some(message) if message.is_pending() => {}
                        _ => return Err(QueueError::MessageUnavailable(*id)),
                    }
                }
                work.extend(batch);
                Ok(())
            })
            .await?;
        self.state = ScopeState::Committed;

        for message in outgoing {
            let id = message.id();
            if self.outbound.send(message).is_err() {
                warn!(%id, "outbound channel closed, message stays persisted");
            }
        }
        Ok(())
    }

    /// Discard everything this scope buffered.
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.finish("rollback after scope completed")?;
        tx.rollback();
        self.received.clear();
        self.outgoing.clear();
        self.state = ScopeState::RolledBack;
        Ok(())
    }

    fn active_tx(&mut self, context: &'static str) -> Result<&mut Transaction> {
        match (self.state, self.tx.as_mut()) {
            (ScopeState::Active, Some(tx)) => Ok(tx),
            _ => Err(QueueError::InvalidScopeState(context)),
        }
    }

    fn finish(&mut self, context: &'static str) -> Result<Transaction> {
        if self.state != ScopeState::Active {
            return Err(QueueError::InvalidScopeState(context));
        }
        self.tx.take().ok_or(QueueError::InvalidScopeState(context))
    }
}

impl std::fmt::Debug for TransactionalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalScope")
            .field("state", &self.state)
            .field("sent", &self.outgoing.len())
            .field("received", &self.received.len())
            .finish()
    }
}
