use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::{Message, OutgoingMessage, PROCESSED_SUB_QUEUE};
use crate::broker::scope::TransactionalScope;
use crate::config::{Settings, load_config};
use crate::delivery::{
    DeliveryAbandoned, OutboundReceiver, OutboundSender, OutgoingFailure, RetryScheduler,
};
use crate::persistence::{OUTGOING_TREE, Store};
use crate::utils::{Result, logging};

/// The queue manager of one node.
///
/// It owns the store, hands out [`TransactionalScope`]s, and wires the
/// outbound, failure and abandoned channels between the store, the network
/// side and the [`RetryScheduler`]. The retry scheduler runs as a tokio task
/// for as long as the manager is open.
pub struct QueueManager {
    store: Store,
    settings: Settings,
    outbound: OutboundSender,
    failures: mpsc::UnboundedSender<OutgoingFailure>,
    abandoned: Mutex<Option<mpsc::UnboundedReceiver<DeliveryAbandoned>>>,
    retry: Arc<RetryScheduler>,
    retry_task: JoinHandle<()>,
}

impl QueueManager {
    /// Open the node's store and start the retry scheduler.
    ///
    /// Must be called from within a tokio runtime. The returned receiver is
    /// the outbound channel the network sender consumes.
    pub fn open(settings: Settings) -> Result<(Self, OutboundReceiver)> {
        let store = Store::open_with(&settings.store)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (abandoned_tx, abandoned_rx) = mpsc::unbounded_channel();

        let retry = Arc::new(
            RetryScheduler::new(store.clone(), outbound.clone(), abandoned_tx)
                .with_default_max_attempts(settings.retry.default_max_attempts),
        );
        let retry_task = tokio::spawn(retry.clone().run(failures_rx));

        info!(
            path = %settings.store.path,
            max_attempts = settings.retry.default_max_attempts,
            "queue manager opened"
        );
        let manager = Self {
            store,
            settings,
            outbound,
            failures,
            abandoned: Mutex::new(Some(abandoned_rx)),
            retry,
            retry_task,
        };
        Ok((manager, outbound_rx))
    }

    /// Load settings from `config/default` and the environment, install the
    /// log subscriber at the configured level, then [`QueueManager::open`].
    pub fn from_config() -> Result<(Self, OutboundReceiver)> {
        let settings = load_config()?;
        logging::init(&settings.logging.level);
        Self::open(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn retry_scheduler(&self) -> &RetryScheduler {
        &self.retry
    }

    pub async fn create_queue(&self, name: &str) -> Result<()> {
        self.store.create_queue(name).await
    }

    pub fn begin_scope(&self) -> TransactionalScope {
        TransactionalScope::new(self.store.clone(), self.outbound.clone())
    }

    /// Persist messages that arrived from another node, all or nothing.
    pub async fn enqueue_incoming(&self, messages: Vec<Message>) -> Result<()> {
        let count = messages.len();
        self.store
            .execute(move |tx| tx.store_incoming(&messages))
            .await?;
        debug!(count, "incoming messages stored");
        Ok(())
    }

    /// Messages of `queue` in `sub_queue`; `None` lists pending messages.
    pub fn all_messages(&self, queue: &str, sub_queue: Option<&str>) -> Result<Vec<Message>> {
        self.store.messages(queue, sub_queue)
    }

    pub fn processed_messages(&self, queue: &str) -> Result<Vec<Message>> {
        self.store.messages(queue, Some(PROCESSED_SUB_QUEUE))
    }

    /// Outgoing messages not yet confirmed delivered or abandoned.
    pub fn messages_currently_sending(&self) -> Result<Vec<OutgoingMessage>> {
        self.store.outgoing_messages()
    }

    /// Called by the network sender once `ids` have been delivered.
    pub async fn successfully_sent(&self, ids: Vec<Uuid>) -> Result<()> {
        for id in &ids {
            self.retry.mark_delivered(*id);
        }
        let count = ids.len();
        self.store
            .execute(move |tx| {
                for id in ids {
                    tx.delete_outgoing(id);
                }
                Ok(())
            })
            .await?;
        debug!(count, "outgoing messages delivered");
        Ok(())
    }

    /// Channel on which the network sender reports failed deliveries.
    pub fn failure_sender(&self) -> mpsc::UnboundedSender<OutgoingFailure> {
        self.failures.clone()
    }

    /// Receiver of abandoned deliveries. Only the first call gets it.
    pub fn abandoned(&self) -> Option<mpsc::UnboundedReceiver<DeliveryAbandoned>> {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Delete every message of every queue, outgoing ones included, and
    /// cancel all pending retries. Queues themselves are kept.
    pub async fn clear_all_messages(&self) -> Result<()> {
        let cancelled = self.retry.cancel_all();
        let mut queues = self.store.queue_names();
        queues.push(OUTGOING_TREE.to_string());
        self.store
            .execute(move |tx| {
                for queue in &queues {
                    tx.clear_queue(queue)?;
                }
                Ok(())
            })
            .await?;
        info!(cancelled, "all messages cleared");
        Ok(())
    }

    /// Delete processed messages of `queue` older than the configured
    /// retention. Returns how many were removed.
    pub async fn purge_processed(&self, queue: &str) -> Result<usize> {
        let cutoff = self
            .settings
            .retention
            .processed_ttl_secs
            .and_then(|ttl| i64::try_from(ttl).ok())
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        // No retention configured, or one longer than representable time.
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let store = self.store.clone();
        let queue_name = queue.to_string();
        let purged = self
            .store
            .execute(move |tx| {
                let expired: Vec<Uuid> = store
                    .messages(&queue_name, Some(PROCESSED_SUB_QUEUE))?
                    .into_iter()
                    .filter(|message| message.sent_at < cutoff)
                    .map(|message| message.id)
                    .collect();
                for id in &expired {
                    tx.delete_message(&queue_name, *id);
                }
                Ok(expired.len())
            })
            .await?;
        if purged > 0 {
            info!(queue, purged, "processed messages purged");
        }
        Ok(purged)
    }

    /// Hand every persisted outgoing message to the outbound channel again,
    /// e.g. after a restart. Returns how many were re-emitted.
    pub fn requeue_outgoing(&self) -> Result<usize> {
        let pending = self.store.outgoing_messages()?;
        let mut count = 0;
        for message in pending {
            let id = message.id();
            if self.outbound.send(message).is_err() {
                warn!(%id, "outbound channel closed, requeue stopped");
                break;
            }
            count += 1;
        }
        info!(count, "outgoing messages requeued");
        Ok(count)
    }

    /// Stop the retry scheduler, cancel its timers and close the store.
    pub async fn shutdown(self) -> Result<()> {
        self.retry.cancel_all();
        self.retry_task.abort();
        let _ = self.retry_task.await;
        self.store.close()?;
        info!("queue manager shut down");
        Ok(())
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .finish()
    }
}
