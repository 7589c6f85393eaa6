//! Retry scheduler
//!
//! Tracks how often each outgoing message has failed and decides whether it
//! gets another attempt:
//! - a message is retried while `attempts < max_attempts` (100 unless the
//!   message or the node says otherwise) and its `deliver_by` deadline, if
//!   any, has not passed
//! - the n-th retry waits `n²` seconds; every pending retry owns a one-shot
//!   tokio timer and the timer firing is the only thing that re-emits it
//! - an ineligible message is abandoned: its outgoing record is deleted, a
//!   [`DeliveryAbandoned`] event is published and its attempt count is dropped
//! - a message whose outgoing record is gone (delivered, abandoned or cleared)
//!   is discarded, never re-emitted; the timer checks again before it fires
//!
//! One message's storage error never stops the rest of its batch.
//!
//! Attempt counts live in memory only and start from zero after a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::OutgoingMessage;
use crate::delivery::events::{
    AbandonReason, DeliveryAbandoned, OutboundSender, OutgoingFailure, RetryOutcome,
};
use crate::persistence::Store;
use crate::utils::Result;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Default)]
struct RetryEntry {
    attempts: u32,
    timer: Option<PendingTimer>,
}

#[derive(Debug)]
struct PendingTimer {
    token: u64,
    handle: AbortHandle,
}

type RetryState = Arc<Mutex<HashMap<Uuid, RetryEntry>>>;

pub struct RetryScheduler {
    store: Store,
    outbound: OutboundSender,
    abandoned: mpsc::UnboundedSender<DeliveryAbandoned>,
    default_max_attempts: u32,
    state: RetryState,
    next_token: AtomicU64,
    clock: Clock,
}

impl RetryScheduler {
    /// Attempt limit for messages that do not carry their own.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

    pub fn new(
        store: Store,
        outbound: OutboundSender,
        abandoned: mpsc::UnboundedSender<DeliveryAbandoned>,
    ) -> Self {
        Self {
            store,
            outbound,
            abandoned,
            default_max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            state: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Replace the wall clock used for `deliver_by` checks.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Delay before the retry that follows failure number `attempt`.
    pub fn backoff(attempt: u32) -> Duration {
        let secs = u64::from(attempt);
        Duration::from_secs(secs.saturating_mul(secs))
    }

    /// Whether a message that has failed `attempts` times may be tried again.
    pub fn should_retry(&self, message: &OutgoingMessage, attempts: u32) -> bool {
        self.ineligibility(message, attempts).is_none()
    }

    fn ineligibility(&self, message: &OutgoingMessage, attempts: u32) -> Option<AbandonReason> {
        let max_attempts = message.max_attempts.unwrap_or(self.default_max_attempts);
        if attempts >= max_attempts {
            return Some(AbandonReason::AttemptsExhausted { max_attempts });
        }
        match message.deliver_by {
            Some(deliver_by) if (self.clock)() >= deliver_by => {
                Some(AbandonReason::DeadlineExpired { deliver_by })
            }
            _ => None,
        }
    }

    /// Record one failure for every message in `failure` and schedule,
    /// abandon or discard each of them.
    ///
    /// Every message gets an outcome; a message whose bookkeeping hit a
    /// storage error is reported as [`RetryOutcome::Failed`].
    pub async fn handle_failure(&self, failure: OutgoingFailure) -> Vec<RetryOutcome> {
        debug!(
            messages = failure.messages.len(),
            error = %failure.error,
            "delivery failed"
        );
        let mut outcomes = Vec::with_capacity(failure.messages.len());
        for message in failure.messages {
            let id = message.id();
            let outcome = match self.fail_one(message).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%id, error = %e, "failed to process delivery failure");
                    RetryOutcome::Failed {
                        id,
                        attempt: self.attempts(id),
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn fail_one(&self, message: OutgoingMessage) -> Result<RetryOutcome> {
        let id = message.id();
        if self.store.outgoing_message(id)?.is_none() {
            self.forget(id);
            debug!(%id, "outgoing record gone, failure discarded");
            return Ok(RetryOutcome::Discarded { id });
        }

        let attempt = {
            let mut state = self.lock_state();
            let entry = state.entry(id).or_default();
            entry.attempts += 1;
            // Only one retry may be pending per message.
            if let Some(timer) = entry.timer.take() {
                timer.handle.abort();
            }
            entry.attempts
        };

        if let Some(reason) = self.ineligibility(&message, attempt) {
            self.abandon(message, attempt, reason).await?;
            return Ok(RetryOutcome::Abandoned {
                id,
                attempt,
                reason,
            });
        }

        let delay = Self::backoff(attempt);
        self.schedule(message, delay);
        debug!(%id, attempt, delay_secs = delay.as_secs(), "retry scheduled");
        Ok(RetryOutcome::Scheduled { id, attempt, delay })
    }

    fn schedule(&self, message: OutgoingMessage, delay: Duration) {
        let id = message.id();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let state = self.state.clone();
        let outbound = self.outbound.clone();
        let store = self.store.downgrade();

        // Hold the lock across the spawn so the timer cannot look for its
        // entry before the handle has been stored.
        let mut guard = self.lock_state();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = state.get_mut(&id) else {
                return;
            };
            if entry.timer.as_ref().map(|t| t.token) != Some(token) {
                return;
            }
            entry.timer = None;
            let Some(store) = store.upgrade() else {
                debug!(%id, "store closed, retry dropped");
                return;
            };
            match store.outgoing_message(id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    state.remove(&id);
                    debug!(%id, "outgoing record gone, retry dropped");
                    return;
                }
                // Re-emit anyway; delivery is at-least-once.
                Err(e) => warn!(%id, error = %e, "could not check outgoing record"),
            }
            drop(store);
            if outbound.send(message).is_err() {
                warn!(%id, "outbound channel closed, retry dropped");
            }
        })
        .abort_handle();

        guard.entry(id).or_default().timer = Some(PendingTimer { token, handle });
    }

    async fn abandon(
        &self,
        message: OutgoingMessage,
        attempts: u32,
        reason: AbandonReason,
    ) -> Result<()> {
        let id = message.id();
        self.store
            .execute(move |tx| {
                tx.delete_outgoing(id);
                Ok(())
            })
            .await?;
        self.forget(id);

        match reason {
            AbandonReason::AttemptsExhausted { max_attempts } => {
                warn!(%id, attempts, max_attempts, "delivery abandoned, attempts exhausted");
            }
            AbandonReason::DeadlineExpired { deliver_by } => {
                warn!(%id, attempts, %deliver_by, "delivery abandoned, deadline passed");
            }
        }

        let event = DeliveryAbandoned {
            message,
            attempts,
            reason,
        };
        if self.abandoned.send(event).is_err() {
            debug!(%id, "no listener for abandoned deliveries");
        }
        Ok(())
    }

    /// Forget a message that was delivered.
    pub fn mark_delivered(&self, id: Uuid) {
        self.forget(id);
    }

    fn forget(&self, id: Uuid) {
        if let Some(entry) = self.lock_state().remove(&id) {
            if let Some(timer) = entry.timer {
                timer.handle.abort();
            }
        }
    }

    /// Cancel the pending retry of `id`. Returns whether one was pending.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock_state().remove(&id) {
            Some(RetryEntry {
                timer: Some(timer), ..
            }) => {
                timer.handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Cancel every pending retry and reset all attempt counts.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for (_, entry) in self.lock_state().drain() {
            if let Some(timer) = entry.timer {
                timer.handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "pending retries cancelled");
        }
        cancelled
    }

    /// Failures recorded for `id` so far.
    pub fn attempts(&self, id: Uuid) -> u32 {
        self.lock_state().get(&id).map_or(0, |entry| entry.attempts)
    }

    /// Messages with recorded failures, pending retry or not.
    pub fn tracked(&self) -> usize {
        self.lock_state().len()
    }

    pub fn pending_retries(&self) -> usize {
        self.lock_state()
            .values()
            .filter(|entry| entry.timer.is_some())
            .count()
    }

    /// Consume failure reports until every sender is gone.
    pub async fn run(self: Arc<Self>, mut failures: mpsc::UnboundedReceiver<OutgoingFailure>) {
        info!("retry scheduler started");
        while let Some(failure) = failures.recv().await {
            self.handle_failure(failure).await;
        }
        info!("retry scheduler stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<Uuid, RetryEntry>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for entry in self.lock_state().values() {
            if let Some(timer) = &entry.timer {
                timer.handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("default_max_attempts", &self.default_max_attempts)
            .field("pending_retries", &self.pending_retries())
            .finish()
    }
}
