use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::message::OutgoingMessage;

/// Messages ready to be handed to the network sender.
pub type OutboundSender = mpsc::UnboundedSender<OutgoingMessage>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutgoingMessage>;

/// Reported by the network sender when delivery failed.
///
/// `messages` holds exactly the messages that failed, which may be any subset
/// of the batch that was attempted.
#[derive(Debug, Clone)]
pub struct OutgoingFailure {
    pub messages: Vec<OutgoingMessage>,
    pub error: String,
}

impl OutgoingFailure {
    pub fn new(messages: Vec<OutgoingMessage>, error: impl Into<String>) -> Self {
        Self {
            messages,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    AttemptsExhausted { max_attempts: u32 },
    DeadlineExpired { deliver_by: DateTime<Utc> },
}

/// Terminal outcome: the message will never be attempted again and its
/// outgoing record has been removed.
#[derive(Debug, Clone)]
pub struct DeliveryAbandoned {
    pub message: OutgoingMessage,
    pub attempts: u32,
    pub reason: AbandonReason,
}

/// What the scheduler decided for one failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled {
        id: Uuid,
        attempt: u32,
        delay: std::time::Duration,
    },
    Abandoned {
        id: Uuid,
        attempt: u32,
        reason: AbandonReason,
    },
    /// The outgoing record no longer exists; nothing was scheduled.
    Discarded { id: Uuid },
    /// Storage failed while handling this message. Other messages of the
    /// same report are unaffected.
    Failed {
        id: Uuid,
        attempt: u32,
        error: String,
    },
}
