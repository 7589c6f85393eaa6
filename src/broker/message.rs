use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Sub-queue that received messages are moved into.
pub const PROCESSED_SUB_QUEUE: &str = "processed";

/// The unit of transfer between producers, queues and nodes.
///
/// `id` is a v7 UUID, so ids sort in creation order within a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub queue: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub sent_at: DateTime<Utc>,
    pub sub_queue: Option<String>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            sent_at: Utc::now(),
            sub_queue: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// True while the message has not been moved into a sub-queue.
    pub fn is_pending(&self) -> bool {
        self.sub_queue.is_none()
    }
}

/// Where an outgoing message should be delivered: a queue on a remote node.
///
/// Choosing the endpoint is the caller's business; the store only keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub endpoint: String,
    pub queue: String,
}

impl Destination {
    pub fn new(endpoint: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            queue: queue.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.queue)
    }
}

/// A message waiting to be handed to the network sender, with its
/// delivery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message: Message,
    pub destination: Destination,
    /// Falls back to the node's configured default when unset.
    pub max_attempts: Option<u32>,
    /// No retry is attempted at or after this instant.
    pub deliver_by: Option<DateTime<Utc>>,
}

impl OutgoingMessage {
    pub fn new(destination: Destination, payload: impl Into<Vec<u8>>) -> Self {
        let message = Message::new(destination.queue.clone(), payload);
        Self {
            message,
            destination,
            max_attempts: None,
            deliver_by: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_deliver_by(mut self, deliver_by: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deliver_by);
        self
    }

    pub fn id(&self) -> Uuid {
        self.message.id
    }
}
