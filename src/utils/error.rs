//! The `error` module defines the error type shared by every layer of `relayq`.
//!
//! Storage, codec and scope failures all surface as a [`QueueError`]. A failed
//! unit of work is always rolled back before its error reaches the caller, so
//! receiving any of these means "nothing happened" for that unit.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A transaction referenced a queue that was never created.
    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Corrupt or malformed record bytes.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid scope state: {0}")]
    InvalidScopeState(&'static str),

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// A message received by a scope was taken by another scope first.
    #[error("message {0} is no longer available")]
    MessageUnavailable(Uuid),

    #[error("unit of work panicked")]
    WorkPanicked,

    #[error("writer thread is not running")]
    WriterClosed,

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl From<sled::Error> for QueueError {
    fn from(err: sled::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<QueueError>> for QueueError {
    fn from(err: sled::transaction::TransactionError<QueueError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
