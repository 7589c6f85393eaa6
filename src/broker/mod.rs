//! The `broker` module is the application-facing side of a node.
//!
//! [`QueueManager`] owns the store and the retry scheduler; applications do
//! their work inside a [`TransactionalScope`] obtained from it.

pub mod engine;
pub mod message;
pub mod scope;

pub use engine::QueueManager;
pub use message::{Destination, Message, OutgoingMessage, PROCESSED_SUB_QUEUE};
pub use scope::{ScopeState, TransactionalScope};
