//! # relayq
//!
//! `relayq` is a durable, transactional store-and-forward message queue for a
//! single node. Messages received from other nodes and messages waiting to be
//! sent are persisted in `sled`; failed deliveries are retried with a
//! quadratic backoff until they succeed, run out of attempts, or pass their
//! deadline.
//!
//! ## Core Modules
//!
//! - `broker`: the queue manager and the transactional scopes applications
//!   work in.
//! - `config`: loads node settings from a file and the environment.
//! - `delivery`: the retry scheduler and the channels shared with the network
//!   sender.
//! - `persistence`: the `sled` store, its record codec and the single writer
//!   thread every commit goes through.
//! - `utils`: the shared error type and logging setup.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod persistence;
pub mod utils;

pub use broker::{Destination, Message, OutgoingMessage, QueueManager, TransactionalScope};
pub use config::{Settings, load_config};
pub use delivery::{DeliveryAbandoned, OutgoingFailure, RetryScheduler};
pub use persistence::{Store, Transaction};
pub use utils::{QueueError, Result};
