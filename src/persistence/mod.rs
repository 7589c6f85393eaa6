//! The `persistence` module is the durable half of the queue.
//!
//! Messages are stored in `sled`, one tree per queue, and every mutation goes
//! through a single writer thread so that each batch commits atomically and in
//! submission order.

pub mod codec;
pub mod sled_store;
pub mod transaction;
mod writer;

pub use sled_store::{OUTGOING_TREE, Store};
pub use transaction::Transaction;

#[cfg(test)]
mod tests;
