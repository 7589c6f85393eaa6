//! The `delivery` module decides what happens to outgoing messages the
//! network sender could not deliver.
//!
//! The sender reports an [`OutgoingFailure`]; the [`RetryScheduler`] either
//! re-emits each failed message into the outbound channel after a quadratic
//! backoff or abandons it for good.

pub mod events;
pub mod retry;

pub use events::{
    AbandonReason, DeliveryAbandoned, OutboundReceiver, OutboundSender, OutgoingFailure,
    RetryOutcome,
};
pub use retry::RetryScheduler;
