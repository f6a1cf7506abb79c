//! Durable outbound action queues.
//!
//! The mutation queue (outbox) holds every local intent that still has to be
//! reflected on the server, in enqueue order. The failed queue parks actions
//! whose last attempt hit a retryable server failure.

mod model;
mod repository;

pub use model::{Action, ActionId, ActionKind, ActionTarget, FailedAction, UnreadableAction};
pub use repository::{FailedQueue, MutationQueue};
