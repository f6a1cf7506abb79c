//! # mailsync-core
//!
//! Offline-first synchronization core for an encrypted mail client.
//!
//! This crate provides:
//! - A durable mutation queue (outbox) and a failed-action queue (`SQLite`)
//! - A single-flight drain loop with an outcome classifier
//! - An event-sourced reconciliation engine with unread counters
//! - A staged send pipeline building encrypted per-recipient packages
//! - Optimistic local mutations through [`Mailbox`]
//!
//! Storage of the mailbox replica, the network transport, cryptography and
//! credentials are supplied by the application through traits.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod counter;
pub mod crypto;
pub mod drain;
mod error;
pub mod identity;
pub mod queue;
pub mod reconcile;
pub mod replica;
pub mod send;
pub mod service;
pub mod sinks;
pub mod transport;

pub use config::{ErrorCodes, LabelIds, RecipientTypes, RefreshFlags, SyncConfig};
pub use counter::{CounterStore, LabelCounter, SyncWindow};
pub use crypto::{CryptoError, CryptoProvider, Passphrase, SenderKeys, SessionKey};
pub use drain::{ActionError, ActionExecutor, DrainLoop, DrainReport, Reachability, Verdict};
pub use error::{Error, Result};
pub use identity::{ContactDirectory, CredentialSource, PinnedContact};
pub use queue::{Action, ActionId, ActionKind, ActionTarget, FailedAction, FailedQueue, MutationQueue};
pub use reconcile::{PollOutcome, PurgeReport, ReconciliationEngine};
pub use replica::{MemoryReplica, ReplicaStore, ReplicaTx};
pub use send::{SendError, SendFailure, SendPipeline, SendRequest, Stage};
pub use service::{Collaborators, MailSync, Mailbox};
pub use transport::{ApiRequest, ApiResponse, ConnectivityKind, Transport, TransportError};
