//! Local mailbox replica.
//!
//! The record types the core keeps consistent, the transactional store
//! contract, and an in-memory store implementation.

mod memory;
mod model;
mod store;

pub use memory::MemoryReplica;
pub use model::{
    Attachment, Contact, ContactEmail, EncryptionKind, Label, Message, MessageStatus, Recipient,
    ReplyAction,
};
pub use store::{MessageOrder, ReplicaStore, ReplicaTx, TxBody, transact};
