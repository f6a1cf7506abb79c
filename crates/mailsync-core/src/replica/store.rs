//! Replica store abstraction.
//!
//! The storage engine itself lives outside this crate. Everything the core
//! reads or writes goes through [`ReplicaStore::transaction`], which commits
//! all mutations made by one body atomically or none of them.

use async_trait::async_trait;

use super::model::{Attachment, Contact, ContactEmail, Label, Message};
use crate::{Error, Result};

/// Sort order for message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageOrder {
    /// Newest first.
    #[default]
    NewestFirst,
    /// Oldest first.
    OldestFirst,
}

/// A consistent read/write view of the replica inside one transaction.
pub trait ReplicaTx {
    /// Fetch a message by local id.
    fn message(&self, local_id: &str) -> Option<Message>;
    /// Fetch a message by server id.
    fn message_by_remote_id(&self, remote_id: &str) -> Option<Message>;
    /// Fetch messages matching `predicate`, sorted by time, at most `limit`.
    fn messages(
        &self,
        predicate: &dyn Fn(&Message) -> bool,
        order: MessageOrder,
        limit: Option<usize>,
    ) -> Vec<Message>;
    /// Insert or replace a message keyed by local id.
    fn upsert_message(&mut self, message: Message) -> Message;
    /// Delete a message, clearing its label relation and attachments first.
    fn delete_message(&mut self, local_id: &str) -> Option<Message>;
    /// Delete every message and attachment.
    fn clear_messages(&mut self);

    /// Fetch a label.
    fn label(&self, id: &str) -> Option<Label>;
    /// All labels.
    fn labels(&self) -> Vec<Label>;
    /// Insert or replace a label.
    fn upsert_label(&mut self, label: Label) -> Label;
    /// Delete a label and drop it from every message.
    fn delete_label(&mut self, id: &str) -> Option<Label>;
    /// Delete every label.
    fn clear_labels(&mut self);

    /// Fetch an attachment by local id.
    fn attachment(&self, local_id: &str) -> Option<Attachment>;
    /// Attachments of a message.
    fn attachments_of(&self, message_local_id: &str) -> Vec<Attachment>;
    /// Insert or replace an attachment.
    fn upsert_attachment(&mut self, attachment: Attachment) -> Attachment;
    /// Delete an attachment.
    fn delete_attachment(&mut self, local_id: &str) -> Option<Attachment>;

    /// Fetch a contact.
    fn contact(&self, id: &str) -> Option<Contact>;
    /// Insert or replace a contact.
    fn upsert_contact(&mut self, contact: Contact) -> Contact;
    /// Delete a contact and its emails.
    fn delete_contact(&mut self, id: &str) -> Option<Contact>;
    /// Fetch a contact email.
    fn contact_email(&self, id: &str) -> Option<ContactEmail>;
    /// Insert or replace a contact email.
    fn upsert_contact_email(&mut self, email: ContactEmail) -> ContactEmail;
    /// Delete a contact email.
    fn delete_contact_email(&mut self, id: &str) -> Option<ContactEmail>;
    /// Delete every contact and contact email.
    fn clear_contacts(&mut self);
}

/// Body of a replica transaction.
pub type TxBody<'a> = Box<dyn FnOnce(&mut dyn ReplicaTx) -> Result<()> + Send + 'a>;

/// Transactional access to the local mailbox replica.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Run `body` and commit everything it mutated atomically.
    ///
    /// If `body` returns an error nothing is committed.
    async fn transaction(&self, body: TxBody<'_>) -> Result<()>;
}

/// Run `body` in a transaction and return its value.
///
/// # Errors
///
/// Returns the body's error, or a store error if the commit fails.
pub async fn transact<R, F>(store: &dyn ReplicaStore, body: F) -> Result<R>
where
    R: Send,
    F: FnOnce(&mut dyn ReplicaTx) -> Result<R> + Send,
{
    let mut output = None;
    store
        .transaction(Box::new(|tx| {
            output = Some(body(tx)?);
            Ok(())
        }))
        .await?;
    output.ok_or_else(|| Error::Store("transaction body did not run".into()))
}
