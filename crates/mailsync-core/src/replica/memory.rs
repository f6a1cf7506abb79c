//! In-memory replica store.
//!
//! Used by tests and by embedders that keep the replica in process. A
//! transaction runs its body against a copy of the state and swaps the copy in
//! only when the body succeeds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::warn;

use super::model::{Attachment, Contact, ContactEmail, Label, Message};
use super::store::{MessageOrder, ReplicaStore, ReplicaTx, TxBody};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
struct ReplicaState {
    messages: HashMap<String, Message>,
    remote_index: HashMap<String, String>,
    /// label id -> local ids of member messages
    label_members: HashMap<String, BTreeSet<String>>,
    labels: HashMap<String, Label>,
    attachments: HashMap<String, Attachment>,
    contacts: HashMap<String, Contact>,
    contact_emails: HashMap<String, ContactEmail>,
}

impl ReplicaState {
    fn unlink_message(&mut self, message: &Message) {
        for label_id in &message.label_ids {
            if let Some(members) = self.label_members.get_mut(label_id) {
                members.remove(&message.local_id);
            }
        }
        if let Some(remote_id) = &message.remote_id {
            if self.remote_index.get(remote_id) == Some(&message.local_id) {
                self.remote_index.remove(remote_id);
            }
        }
    }
}

impl ReplicaTx for ReplicaState {
    fn message(&self, local_id: &str) -> Option<Message> {
        self.messages.get(local_id).cloned()
    }

    fn message_by_remote_id(&self, remote_id: &str) -> Option<Message> {
        let local_id = self.remote_index.get(remote_id)?;
        self.messages.get(local_id).cloned()
    }

    fn messages(
        &self,
        predicate: &dyn Fn(&Message) -> bool,
        order: MessageOrder,
        limit: Option<usize>,
    ) -> Vec<Message> {
        let mut matched: Vec<Message> = self
            .messages
            .values()
            .filter(|message| predicate(message))
            .cloned()
            .collect();
        match order {
            MessageOrder::NewestFirst => matched.sort_by(|a, b| b.time.cmp(&a.time)),
            MessageOrder::OldestFirst => matched.sort_by(|a, b| a.time.cmp(&b.time)),
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        matched
    }

    fn upsert_message(&mut self, message: Message) -> Message {
        if let Some(previous) = self.messages.get(&message.local_id).cloned() {
            self.unlink_message(&previous);
        }
        for label_id in &message.label_ids {
            self.label_members
                .entry(label_id.clone())
                .or_default()
                .insert(message.local_id.clone());
        }
        if let Some(remote_id) = &message.remote_id {
            self.remote_index
                .insert(remote_id.clone(), message.local_id.clone());
        }
        self.messages
            .insert(message.local_id.clone(), message.clone());
        message
    }

    fn delete_message(&mut self, local_id: &str) -> Option<Message> {
        let message = self.messages.get(local_id).cloned()?;
        self.unlink_message(&message);
        self.attachments
            .retain(|_, attachment| attachment.message_local_id != local_id);
        self.messages.remove(local_id)
    }

    fn clear_messages(&mut self) {
        self.messages.clear();
        self.remote_index.clear();
        self.label_members.clear();
        self.attachments.clear();
    }

    fn label(&self, id: &str) -> Option<Label> {
        self.labels.get(id).cloned()
    }

    fn labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.labels.values().cloned().collect();
        labels.sort_by(|a, b| a.id.cmp(&b.id));
        labels
    }

    fn upsert_label(&mut self, label: Label) -> Label {
        self.labels.insert(label.id.clone(), label.clone());
        label
    }

    fn delete_label(&mut self, id: &str) -> Option<Label> {
        if let Some(members) = self.label_members.remove(id) {
            for local_id in members {
                if let Some(message) = self.messages.get_mut(&local_id) {
                    message.label_ids.remove(id);
                }
            }
        }
        self.labels.remove(id)
    }

    fn clear_labels(&mut self) {
        self.labels.clear();
    }

    fn attachment(&self, local_id: &str) -> Option<Attachment> {
        self.attachments.get(local_id).cloned()
    }

    fn attachments_of(&self, message_local_id: &str) -> Vec<Attachment> {
        let mut attachments: Vec<Attachment> = self
            .attachments
            .values()
            .filter(|attachment| attachment.message_local_id == message_local_id)
            .cloned()
            .collect();
        attachments.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        attachments
    }

    fn upsert_attachment(&mut self, attachment: Attachment) -> Attachment {
        self.attachments
            .insert(attachment.local_id.clone(), attachment.clone());
        attachment
    }

    fn delete_attachment(&mut self, local_id: &str) -> Option<Attachment> {
        self.attachments.remove(local_id)
    }

    fn contact(&self, id: &str) -> Option<Contact> {
        self.contacts.get(id).cloned()
    }

    fn upsert_contact(&mut self, contact: Contact) -> Contact {
        self.contacts.insert(contact.id.clone(), contact.clone());
        contact
    }

    fn delete_contact(&mut self, id: &str) -> Option<Contact> {
        self.contact_emails.retain(|_, email| email.contact_id != id);
        self.contacts.remove(id)
    }

    fn contact_email(&self, id: &str) -> Option<ContactEmail> {
        self.contact_emails.get(id).cloned()
    }

    fn upsert_contact_email(&mut self, email: ContactEmail) -> ContactEmail {
        self.contact_emails.insert(email.id.clone(), email.clone());
        email
    }

    fn delete_contact_email(&mut self, id: &str) -> Option<ContactEmail> {
        self.contact_emails.remove(id)
    }

    fn clear_contacts(&mut self) {
        self.contacts.clear();
        self.contact_emails.clear();
    }
}

/// Replica store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryReplica {
    state: Mutex<ReplicaState>,
    fail_commits: AtomicBool,
}

impl MemoryReplica {
    /// Create an empty replica.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail until reset. Lets callers exercise
    /// their handling of store failures.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Local ids of the messages carrying `label_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn label_members(&self, label_id: &str) -> Result<BTreeSet<String>> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Store("replica lock poisoned".into()))?;
        Ok(state
            .label_members
            .get(label_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplica {
    async fn transaction(&self, body: TxBody<'_>) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Store("replica lock poisoned".into()))?;

        let mut working = state.clone();
        body(&mut working)?;

        if self.fail_commits.load(Ordering::SeqCst) {
            warn!("Replica commit rejected");
            return Err(Error::Store("commit failed".into()));
        }

        *state = working;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::replica::transact;

    fn labeled(remote_id: &str, labels: &[&str]) -> Message {
        let mut message = Message::placeholder(remote_id);
        message.label_ids = labels.iter().map(|l| (*l).to_string()).collect();
        message
    }

    #[tokio::test]
    async fn test_delete_clears_label_relation() {
        let replica = MemoryReplica::new();
        let message = labeled("r-1", &["0", "5"]);
        let local_id = message.local_id.clone();

        transact(&replica, |tx| {
            tx.upsert_message(message);
            Ok(())
        })
        .await
        .unwrap();
        assert!(replica.label_members("0").unwrap().contains(&local_id));

        let deleted = transact(&replica, |tx| Ok(tx.delete_message(&local_id)))
            .await
            .unwrap();
        assert!(deleted.is_some());
        assert!(replica.label_members("0").unwrap().is_empty());
        assert!(replica.label_members("5").unwrap().is_empty());

        let by_remote = transact(&replica, |tx| Ok(tx.message_by_remote_id("r-1")))
            .await
            .unwrap();
        assert!(by_remote.is_none());
    }

    #[tokio::test]
    async fn test_failed_body_commits_nothing() {
        let replica = MemoryReplica::new();
        let result: Result<()> = transact(&replica, |tx| {
            tx.upsert_message(labeled("r-1", &["0"]));
            Err(Error::Store("boom".into()))
        })
        .await;
        assert!(result.is_err());

        let count = transact(&replica, |tx| {
            Ok(tx
                .messages(&|_: &Message| true, MessageOrder::NewestFirst, None)
                .len())
        })
        .await
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_rejected_commit_rolls_back() {
        let replica = MemoryReplica::new();
        replica.set_fail_commits(true);
        let result = transact(&replica, |tx| {
            tx.upsert_label(Label::new("l1", "Work", false));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Store(_))));

        replica.set_fail_commits(false);
        let label = transact(&replica, |tx| Ok(tx.label("l1"))).await.unwrap();
        assert!(label.is_none());
    }

    #[tokio::test]
    async fn test_relabel_moves_membership() {
        let replica = MemoryReplica::new();
        let mut message = labeled("r-1", &["0"]);
        let local_id = message.local_id.clone();
        transact(&replica, |tx| {
            tx.upsert_message(message.clone());
            Ok(())
        })
        .await
        .unwrap();

        message.label_ids = ["6".to_string()].into_iter().collect();
        transact(&replica, |tx| {
            tx.upsert_message(message);
            Ok(())
        })
        .await
        .unwrap();

        assert!(replica.label_members("0").unwrap().is_empty());
        assert!(replica.label_members("6").unwrap().contains(&local_id));
    }
}
