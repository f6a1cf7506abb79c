//! Local mutation entry points.
//!
//! Every operation applies its optimistic change to the replica in one
//! transaction, adjusts the unread counters, then enqueues the action that
//! reflects the change server-side.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::counter::CounterStore;
use crate::queue::{Action, ActionKind, ActionTarget, MutationQueue};
use crate::replica::{Attachment, Message, MessageOrder, ReplicaStore, transact};
use crate::{Error, Result};

/// Unread counter changes produced by one replica transaction.
type CounterDeltas = Vec<(String, i64)>;

/// Optimistic local mutations backed by the mutation queue.
pub struct Mailbox {
    replica: Arc<dyn ReplicaStore>,
    queue: Arc<MutationQueue>,
    counters: Arc<CounterStore>,
    config: Arc<SyncConfig>,
}

impl Mailbox {
    /// Creates a mailbox over the shared replica, queue and counters.
    #[must_use]
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        queue: Arc<MutationQueue>,
        counters: Arc<CounterStore>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            replica,
            queue,
            counters,
            config,
        }
    }

    /// Mark a message read.
    ///
    /// Returns true if the message was unread. The action is queued either
    /// way so the server converges on the local state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn mark_read(&self, local_id: &str) -> Result<bool> {
        self.set_unread(local_id, false).await
    }

    /// Mark a message unread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn mark_unread(&self, local_id: &str) -> Result<bool> {
        self.set_unread(local_id, true).await
    }

    async fn set_unread(&self, local_id: &str, unread: bool) -> Result<bool> {
        let id = local_id.to_string();
        let deltas = transact(self.replica.as_ref(), move |tx| {
            let mut message = tx.message(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            if message.unread == unread {
                return Ok(None);
            }
            message.unread = unread;
            let delta = if unread { 1 } else { -1 };
            let deltas: CounterDeltas = message.label_ids.iter().map(|label| (label.clone(), delta)).collect();
            tx.upsert_message(message);
            Ok(Some(deltas))
        })
        .await?;

        let changed = deltas.is_some();
        self.apply_deltas(deltas.unwrap_or_default()).await?;

        let kind = if unread { ActionKind::Unread } else { ActionKind::Read };
        self.queue
            .enqueue(&Action::new(kind, ActionTarget::Local(local_id.to_string())))
            .await?;
        Ok(changed)
    }

    /// Apply `label_id` to a message.
    ///
    /// Returns true if the label was not already present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn apply_label(&self, local_id: &str, label_id: &str) -> Result<bool> {
        self.change_label(local_id, label_id, true).await
    }

    /// Remove `label_id` from a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn remove_label(&self, local_id: &str, label_id: &str) -> Result<bool> {
        self.change_label(local_id, label_id, false).await
    }

    async fn change_label(&self, local_id: &str, label_id: &str, apply: bool) -> Result<bool> {
        let id = local_id.to_string();
        let label = label_id.to_string();
        let (changed, remote_id, deltas) = transact(self.replica.as_ref(), move |tx| {
            let mut message = tx.message(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            let changed = if apply {
                message.label_ids.insert(label.clone())
            } else {
                message.label_ids.remove(&label)
            };
            let mut deltas = CounterDeltas::new();
            if changed && message.unread {
                deltas.push((label, if apply { 1 } else { -1 }));
            }
            let remote_id = synced_id(&message);
            tx.upsert_message(message);
            Ok((changed, remote_id, deltas))
        })
        .await?;
        self.apply_deltas(deltas).await?;

        let kind = if apply { ActionKind::Label } else { ActionKind::Unlabel };
        self.enqueue_remote(kind, remote_id, local_id, |action| action.with_param1(label_id))
            .await?;
        Ok(changed)
    }

    /// Move a message from folder `from` to folder `to`.
    ///
    /// Moving to trash strips every user label plus starred and all-mail and
    /// marks the message read. Moving to spam strips the same labels without
    /// touching unread counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn move_to(&self, local_id: &str, from: &str, to: &str) -> Result<()> {
        let id = local_id.to_string();
        let (from_label, to_label) = (from.to_string(), to.to_string());
        let config = Arc::clone(&self.config);
        let (remote_id, deltas) = transact(self.replica.as_ref(), move |tx| {
            let mut message = tx.message(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            let mut deltas = CounterDeltas::new();

            if message.label_ids.remove(&from_label) && message.unread {
                deltas.push((from_label, -1));
            }
            if message.label_ids.insert(to_label.clone()) {
                let labels = &config.labels;
                let trash = to_label == labels.trash;
                if trash || to_label == labels.spam {
                    let stripped: Vec<String> = message
                        .label_ids
                        .iter()
                        .filter(|label| {
                            !labels.is_system(label) || **label == labels.starred || **label == labels.all_mail
                        })
                        .cloned()
                        .collect();
                    for label in stripped {
                        message.label_ids.remove(&label);
                        if trash && message.unread {
                            deltas.push((label, -1));
                        }
                    }
                    if trash {
                        message.unread = false;
                    }
                }
                if message.unread {
                    deltas.push((to_label, 1));
                }
            }

            let remote_id = synced_id(&message);
            tx.upsert_message(message);
            Ok((remote_id, deltas))
        })
        .await?;
        self.apply_deltas(deltas).await?;

        self.enqueue_remote(ActionKind::Folder, remote_id, local_id, |action| {
            action.with_param1(from).with_param2(to)
        })
        .await
    }

    /// Delete a message locally and queue its remote deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or a store
    /// error.
    pub async fn delete(&self, local_id: &str) -> Result<()> {
        let id = local_id.to_string();
        let (remote_id, deltas) = transact(self.replica.as_ref(), move |tx| {
            let message = tx.delete_message(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            let deltas: CounterDeltas = if message.unread {
                message.label_ids.iter().map(|label| (label.clone(), -1)).collect()
            } else {
                Vec::new()
            };
            Ok((synced_id(&message), deltas))
        })
        .await?;
        self.apply_deltas(deltas).await?;

        self.enqueue_remote(ActionKind::Delete, remote_id, local_id, |action| action)
            .await
    }

    /// Delete every message carrying `label_id` and queue emptying it remotely.
    ///
    /// Returns the number of messages removed locally.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn empty(&self, label_id: &str) -> Result<usize> {
        let label = label_id.to_string();
        let removed = transact(self.replica.as_ref(), move |tx| {
            let doomed = tx.messages(&|message: &Message| message.has_label(&label), MessageOrder::default(), None);
            for message in &doomed {
                tx.delete_message(&message.local_id);
            }
            Ok(doomed.len())
        })
        .await?;
        self.counters.set_unread(label_id, 0).await?;

        self.queue
            .enqueue(&Action::new(ActionKind::Empty, ActionTarget::None).with_param1(label_id))
            .await?;
        info!(label_id, removed, "Label emptied locally");
        Ok(removed)
    }

    /// Store a draft and queue saving it remotely.
    ///
    /// The draft label is added if missing.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn save_draft(&self, mut draft: Message) -> Result<Message> {
        draft.label_ids.insert(self.config.labels.draft.clone());
        let saved = transact(self.replica.as_ref(), move |tx| Ok(tx.upsert_message(draft))).await?;

        self.queue
            .enqueue(&Action::new(
                ActionKind::SaveDraft,
                ActionTarget::Local(saved.local_id.clone()),
            ))
            .await?;
        Ok(saved)
    }

    /// Queue sending a stored draft.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the draft does not exist, or a store
    /// error.
    pub async fn send(&self, local_id: &str) -> Result<()> {
        let id = local_id.to_string();
        transact(self.replica.as_ref(), move |tx| {
            tx.message(&id).map(|_| ()).ok_or(Error::NotFound(id))
        })
        .await?;

        self.queue
            .enqueue(&Action::new(ActionKind::Send, ActionTarget::Local(local_id.to_string())))
            .await?;
        info!(local_id, "Send queued");
        Ok(())
    }

    /// Attach a file to a draft and queue its upload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the draft does not exist, or a store
    /// error.
    pub async fn add_attachment(
        &self,
        message_local_id: &str,
        file_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<Attachment> {
        self.attach(
            Attachment::new_local(message_local_id, file_name, mime_type, data),
            ActionKind::UploadAttachment,
        )
        .await
    }

    /// Attach the sender's armored public key to a draft.
    ///
    /// It is uploaded only if some recipient turns out to need it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the draft does not exist, or a store
    /// error.
    pub async fn attach_public_key(
        &self,
        message_local_id: &str,
        file_name: &str,
        armored_key: &str,
    ) -> Result<Attachment> {
        self.attach(
            Attachment::new_local(
                message_local_id,
                file_name,
                "application/pgp-keys",
                armored_key.as_bytes().to_vec(),
            ),
            ActionKind::UploadPublicKey,
        )
        .await
    }

    async fn attach(&self, attachment: Attachment, kind: ActionKind) -> Result<Attachment> {
        let stored = transact(self.replica.as_ref(), move |tx| {
            let parent = &attachment.message_local_id;
            let mut message = tx.message(parent).ok_or_else(|| Error::NotFound(parent.clone()))?;
            message.num_attachments += 1;
            tx.upsert_message(message);
            Ok(tx.upsert_attachment(attachment))
        })
        .await?;

        self.queue
            .enqueue(&Action::new(kind, ActionTarget::Local(stored.local_id.clone())))
            .await?;
        Ok(stored)
    }

    /// Remove an attachment locally and queue its remote deletion if it was
    /// ever uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the attachment does not exist, or a
    /// store error.
    pub async fn delete_attachment(&self, local_id: &str) -> Result<()> {
        let id = local_id.to_string();
        let removed = transact(self.replica.as_ref(), move |tx| {
            let attachment = tx.delete_attachment(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            if let Some(mut message) = tx.message(&attachment.message_local_id) {
                message.num_attachments = message.num_attachments.saturating_sub(1);
                tx.upsert_message(message);
            }
            Ok(attachment)
        })
        .await?;

        match removed.remote_id.filter(|id| !id.is_empty()) {
            Some(remote_id) => {
                self.queue
                    .enqueue(&Action::new(ActionKind::DeleteAttachment, ActionTarget::Remote(remote_id)))
                    .await
            }
            None => {
                debug!(local_id, "Attachment was never uploaded");
                Ok(())
            }
        }
    }

    async fn apply_deltas(&self, deltas: CounterDeltas) -> Result<()> {
        for (label_id, delta) in deltas {
            self.counters.adjust_unread(&label_id, delta).await?;
        }
        Ok(())
    }

    async fn enqueue_remote(
        &self,
        kind: ActionKind,
        remote_id: Option<String>,
        local_id: &str,
        params: impl FnOnce(Action) -> Action,
    ) -> Result<()> {
        let Some(remote_id) = remote_id else {
            debug!(local_id, %kind, "Message never synced, nothing to queue");
            return Ok(());
        };
        self.queue
            .enqueue(&params(Action::new(kind, ActionTarget::Remote(remote_id))))
            .await
    }
}

fn synced_id(message: &Message) -> Option<String> {
    message.remote_id.clone().filter(|id| !id.is_empty())
}
