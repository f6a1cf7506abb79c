//! Event-sourced reconciliation of the replica with the service.
//!
//! An incremental poll applies the events since the stored cursor, one batch
//! at a time. A full refresh replaces the replica with a fresh inbox page when
//! there is no cursor, when the service asks for one, or when the cursor has
//! expired.

mod events;

pub use events::{EventOutcome, EventRules, apply_message_event};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::counter::CounterStore;
use crate::drain::DrainLoop;
use crate::replica::{Attachment, Message, MessageOrder, MessageStatus, ReplicaStore, transact};
use crate::sinks::{AccountSink, BadgeSink};
use crate::transport::wire::{
    ContactEmailsEnvelope, ContactsEnvelope, CountPayload, CountsEnvelope, EventAction, EventBatch,
    LabelsEnvelope, LatestEvent, MessageEnvelope, MessagePayload, MessagesPage, from_unix,
};
use crate::transport::{ApiRequest, Transport, TransportError};
use crate::{Error, Result};

/// Upper bound on consecutive polls in [`ReconciliationEngine::poll_until_current`].
const MAX_POLL_ROUNDS: usize = 64;

/// What a poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The replica was rebuilt from scratch.
    FullRefresh,
    /// Only the contacts were refetched.
    ContactsRefreshed,
    /// An incremental batch was applied.
    Applied {
        /// Message events applied.
        messages: usize,
        /// Messages queued for a direct metadata fetch.
        follow_ups: usize,
        /// More events are waiting.
        more: bool,
    },
}

/// What [`ReconciliationEngine::purge_placeholders`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Placeholders the service returned metadata for.
    pub refreshed: usize,
    /// Placeholders the service no longer knows, now deleted.
    pub removed: usize,
}

/// Applies remote changes to the replica and the counter store.
pub struct ReconciliationEngine {
    replica: Arc<dyn ReplicaStore>,
    transport: Arc<dyn Transport>,
    counters: Arc<CounterStore>,
    drain: Arc<DrainLoop>,
    badge: Arc<dyn BadgeSink>,
    account: Arc<dyn AccountSink>,
    config: Arc<SyncConfig>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl ReconciliationEngine {
    /// Creates an engine. Follow-up fetches run as read tasks on `drain`.
    #[must_use]
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        transport: Arc<dyn Transport>,
        counters: Arc<CounterStore>,
        drain: Arc<DrainLoop>,
        badge: Arc<dyn BadgeSink>,
        account: Arc<dyn AccountSink>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            replica,
            transport,
            counters,
            drain,
            badge,
            account,
            config,
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring the replica up to date with the next batch of remote events.
    ///
    /// `notification_id` is the remote id of a message whose notification was
    /// just delivered; events for it never mark it unread again.
    ///
    /// # Errors
    ///
    /// Returns an error if the events cannot be fetched or the message
    /// category cannot be committed. The cursor is left unchanged then.
    pub async fn poll(self: &Arc<Self>, notification_id: Option<&str>) -> Result<PollOutcome> {
        let _batch = self.apply_lock.lock().await;
        let codes = &self.config.codes;

        let Some(cursor) = self.counters.event_cursor().await? else {
            return self.full_refresh().await;
        };

        let batch = match self.transport.call(ApiRequest::Events { since: cursor }).await {
            Ok(response) => response.parse::<EventBatch>()?,
            Err(TransportError::Api { code, .. }) if code == codes.invalid_cursor => {
                info!("Event cursor rejected");
                return self.full_refresh().await;
            }
            Err(e) => return Err(e.into()),
        };

        if batch.code == codes.invalid_cursor || self.config.refresh.requires_mail(batch.refresh) {
            return self.full_refresh().await;
        }
        if self.config.refresh.requires_contacts(batch.refresh) {
            self.refresh_contacts().await?;
            if !batch.event_id.is_empty() {
                self.counters.set_event_cursor(&batch.event_id).await?;
            }
            return Ok(PollOutcome::ContactsRefreshed);
        }

        self.apply_batch(batch, notification_id).await
    }

    /// Poll until the service reports no more pending events.
    ///
    /// # Errors
    ///
    /// Returns the first poll error.
    pub async fn poll_until_current(self: &Arc<Self>, notification_id: Option<&str>) -> Result<PollOutcome> {
        let mut outcome = self.poll(notification_id).await?;
        for _ in 1..MAX_POLL_ROUNDS {
            if !matches!(outcome, PollOutcome::Applied { more: true, .. }) {
                return Ok(outcome);
            }
            outcome = self.poll(notification_id).await?;
        }
        warn!(rounds = MAX_POLL_ROUNDS, "Event log still has more after polling");
        Ok(outcome)
    }

    async fn apply_batch(self: &Arc<Self>, batch: EventBatch, notification_id: Option<&str>) -> Result<PollOutcome> {
        let EventBatch {
            event_id,
            more,
            messages,
            contacts,
            contact_emails,
            labels,
            user,
            user_settings,
            mail_settings,
            addresses,
            message_counts,
            used_space,
            ..
        } = batch;
        let message_count = messages.len();

        let config = Arc::clone(&self.config);
        let notification = notification_id.map(str::to_string);
        let follow_ups = transact(self.replica.as_ref(), move |tx| {
            let rules = EventRules {
                config: &config,
                notification_id: notification.as_deref(),
            };
            let mut follow_ups = Vec::new();
            for event in &messages {
                if apply_message_event(tx, event, &rules) == EventOutcome::FollowUp {
                    follow_ups.push(event.id.clone());
                }
            }
            Ok(follow_ups)
        })
        .await?;

        if !event_id.is_empty() {
            self.counters.set_event_cursor(&event_id).await?;
        }

        let contacts_result = transact(self.replica.as_ref(), move |tx| {
            for event in contacts {
                match (EventAction::from_code(event.action), event.record) {
                    (Some(EventAction::Delete), _) => {
                        tx.delete_contact(&event.id);
                    }
                    (_, Some(contact)) => {
                        tx.upsert_contact(contact);
                    }
                    _ => {}
                }
            }
            for event in contact_emails {
                match (EventAction::from_code(event.action), event.record) {
                    (Some(EventAction::Delete), _) => {
                        tx.delete_contact_email(&event.id);
                    }
                    (_, Some(email)) => {
                        tx.upsert_contact_email(email);
                    }
                    _ => {}
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = contacts_result {
            warn!(error = %e, "Failed to apply contact events");
        }

        let labels_result = transact(self.replica.as_ref(), move |tx| {
            for event in labels {
                match (EventAction::from_code(event.action), event.record) {
                    (Some(EventAction::Delete), _) => {
                        tx.delete_label(&event.id);
                    }
                    (_, Some(label)) => {
                        tx.upsert_label(label);
                    }
                    _ => {}
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = labels_result {
            warn!(error = %e, "Failed to apply label events");
        }

        if let Some(user) = &user {
            self.account.update_user(user);
        }
        if let Some(settings) = &user_settings {
            self.account.update_user_settings(settings);
        }
        if let Some(settings) = &mail_settings {
            self.account.update_mail_settings(settings);
        }
        for event in &addresses {
            match (EventAction::from_code(event.action), &event.record) {
                (Some(EventAction::Delete), _) => self.account.delete_address(&event.id),
                (_, Some(address)) => self.account.upsert_address(&event.id, address),
                _ => {}
            }
        }

        if !message_counts.is_empty() {
            if let Err(e) = self.apply_counts(&message_counts).await {
                warn!(error = %e, "Failed to apply message counts");
            }
        }
        if let Some(bytes) = used_space {
            self.account.set_used_space(bytes);
        }

        if !follow_ups.is_empty() {
            self.schedule_follow_up(follow_ups.clone());
        }

        debug!(event_id = %event_id, messages = message_count, follow_ups = follow_ups.len(), more, "Applied event batch");
        Ok(PollOutcome::Applied {
            messages: message_count,
            follow_ups: follow_ups.len(),
            more,
        })
    }

    fn schedule_follow_up(self: &Arc<Self>, ids: Vec<String>) {
        let engine = Arc::clone(self);
        self.drain.schedule_read(Box::pin(async move {
            if let Err(e) = engine.fetch_metadata(&ids).await {
                warn!(count = ids.len(), error = %e, "Follow-up metadata fetch failed");
            }
        }));
    }

    /// Wipe the mail replica and rebuild it from the inbox.
    ///
    /// The counter store and cursor are only replaced once the inbox page
    /// has been fetched and stored.
    async fn full_refresh(&self) -> Result<PollOutcome> {
        info!("Full refresh of the mail replica");
        let latest = self
            .transport
            .call(ApiRequest::LatestEventId)
            .await?
            .parse::<LatestEvent>()?;

        transact(self.replica.as_ref(), |tx| {
            tx.clear_messages();
            tx.clear_labels();
            tx.clear_contacts();
            Ok(())
        })
        .await?;
        self.badge.set_badge(0);

        let inbox = self.config.labels.inbox.clone();
        let page = self.fetch_page(&inbox, 0).await?;
        let stored = self.store_page(&page).await?;

        self.counters.clear().await?;
        self.counters.set_event_cursor(&latest.event_id).await?;
        self.record_window(&inbox, &page).await?;
        if let Err(e) = self.refresh_counts().await {
            warn!(error = %e, "Failed to refresh counts after full refresh");
        }
        if let Err(e) = self.refresh_labels().await {
            warn!(error = %e, "Failed to refetch labels after full refresh");
        }
        if let Err(e) = self.refresh_contacts().await {
            warn!(error = %e, "Failed to refetch contacts after full refresh");
        }

        info!(event_id = %latest.event_id, messages = stored, "Full refresh complete");
        Ok(PollOutcome::FullRefresh)
    }

    /// Fetch one page of `label_id` older than `end_time` (0 for the newest
    /// page) and store it as materialized messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the store fails.
    pub async fn fetch_label(&self, label_id: &str, end_time: i64) -> Result<usize> {
        let page = self.fetch_page(label_id, end_time).await?;
        let stored = self.store_page(&page).await?;
        self.record_window(label_id, &page).await?;

        if label_id == self.config.labels.inbox {
            self.refresh_counts().await?;
        }
        debug!(label_id, end_time, stored, "Fetched label page");
        Ok(stored)
    }

    /// Fetch full metadata for `ids` and merge it into the replica.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the store fails.
    pub async fn fetch_metadata(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let page = self
            .transport
            .call(ApiRequest::MessagesByIds { ids: ids.to_vec() })
            .await?
            .parse::<MessagesPage>()?;
        self.store_page(&page).await
    }

    /// Fetch the body and attachments of a message.
    ///
    /// A message whose detail is already downloaded is returned as stored
    /// unless `force` is set. A forced fetch keeps the stored copy when it is
    /// newer than the service's. Unsynced local messages are returned as
    /// stored. The unread flag of a stored message is left alone; marking it
    /// read is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist, or an error
    /// if the fetch or the store fails.
    pub async fn fetch_detail(&self, local_id: &str, force: bool) -> Result<Message> {
        let id = local_id.to_string();
        let stored = transact(self.replica.as_ref(), move |tx| {
            tx.message(&id).ok_or_else(|| Error::NotFound(id.clone()))
        })
        .await?;
        let Some(remote_id) = stored.remote_id.clone() else {
            return Ok(stored);
        };
        if stored.detail_downloaded && !force {
            return Ok(stored);
        }

        let payload = self.fetch_detail_payload(&remote_id).await?;
        let message = self.store_detail(&remote_id, payload).await?;
        debug!(local_id, remote_id = %remote_id, force, "Fetched message detail");
        Ok(message)
    }

    /// Fetch the message a push notification points at, creating its row if
    /// the replica does not hold it yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the store fails.
    pub async fn fetch_notification_message(&self, remote_id: &str) -> Result<Message> {
        let payload = self.fetch_detail_payload(remote_id).await?;
        let message = self.store_detail(remote_id, payload).await?;
        debug!(remote_id, local_id = %message.local_id, "Fetched notification message");
        Ok(message)
    }

    /// Refetch every placeholder still waiting for metadata and delete the
    /// ones the service no longer returns.
    ///
    /// Only rows with a remote id and no downloaded detail count as
    /// placeholders; local drafts are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the store fails. Nothing is deleted
    /// then.
    pub async fn purge_placeholders(&self) -> Result<PurgeReport> {
        let remote_ids = transact(self.replica.as_ref(), |tx| {
            let placeholders = tx.messages(
                &|message: &Message| {
                    message.status == MessageStatus::Raw && !message.detail_downloaded && message.remote_id.is_some()
                },
                MessageOrder::default(),
                None,
            );
            Ok(placeholders
                .into_iter()
                .filter_map(|message| message.remote_id)
                .collect::<Vec<_>>())
        })
        .await?;
        if remote_ids.is_empty() {
            return Ok(PurgeReport::default());
        }

        let refreshed = self.fetch_metadata(&remote_ids).await?;
        let (removed, deltas) = transact(self.replica.as_ref(), move |tx| {
            let mut removed = 0_usize;
            let mut deltas: Vec<(String, i64)> = Vec::new();
            for remote_id in &remote_ids {
                let Some(message) = tx.message_by_remote_id(remote_id) else {
                    continue;
                };
                if message.status != MessageStatus::Raw {
                    continue;
                }
                if message.unread {
                    deltas.extend(message.label_ids.iter().map(|label| (label.clone(), -1)));
                }
                tx.delete_message(&message.local_id);
                removed += 1;
            }
            Ok((removed, deltas))
        })
        .await?;

        if !deltas.is_empty() {
            for (label_id, delta) in deltas {
                self.counters.adjust_unread(&label_id, delta).await?;
            }
            let inbox = self.counters.unread(&self.config.labels.inbox).await?;
            self.badge.set_badge(inbox);
        }
        info!(refreshed, removed, "Purged message placeholders");
        Ok(PurgeReport { refreshed, removed })
    }

    /// Replace the unread counters with the service's counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the counter store fails.
    pub async fn refresh_counts(&self) -> Result<()> {
        let counts = self
            .transport
            .call(ApiRequest::MessageCounts)
            .await?
            .parse::<CountsEnvelope>()?;
        self.apply_counts(&counts.counts).await
    }

    async fn apply_counts(&self, counts: &[CountPayload]) -> Result<()> {
        let snapshot: Vec<(String, i64)> = counts
            .iter()
            .filter_map(|count| Some((count.label_id.clone()?, count.unread.unwrap_or(0))))
            .collect();
        self.counters.replace_unread(&snapshot).await?;

        let inbox = self.counters.unread(&self.config.labels.inbox).await?;
        self.badge.set_badge(inbox);
        Ok(())
    }

    async fn refresh_labels(&self) -> Result<()> {
        let labels = self
            .transport
            .call(ApiRequest::Labels)
            .await?
            .parse::<LabelsEnvelope>()?
            .labels;
        transact(self.replica.as_ref(), move |tx| {
            tx.clear_labels();
            for label in labels {
                tx.upsert_label(label);
            }
            Ok(())
        })
        .await
    }

    async fn refresh_contacts(&self) -> Result<()> {
        let contacts = self
            .transport
            .call(ApiRequest::Contacts)
            .await?
            .parse::<ContactsEnvelope>()?
            .contacts;
        let emails = self
            .transport
            .call(ApiRequest::ContactEmails)
            .await?
            .parse::<ContactEmailsEnvelope>()?
            .contact_emails;

        transact(self.replica.as_ref(), move |tx| {
            tx.clear_contacts();
            for contact in contacts {
                tx.upsert_contact(contact);
            }
            for email in emails {
                tx.upsert_contact_email(email);
            }
            Ok(())
        })
        .await
    }

    async fn fetch_page(&self, label_id: &str, end_time: i64) -> Result<MessagesPage> {
        let page = self
            .transport
            .call(ApiRequest::MessagesByLabel {
                label_id: label_id.to_string(),
                end_time,
            })
            .await?
            .parse::<MessagesPage>()?;
        Ok(page)
    }

    async fn fetch_detail_payload(&self, remote_id: &str) -> Result<MessagePayload> {
        let envelope = self
            .transport
            .call(ApiRequest::MessageDetail {
                id: remote_id.to_string(),
            })
            .await?
            .parse::<MessageEnvelope>()?;
        Ok(envelope.message)
    }

    async fn store_detail(&self, remote_id: &str, payload: MessagePayload) -> Result<Message> {
        let remote_id = remote_id.to_string();
        transact(self.replica.as_ref(), move |tx| {
            let existing = tx.message_by_remote_id(&remote_id);
            let remote_time = payload.time.and_then(from_unix);
            if let Some(stored) = existing.as_ref().filter(|stored| {
                stored.detail_downloaded && stored.time.zip(remote_time).is_some_and(|(local, remote)| local > remote)
            }) {
                return Ok(stored.clone());
            }

            let known = existing.is_some();
            let mut message = existing.unwrap_or_else(|| Message::placeholder(remote_id.as_str()));
            let unread = message.unread;
            payload.merge_into(&mut message);
            if known {
                message.unread = unread;
            }
            message.status = MessageStatus::Materialized;
            message.detail_downloaded = true;

            let attached: Vec<String> = tx
                .attachments_of(&message.local_id)
                .into_iter()
                .filter_map(|attachment| attachment.remote_id)
                .collect();
            for attachment in payload.attachments.iter().flatten() {
                if attached.contains(&attachment.id) {
                    continue;
                }
                tx.upsert_attachment(Attachment {
                    remote_id: Some(attachment.id.clone()),
                    key_packet: attachment.key_packets.clone(),
                    file_data: None,
                    ..Attachment::new_local(
                        message.local_id.clone(),
                        attachment.name.clone(),
                        attachment.mime_type.clone(),
                        Vec::new(),
                    )
                });
            }
            Ok(tx.upsert_message(message))
        })
        .await
    }

    async fn store_page(&self, page: &MessagesPage) -> Result<usize> {
        transact(self.replica.as_ref(), |tx| {
            let mut stored = 0;
            for payload in &page.messages {
                let Some(remote_id) = payload.id.as_deref() else {
                    continue;
                };
                let mut message = tx
                    .message_by_remote_id(remote_id)
                    .unwrap_or_else(|| Message::placeholder(remote_id));
                payload.merge_into(&mut message);
                message.status = MessageStatus::Materialized;
                tx.upsert_message(message);
                stored += 1;
            }
            Ok(stored)
        })
        .await
    }

    async fn record_window(&self, label_id: &str, page: &MessagesPage) -> Result<()> {
        let times: Vec<DateTime<Utc>> = page
            .messages
            .iter()
            .filter_map(|payload| payload.time.and_then(from_unix))
            .collect();
        let (Some(newest), Some(oldest)) = (times.iter().max(), times.iter().min()) else {
            return Ok(());
        };
        self.counters
            .extend_window(label_id, *newest, *oldest, page.total)
            .await
    }
}
