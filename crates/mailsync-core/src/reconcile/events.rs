//! Application of message events to the replica.

use crate::config::SyncConfig;
use crate::replica::{Message, MessageStatus, ReplicaTx};
use crate::transport::wire::{EventAction, MessageEvent, MessagePayload};

/// What happened to one message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The replica was changed (or the event was a no-op delete).
    Applied,
    /// The event was ignored by the insert rule.
    Skipped,
    /// The message needs a direct metadata fetch.
    FollowUp,
}

/// Per-batch settings for [`apply_message_event`].
pub struct EventRules<'a> {
    /// Configuration holding label ids and the draft location.
    pub config: &'a SyncConfig,
    /// Remote id of the message behind a just-delivered notification.
    pub notification_id: Option<&'a str>,
}

impl EventRules<'_> {
    fn is_draft_or_sent(&self, message: &Message) -> bool {
        message.has_label(&self.config.labels.draft) || message.has_label(&self.config.labels.sent)
    }

    fn is_draft(&self, message: &Message, payload: &MessagePayload) -> bool {
        payload.location == Some(self.config.draft_location) || message.has_label(&self.config.labels.draft)
    }
}

/// Apply one message event inside an open transaction.
pub fn apply_message_event(tx: &mut dyn ReplicaTx, event: &MessageEvent, rules: &EventRules<'_>) -> EventOutcome {
    let Some(action) = EventAction::from_code(event.action) else {
        tracing::debug!(id = %event.id, action = event.action, "Unknown message event action");
        return EventOutcome::Skipped;
    };

    if action == EventAction::Delete {
        if let Some(message) = tx.message_by_remote_id(&event.id) {
            tx.delete_message(&message.local_id);
        }
        return EventOutcome::Applied;
    }

    let Some(raw) = &event.message else {
        return EventOutcome::FollowUp;
    };
    let Ok(mut payload) = serde_json::from_value::<MessagePayload>(raw.clone()) else {
        tracing::warn!(id = %event.id, "Malformed message event payload");
        return EventOutcome::FollowUp;
    };

    let existing = tx.message_by_remote_id(&event.id);
    if action == EventAction::Insert {
        if let Some(existing) = &existing {
            if !rules.is_draft_or_sent(existing) {
                return EventOutcome::Skipped;
            }
        }
    }

    if rules.notification_id == Some(event.id.as_str()) {
        payload.unread = None;
    }

    let mut message = existing.unwrap_or_else(|| Message::placeholder(event.id.clone()));
    if message.status == MessageStatus::Materialized && rules.is_draft(&message, &payload) {
        if let Some(subject) = &payload.subject {
            message.subject.clone_from(subject);
        }
        if let Some(time) = payload.time.and_then(crate::transport::wire::from_unix) {
            message.time = Some(time);
        }
        // A draft being edited locally only takes subject and time.
        tx.upsert_message(message);
        return EventOutcome::Applied;
    }

    payload.merge_into(&mut message);
    apply_label_deltas(tx, &mut message, &payload, rules.config);

    let outcome = if payload.subject.is_some() {
        message.status = MessageStatus::Materialized;
        EventOutcome::Applied
    } else if message.status == MessageStatus::Raw && message.subject.is_empty() {
        EventOutcome::FollowUp
    } else {
        EventOutcome::Applied
    };

    tx.upsert_message(message);
    outcome
}

fn apply_label_deltas(tx: &dyn ReplicaTx, message: &mut Message, payload: &MessagePayload, config: &SyncConfig) {
    for label_id in payload.label_ids_removed.iter().flatten() {
        message.label_ids.remove(label_id);
        if label_id == config.detail_reset_label() {
            message.detail_downloaded = false;
        }
    }
    for label_id in payload.label_ids_added.iter().flatten() {
        if config.labels.is_system(label_id) || tx.label(label_id).is_some() {
            message.label_ids.insert(label_id.clone());
        }
    }
}
