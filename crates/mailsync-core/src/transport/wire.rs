//! Payload shapes exchanged with the mail service.
//!
//! Only the fields the core consumes are modelled. Unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::replica::{Contact, ContactEmail, Label, Message, Recipient};

/// Deserialize a flag sent either as a boolean or as `0`/`1`.
///
/// # Errors
///
/// Returns an error if the value is neither a boolean nor a number.
pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
    })
}

fn optional_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    flag(deserializer).map(Some)
}

/// Convert a unix timestamp into a UTC time.
#[must_use]
pub fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

/// Message metadata as sent by the service, in events and page fetches.
///
/// Every field is optional: an event carries only what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessagePayload {
    /// Remote id.
    #[serde(rename = "ID")]
    pub id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Unix time.
    pub time: Option<i64>,
    /// Unread flag.
    #[serde(default, deserialize_with = "optional_flag")]
    pub unread: Option<bool>,
    /// Full label set.
    #[serde(rename = "LabelIDs")]
    pub label_ids: Option<Vec<String>>,
    /// Labels added since the previous event.
    #[serde(rename = "LabelIDsAdded")]
    pub label_ids_added: Option<Vec<String>>,
    /// Labels removed since the previous event.
    #[serde(rename = "LabelIDsRemoved")]
    pub label_ids_removed: Option<Vec<String>>,
    /// Legacy location code.
    pub location: Option<i64>,
    /// Armored body.
    pub body: Option<String>,
    /// Body MIME type.
    #[serde(rename = "MIMEType")]
    pub mime_type: Option<String>,
    /// Sending address id.
    #[serde(rename = "AddressID")]
    pub address_id: Option<String>,
    /// To recipients.
    pub to_list: Option<Vec<Recipient>>,
    /// Cc recipients.
    #[serde(rename = "CCList")]
    pub cc_list: Option<Vec<Recipient>>,
    /// Bcc recipients.
    #[serde(rename = "BCCList")]
    pub bcc_list: Option<Vec<Recipient>>,
    /// Number of attachments.
    pub num_attachments: Option<u32>,
    /// Replied flag.
    #[serde(default, deserialize_with = "optional_flag")]
    pub is_replied: Option<bool>,
    /// Replied-all flag.
    #[serde(default, deserialize_with = "optional_flag")]
    pub is_replied_all: Option<bool>,
    /// Forwarded flag.
    #[serde(default, deserialize_with = "optional_flag")]
    pub is_forwarded: Option<bool>,
    /// Attachments, in full responses only.
    pub attachments: Option<Vec<AttachmentPayload>>,
}

impl MessagePayload {
    /// Copy every field present in the payload onto `message`.
    ///
    /// Label deltas are not applied here; they depend on which labels the
    /// replica knows about.
    pub fn merge_into(&self, message: &mut Message) {
        if let Some(id) = &self.id {
            message.remote_id = Some(id.clone());
        }
        if let Some(subject) = &self.subject {
            message.subject.clone_from(subject);
        }
        if let Some(time) = self.time.and_then(from_unix) {
            message.time = Some(time);
        }
        if let Some(unread) = self.unread {
            message.unread = unread;
        }
        if let Some(label_ids) = &self.label_ids {
            message.label_ids = label_ids.iter().cloned().collect();
        }
        if let Some(body) = &self.body {
            message.body.clone_from(body);
        }
        if let Some(mime_type) = &self.mime_type {
            message.mime_type.clone_from(mime_type);
        }
        if let Some(address_id) = &self.address_id {
            message.address_id.clone_from(address_id);
        }
        if let Some(to) = &self.to_list {
            message.to.clone_from(to);
        }
        if let Some(cc) = &self.cc_list {
            message.cc.clone_from(cc);
        }
        if let Some(bcc) = &self.bcc_list {
            message.bcc.clone_from(bcc);
        }
        if let Some(count) = self.num_attachments {
            message.num_attachments = count;
        }
        if let Some(replied) = self.is_replied {
            message.replied = replied;
        }
        if let Some(replied_all) = self.is_replied_all {
            message.replied_all = replied_all;
        }
        if let Some(forwarded) = self.is_forwarded {
            message.forwarded = forwarded;
        }
    }
}

/// Attachment metadata as sent by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentPayload {
    /// Remote id.
    #[serde(rename = "ID")]
    pub id: String,
    /// File name.
    #[serde(default)]
    pub name: String,
    /// MIME type.
    #[serde(rename = "MIMEType", default)]
    pub mime_type: String,
    /// Base64 key packets.
    #[serde(default)]
    pub key_packets: Option<String>,
}

/// Response wrapping one message.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnvelope {
    /// The message.
    #[serde(rename = "Message")]
    pub message: MessagePayload,
}

/// Response to a send.
#[derive(Debug, Clone, Deserialize)]
pub struct SentEnvelope {
    /// The sent message.
    #[serde(rename = "Sent")]
    pub sent: MessagePayload,
}

/// A page of message metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessagesPage {
    /// Messages, newest first.
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    /// Total messages in the label.
    #[serde(default)]
    pub total: i64,
}

/// Response to the latest-event request.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestEvent {
    /// Current event id.
    #[serde(rename = "EventID")]
    pub event_id: String,
}

/// Unread/total counts of one label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CountPayload {
    /// Label id.
    #[serde(rename = "LabelID")]
    pub label_id: Option<String>,
    /// Unread messages.
    pub unread: Option<i64>,
    /// Total messages.
    pub total: Option<i64>,
}

/// Response to the message-count request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CountsEnvelope {
    /// Per-label counts.
    #[serde(rename = "Counts", default)]
    pub counts: Vec<CountPayload>,
}

/// Response to the label list request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelsEnvelope {
    /// Every label.
    #[serde(rename = "Labels", default)]
    pub labels: Vec<Label>,
}

/// Response to the contact list request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactsEnvelope {
    /// Every contact.
    #[serde(rename = "Contacts", default)]
    pub contacts: Vec<Contact>,
}

/// Response to the contact email list request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactEmailsEnvelope {
    /// Every contact email.
    #[serde(rename = "ContactEmails", default)]
    pub contact_emails: Vec<ContactEmail>,
}

/// Event action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Record deleted.
    Delete,
    /// Record created.
    Insert,
    /// Record changed.
    Update,
    /// Only flags changed.
    UpdateFlags,
}

impl EventAction {
    /// Parse a wire value.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Delete),
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::UpdateFlags),
            _ => None,
        }
    }
}

/// One message change in an event batch.
///
/// The payload is kept as raw JSON so one malformed record cannot fail the
/// whole batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageEvent {
    /// Remote message id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Action code.
    pub action: i64,
    /// Changed fields.
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

/// Generic record change in an event batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordEvent<T> {
    /// Record id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Action code.
    pub action: i64,
    /// Record body, absent on delete.
    #[serde(default, alias = "Contact", alias = "ContactEmail", alias = "Label", alias = "Address")]
    pub record: Option<T>,
}

/// A batch of remote changes since a cursor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventBatch {
    /// Id of the newest event in the batch.
    #[serde(rename = "EventID", default)]
    pub event_id: String,
    /// Refresh flags.
    #[serde(default)]
    pub refresh: u32,
    /// More events are waiting.
    #[serde(default, deserialize_with = "flag")]
    pub more: bool,
    /// Domain code.
    #[serde(default)]
    pub code: i64,
    /// Message changes.
    #[serde(default)]
    pub messages: Vec<MessageEvent>,
    /// Contact changes.
    #[serde(default)]
    pub contacts: Vec<RecordEvent<Contact>>,
    /// Contact email changes.
    #[serde(default)]
    pub contact_emails: Vec<RecordEvent<ContactEmail>>,
    /// Label changes.
    #[serde(default)]
    pub labels: Vec<RecordEvent<Label>>,
    /// User record.
    pub user: Option<serde_json::Value>,
    /// User settings.
    pub user_settings: Option<serde_json::Value>,
    /// Mail settings.
    pub mail_settings: Option<serde_json::Value>,
    /// Address changes.
    #[serde(default)]
    pub addresses: Vec<RecordEvent<serde_json::Value>>,
    /// Per-label counts.
    #[serde(default)]
    pub message_counts: Vec<CountPayload>,
    /// Used storage, in bytes.
    pub used_space: Option<i64>,
    /// Service notices.
    #[serde(default)]
    pub notices: Vec<String>,
}

/// One public key of a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublicKey {
    /// Key flags.
    #[serde(default)]
    pub flags: i64,
    /// Armored public key.
    pub public_key: String,
}

/// Public keys of one address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeysResponse {
    /// Recipient type (internal or external).
    pub recipient_type: i64,
    /// Preferred MIME type, if the recipient has one.
    #[serde(rename = "MIMEType", default)]
    pub mime_type: Option<String>,
    /// Keys, primary first.
    #[serde(default)]
    pub keys: Vec<PublicKey>,
}

impl KeysResponse {
    /// Primary public key, if any.
    #[must_use]
    pub fn first_key(&self) -> Option<&str> {
        self.keys.first().map(|key| key.public_key.as_str())
    }
}

/// Draft content sent to the create/update endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DraftRequest {
    /// Subject line.
    pub subject: String,
    /// Armored encrypted body.
    pub body: String,
    /// Sending address id.
    #[serde(rename = "AddressID")]
    pub address_id: String,
    /// To recipients.
    pub to_list: Vec<Recipient>,
    /// Cc recipients.
    #[serde(rename = "CCList")]
    pub cc_list: Vec<Recipient>,
    /// Bcc recipients.
    #[serde(rename = "BCCList")]
    pub bcc_list: Vec<Recipient>,
    /// Remote id of the message being answered or forwarded.
    #[serde(rename = "ParentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Reply action code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<i64>,
}

/// An encrypted attachment upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentUpload {
    /// File name.
    pub filename: String,
    /// MIME type.
    #[serde(rename = "MIMEType")]
    pub mime_type: String,
    /// Remote id of the parent draft.
    #[serde(rename = "MessageID")]
    pub message_id: String,
    /// Content id for inline attachments.
    #[serde(rename = "ContentID", skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Base64 key packets.
    pub key_packets: String,
    /// Base64 data packet.
    pub data_packet: String,
    /// Base64 detached signature.
    pub signature: String,
}

/// Response to an attachment upload.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentEnvelope {
    /// The stored attachment.
    #[serde(rename = "Attachment")]
    pub attachment: AttachmentPayload,
}
