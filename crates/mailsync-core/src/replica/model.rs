//! Replica record types.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a message row holds full metadata or is a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Known only by id; metadata still has to be fetched.
    #[default]
    Raw,
    /// Metadata merged from the server.
    Materialized,
}

/// How a sent message was protected in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionKind {
    /// Not recorded yet.
    #[default]
    Unknown,
    /// Every recipient is internal.
    Internal,
    /// Outside recipients received a password-protected copy.
    OutsideEncrypted,
    /// Outside recipients received the message in clear.
    OutsidePlain,
}

/// How a draft relates to the message it was composed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyAction {
    /// Reply to the sender.
    Reply,
    /// Reply to everyone.
    ReplyAll,
    /// Forward.
    Forward,
}

impl ReplyAction {
    /// Wire value of the action.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Reply => 0,
            Self::ReplyAll => 1,
            Self::Forward => 2,
        }
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Reply),
            1 => Some(Self::ReplyAll),
            2 => Some(Self::Forward),
            _ => None,
        }
    }
}

/// A message recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Display name (may be empty).
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Email address.
    #[serde(rename = "Address")]
    pub address: String,
}

impl Recipient {
    /// Creates a recipient.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A message in the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Stable local reference, assigned when the row is created.
    pub local_id: String,
    /// Server id, once known.
    pub remote_id: Option<String>,
    /// Labels the message belongs to.
    pub label_ids: BTreeSet<String>,
    /// Unread flag.
    pub unread: bool,
    /// Materialization state.
    pub status: MessageStatus,
    /// Whether the body has been downloaded.
    pub detail_downloaded: bool,
    /// Server timestamp.
    pub time: Option<DateTime<Utc>>,
    /// Subject line.
    pub subject: String,
    /// Armored encrypted body.
    pub body: String,
    /// Body MIME type.
    pub mime_type: String,
    /// Sending address id.
    pub address_id: String,
    /// To recipients.
    pub to: Vec<Recipient>,
    /// Cc recipients.
    pub cc: Vec<Recipient>,
    /// Bcc recipients.
    pub bcc: Vec<Recipient>,
    /// Password for outside encryption (empty if unset).
    pub password: String,
    /// Hint for the outside-encryption password.
    pub password_hint: String,
    /// Seconds until the message expires (0 for never).
    pub expiration_offset: i64,
    /// Protection recorded after sending.
    pub encryption: EncryptionKind,
    /// The message has been replied to.
    pub replied: bool,
    /// The message has been replied to all.
    pub replied_all: bool,
    /// The message has been forwarded.
    pub forwarded: bool,
    /// Number of attachments.
    pub num_attachments: u32,
    /// Local id of the message this draft answers or forwards.
    pub parent_local_id: Option<String>,
    /// Relation to the parent message.
    pub reply_action: Option<ReplyAction>,
}

impl Message {
    /// Creates an empty local message with a fresh local id.
    #[must_use]
    pub fn new_local() -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// Creates a placeholder row for a server id.
    #[must_use]
    pub fn placeholder(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: Some(remote_id.into()),
            ..Self::new_local()
        }
    }

    /// Returns true if the message carries `label_id`.
    #[must_use]
    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.contains(label_id)
    }

    /// Server id, or an empty string when never synced.
    #[must_use]
    pub fn remote_id_or_empty(&self) -> &str {
        self.remote_id.as_deref().unwrap_or_default()
    }

    /// Every recipient across To, Cc and Bcc.
    pub fn all_recipients(&self) -> impl Iterator<Item = &Recipient> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Returns true if a share password is set for outside recipients.
    #[must_use]
    pub fn is_outside_encrypted(&self) -> bool {
        !self.password.is_empty()
    }
}

/// A label or folder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Label {
    /// Label id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Display name.
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Folders are exclusive; a message sits in at most one.
    #[serde(rename = "Exclusive", default, deserialize_with = "crate::transport::wire::flag")]
    pub exclusive: bool,
}

impl Label {
    /// Creates a label.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, exclusive: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            exclusive,
        }
    }
}

/// A message attachment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attachment {
    /// Stable local reference.
    pub local_id: String,
    /// Server id, once uploaded.
    pub remote_id: Option<String>,
    /// Local id of the parent message.
    pub message_local_id: String,
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Content id for inline attachments.
    pub content_id: Option<String>,
    /// File on disk holding the cleartext, if any.
    pub local_path: Option<PathBuf>,
    /// Cleartext cached in memory until uploaded.
    pub file_data: Option<Vec<u8>>,
    /// Base64 key packet returned by the encryption step.
    pub key_packet: Option<String>,
    /// Copied from another message and not yet confirmed by a draft save.
    pub is_temp: bool,
    /// The key packet must be re-encrypted before the next save.
    pub key_changed: bool,
}

impl Attachment {
    /// Creates a pending attachment for a message.
    #[must_use]
    pub fn new_local(
        message_local_id: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            message_local_id: message_local_id.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            file_data: Some(data),
            ..Self::default()
        }
    }
}

/// A contact card.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    /// Contact id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Display name.
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// One email address of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactEmail {
    /// Contact email id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Owning contact id.
    #[serde(rename = "ContactID", default)]
    pub contact_id: String,
    /// Email address.
    #[serde(rename = "Email", default)]
    pub email: String,
    /// Display name.
    #[serde(rename = "Name", default)]
    pub name: String,
}
