//! Remote mail service transport.
//!
//! The core never talks HTTP itself. Handlers and the reconciliation engine
//! describe a call as an [`ApiRequest`] and hand it to a [`Transport`], which
//! answers with a domain payload or a [`TransportError`] carrying the status
//! and domain code the outcome classifier needs.

pub mod wire;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::send::SendRequest;
use wire::{AttachmentUpload, DraftRequest};

/// Why the service could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityKind {
    /// The request timed out.
    Timeout,
    /// No network route to the service.
    NoRoute,
    /// The request was cancelled before completing.
    Cancelled,
}

/// Errors returned by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The service could not be reached.
    #[error("Connectivity failure: {0:?}")]
    Connectivity(ConnectivityKind),

    /// The service rejected the request.
    #[error("API error (status {status}, code {code}): {message}")]
    Api {
        /// HTTP-like status code.
        status: u16,
        /// Domain error code.
        code: i64,
        /// Error message from the service.
        message: String,
    },

    /// The session's credentials are locked and must be re-validated.
    #[error("Credentials locked")]
    CredentialsLocked,

    /// The response payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Shorthand for a rejected request.
    #[must_use]
    pub fn api(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code,
            message: message.into(),
        }
    }

    /// Returns true for timeouts, missing routes and cancellations.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// Result of a transport call.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Batch message state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStateChange {
    /// Mark read.
    Read,
    /// Mark unread.
    Unread,
    /// Delete.
    Delete,
}

/// A call to the remote mail service.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    /// Create a draft.
    CreateDraft(DraftRequest),
    /// Update an existing draft.
    UpdateDraft {
        /// Remote draft id.
        id: String,
        /// New draft content.
        draft: DraftRequest,
    },
    /// Change the state of several messages at once.
    MessageState {
        /// The change to apply.
        change: MessageStateChange,
        /// Remote message ids.
        ids: Vec<String>,
    },
    /// Apply a label to messages.
    ApplyLabel {
        /// Label id.
        label_id: String,
        /// Remote message ids.
        ids: Vec<String>,
    },
    /// Remove a label from messages.
    RemoveLabel {
        /// Label id.
        label_id: String,
        /// Remote message ids.
        ids: Vec<String>,
    },
    /// Delete every message in a label.
    EmptyLabel {
        /// Label id.
        label_id: String,
    },
    /// Upload an encrypted attachment.
    UploadAttachment(AttachmentUpload),
    /// Delete an attachment.
    DeleteAttachment {
        /// Remote attachment id.
        id: String,
    },
    /// Look up the public keys of an address.
    PublicKeys {
        /// Email address.
        email: String,
    },
    /// Send a draft.
    SendMessage {
        /// Remote draft id.
        id: String,
        /// Assembled request.
        request: Box<SendRequest>,
    },
    /// Latest event id.
    LatestEventId,
    /// Events since a cursor.
    Events {
        /// Last applied event id.
        since: String,
    },
    /// A page of message metadata from one label.
    MessagesByLabel {
        /// Label id.
        label_id: String,
        /// Only messages older than this unix time (0 for the newest page).
        end_time: i64,
    },
    /// Message metadata by id.
    MessagesByIds {
        /// Remote message ids.
        ids: Vec<String>,
    },
    /// One message with its body and attachments.
    MessageDetail {
        /// Remote message id.
        id: String,
    },
    /// Per-label message counts.
    MessageCounts,
    /// All labels.
    Labels,
    /// All contacts.
    Contacts,
    /// All contact emails.
    ContactEmails,
}

impl ApiRequest {
    /// Short endpoint name, for logs and test doubles.
    #[must_use]
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::CreateDraft(_) => "drafts/create",
            Self::UpdateDraft { .. } => "drafts/update",
            Self::MessageState { change, .. } => match change {
                MessageStateChange::Read => "messages/read",
                MessageStateChange::Unread => "messages/unread",
                MessageStateChange::Delete => "messages/delete",
            },
            Self::ApplyLabel { .. } => "messages/label",
            Self::RemoveLabel { .. } => "messages/unlabel",
            Self::EmptyLabel { .. } => "messages/empty",
            Self::UploadAttachment(_) => "attachments/upload",
            Self::DeleteAttachment { .. } => "attachments/delete",
            Self::PublicKeys { .. } => "keys",
            Self::SendMessage { .. } => "messages/send",
            Self::LatestEventId => "events/latest",
            Self::Events { .. } => "events",
            Self::MessagesByLabel { .. } => "messages/by-label",
            Self::MessagesByIds { .. } => "messages/by-id",
            Self::MessageDetail { .. } => "messages/detail",
            Self::MessageCounts => "messages/count",
            Self::Labels => "labels",
            Self::Contacts => "contacts",
            Self::ContactEmails => "contacts/emails",
        }
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// Domain code (the success code for ordinary responses).
    pub code: i64,
    /// Response payload.
    pub body: serde_json::Value,
}

impl ApiResponse {
    /// Creates a response.
    #[must_use]
    pub const fn new(code: i64, body: serde_json::Value) -> Self {
        Self { code, body }
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Request/response access to the remote mail service.
///
/// Timeouts and retries are the implementation's business; the core only
/// reacts to the final outcome.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call.
    async fn call(&self, request: ApiRequest) -> TransportResult<ApiResponse>;
}
