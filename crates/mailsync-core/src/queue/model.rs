//! Queued action models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its stored form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of mutation an action carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create or update a draft remotely.
    SaveDraft,
    /// Send a draft through the send pipeline.
    Send,
    /// Mark read.
    Read,
    /// Mark unread.
    Unread,
    /// Delete a message.
    Delete,
    /// Apply a label.
    Label,
    /// Remove a label.
    Unlabel,
    /// Move between folders (`param1` = from, `param2` = to).
    Folder,
    /// Encrypt and upload an attachment.
    UploadAttachment,
    /// Upload the sender's public key as an attachment when recipients need it.
    UploadPublicKey,
    /// Delete a remote attachment.
    DeleteAttachment,
    /// Empty a label (`param1` = label id).
    Empty,
}

impl ActionKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::SaveDraft,
        Self::Send,
        Self::Read,
        Self::Unread,
        Self::Delete,
        Self::Label,
        Self::Unlabel,
        Self::Folder,
        Self::UploadAttachment,
        Self::UploadPublicKey,
        Self::DeleteAttachment,
        Self::Empty,
    ];

    /// Get the kind as a storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SaveDraft => "saveDraft",
            Self::Send => "send",
            Self::Read => "read",
            Self::Unread => "unread",
            Self::Delete => "delete",
            Self::Label => "applyLabel",
            Self::Unlabel => "removeLabel",
            Self::Folder => "folder",
            Self::UploadAttachment => "uploadAtt",
            Self::UploadPublicKey => "uploadPubkey",
            Self::DeleteAttachment => "deleteAtt",
            Self::Empty => "empty",
        }
    }

    /// Parse a kind from its storage string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Returns true if the action targets an attachment rather than a message.
    #[must_use]
    pub const fn targets_attachment(&self) -> bool {
        matches!(
            self,
            Self::UploadAttachment | Self::UploadPublicKey | Self::DeleteAttachment
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionTarget {
    /// A replica record that may not have a remote id yet.
    Local(String),
    /// A record known to the server by this id.
    Remote(String),
    /// The action carries its subject in its parameters.
    None,
}

impl ActionTarget {
    /// Storage discriminator for the target.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
            Self::None => "none",
        }
    }

    /// The id carried by the target, or an empty string.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Local(id) | Self::Remote(id) => id,
            Self::None => "",
        }
    }

    /// Rebuild a target from its stored parts.
    #[must_use]
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "local" => Some(Self::Local(id)),
            "remote" => Some(Self::Remote(id)),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// A queued local intent waiting to be reflected server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Unique id.
    pub id: ActionId,
    /// What the action operates on.
    pub target: ActionTarget,
    /// Kind of mutation.
    pub kind: ActionKind,
    /// First parameter (label id, source folder, ...).
    pub param1: Option<String>,
    /// Second parameter (destination folder).
    pub param2: Option<String>,
    /// When the action was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl Action {
    /// Creates a new action with no parameters.
    #[must_use]
    pub fn new(kind: ActionKind, target: ActionTarget) -> Self {
        Self {
            id: ActionId::new(),
            target,
            kind,
            param1: None,
            param2: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Sets the first parameter.
    #[must_use]
    pub fn with_param1(mut self, value: impl Into<String>) -> Self {
        self.param1 = Some(value.into());
        self
    }

    /// Sets the second parameter.
    #[must_use]
    pub fn with_param2(mut self, value: impl Into<String>) -> Self {
        self.param2 = Some(value.into());
        self
    }

    /// `empty(label)` action.
    #[must_use]
    pub fn empty(label_id: impl Into<String>) -> Self {
        Self::new(ActionKind::Empty, ActionTarget::None).with_param1(label_id)
    }

    /// `folder(from, to)` action for a synced message.
    #[must_use]
    pub fn folder(remote_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(ActionKind::Folder, ActionTarget::Remote(remote_id.into()))
            .with_param1(from)
            .with_param2(to)
    }
}

/// An action parked after a retryable server failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAction {
    /// The original action, id unchanged.
    pub action: Action,
    /// Human-readable description of the last error.
    pub error: String,
    /// HTTP-like status of the last attempt.
    pub status: Option<u16>,
    /// Domain error code of the last attempt.
    pub code: Option<i64>,
    /// When the action was parked.
    pub failed_at: DateTime<Utc>,
}

impl FailedAction {
    /// Capture `action` together with its error context.
    #[must_use]
    pub fn new(action: Action, error: impl Into<String>, status: Option<u16>, code: Option<i64>) -> Self {
        Self {
            action,
            error: error.into(),
            status,
            code,
            failed_at: Utc::now(),
        }
    }
}

/// A stored queue row that no longer decodes into an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableAction {
    /// Stored action id.
    pub id: String,
    /// Stored kind string.
    pub kind: String,
}
