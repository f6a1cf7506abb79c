//! Per-attempt build state of the send pipeline.

use super::package::AddressPackage;
use super::policy::{BodyFormat, RecipientPlan};
use crate::crypto::{Passphrase, SenderKeys, SessionKey};
use crate::identity::PinnedContact;
use crate::replica::{Attachment, Message};
use crate::transport::wire::KeysResponse;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Load the draft and its attachments from the replica.
    LoadDraft,
    /// Auth, passphrase and sending address key.
    ResolveCredentials,
    /// Public keys of every recipient.
    ResolveRecipientKeys,
    /// Session key of the stored body.
    ResolveBodySession,
    /// Per-recipient scheme and format.
    DecideRecipientPolicy,
    /// MIME and plain-text renderings.
    BuildBodyVariants,
    /// Session keys of the uploaded attachments.
    ResolveAttachmentKeys,
    /// One package per recipient.
    AssembleAddressPackages,
    /// Hand the request to the transport.
    Submit,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Self; 9] = [
        Self::LoadDraft,
        Self::ResolveCredentials,
        Self::ResolveRecipientKeys,
        Self::ResolveBodySession,
        Self::DecideRecipientPolicy,
        Self::BuildBodyVariants,
        Self::ResolveAttachmentKeys,
        Self::AssembleAddressPackages,
        Self::Submit,
    ];

    /// Stage name used in logs and failure reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LoadDraft => "load_draft",
            Self::ResolveCredentials => "resolve_credentials",
            Self::ResolveRecipientKeys => "resolve_recipient_keys",
            Self::ResolveBodySession => "resolve_body_session",
            Self::DecideRecipientPolicy => "decide_recipient_policy",
            Self::BuildBodyVariants => "build_body_variants",
            Self::ResolveAttachmentKeys => "resolve_attachment_keys",
            Self::AssembleAddressPackages => "assemble_address_packages",
            Self::Submit => "submit",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State accumulated by one send attempt. Dropped when the attempt ends.
#[derive(Debug, Default)]
pub struct SendContext {
    /// Local id of the draft being sent.
    pub local_id: String,
    /// The draft.
    pub message: Message,
    /// Its attachments.
    pub attachments: Vec<Attachment>,
    /// Mailbox passphrase.
    pub passphrase: Option<Passphrase>,
    /// Keys of the sending address.
    pub sender_keys: Option<SenderKeys>,
    /// Recipient addresses, deduplicated, in message order.
    pub recipients: Vec<String>,
    /// Pinned contact preferences of the recipients.
    pub pinned: Vec<PinnedContact>,
    /// Key lookups, parallel to `recipients`.
    pub recipient_keys: Vec<KeysResponse>,
    /// Data packet of the stored body.
    pub body_data: Vec<u8>,
    /// Session key of the stored body.
    pub body_session: Option<SessionKey>,
    /// Decision per recipient, parallel to `recipients`.
    pub plans: Vec<RecipientPlan>,
    /// Encrypted MIME rendering.
    pub mime_body: Option<Vec<u8>>,
    /// Encrypted plain-text rendering.
    pub plain_body: Option<Vec<u8>>,
    /// Session keys by remote attachment id.
    pub attachment_sessions: Vec<(String, SessionKey)>,
    /// Assembled packages.
    pub packages: Vec<AddressPackage>,
    /// Stages entered so far.
    pub reached: Vec<Stage>,
}

impl SendContext {
    /// Creates an empty context for a draft.
    #[must_use]
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Self::default()
        }
    }

    /// Pinned preferences for `email`, matched case-insensitively.
    #[must_use]
    pub fn pinned_for(&self, email: &str) -> Option<&PinnedContact> {
        self.pinned
            .iter()
            .find(|contact| contact.email.eq_ignore_ascii_case(email))
    }

    /// Returns true if some recipient receives `format`.
    #[must_use]
    pub fn needs_format(&self, format: BodyFormat) -> bool {
        self.plans.iter().any(|plan| plan.format == format)
    }

    /// Returns true if some recipient is outside the service.
    #[must_use]
    pub fn has_outside_recipient(&self) -> bool {
        self.plans.iter().any(|plan| !plan.internal)
    }

    /// Comma-separated stage log.
    #[must_use]
    pub fn trail(&self) -> String {
        self.reached
            .iter()
            .map(Stage::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
