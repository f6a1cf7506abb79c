//! Sender credentials and recipient key pinning.

use async_trait::async_trait;

use crate::Result;
use crate::crypto::{Passphrase, SenderKeys};

/// Source of the signed-in user's credentials.
///
/// Any method returning `None` means the credentials are locked.
pub trait CredentialSource: Send + Sync {
    /// Returns true while the session holds a valid auth token.
    fn is_authenticated(&self) -> bool;

    /// The mailbox passphrase.
    fn mailbox_passphrase(&self) -> Option<Passphrase>;

    /// Keys of a sending address.
    fn sender_keys(&self, address_id: &str) -> Option<SenderKeys>;
}

/// Per-recipient preferences stored on a contact card.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PinnedContact {
    /// Email address the preferences apply to.
    pub email: String,
    /// Public key the user pinned for this address.
    pub pinned_key: Option<String>,
    /// Sign outgoing mail.
    pub sign: bool,
    /// Encrypt outgoing mail with the pinned key.
    pub encrypt: bool,
    /// Send as PGP/MIME.
    pub mime: bool,
    /// Send as plain text.
    pub plain_text: bool,
}

/// Contact key-pinning storage.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Pinned preferences for each of `emails` that has any.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    async fn pinned_contacts(&self, emails: &[String]) -> Result<Vec<PinnedContact>>;
}
