//! Per-recipient encryption and format decisions.

use serde::{Serialize, Serializer};

use crate::config::RecipientTypes;
use crate::identity::PinnedContact;
use crate::transport::wire::KeysResponse;

/// How one recipient's copy is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageScheme {
    /// Encrypted to the recipient's key on the same service.
    Internal,
    /// Encrypted with the message's share password.
    EncryptedOutside,
    /// Sent in clear.
    Clear,
    /// PGP inline, encrypted to the recipient's pinned key.
    PgpInline,
    /// PGP/MIME, encrypted to the recipient's pinned key.
    PgpMime,
    /// Clear MIME, signed.
    ClearMime,
}

impl PackageScheme {
    /// Wire value of the scheme.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Internal => 1,
            Self::EncryptedOutside => 2,
            Self::Clear => 4,
            Self::PgpInline => 8,
            Self::PgpMime => 16,
            Self::ClearMime => 32,
        }
    }

    /// The service needs the session key in clear to deliver this copy.
    #[must_use]
    pub const fn is_clear(self) -> bool {
        matches!(self, Self::Clear | Self::ClearMime)
    }
}

impl Serialize for PackageScheme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Which rendering of the body a recipient receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BodyFormat {
    /// The canonical HTML body.
    #[serde(rename = "text/html")]
    Html,
    /// Plain text rendering.
    #[serde(rename = "text/plain")]
    Plain,
    /// Full MIME rendering including attachments.
    #[serde(rename = "multipart/mixed")]
    Mime,
}

/// Decision for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientPlan {
    /// Recipient address.
    pub email: String,
    /// Hosted by the same service.
    pub internal: bool,
    /// Protection scheme.
    pub scheme: PackageScheme,
    /// Key the copy is encrypted to, if any.
    pub public_key: Option<String>,
    /// Sign the copy.
    pub sign: bool,
    /// Body rendering.
    pub format: BodyFormat,
}

/// Why no plan could be made for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// An internal recipient published no key.
    #[error("no public key published for {0}")]
    NoKey(String),
    /// The pinned key is not among the keys the service returned.
    #[error("pinned key for {0} does not match the published keys")]
    KeyMismatch(String),
}

/// Decide how `email` receives the message.
///
/// `outside_password` is true when the draft carries a share password for
/// recipients outside the service.
///
/// # Errors
///
/// Returns an error if an internal recipient cannot be encrypted to.
pub fn decide(
    email: &str,
    keys: &KeysResponse,
    pinned: Option<&PinnedContact>,
    outside_password: bool,
    types: &RecipientTypes,
) -> Result<RecipientPlan, PolicyError> {
    let pinned_key = pinned.and_then(|contact| contact.pinned_key.as_deref());
    let prefers_plain = |contact: Option<&PinnedContact>| {
        contact.is_some_and(|c| c.plain_text)
            || keys.mime_type.as_deref() == Some("text/plain")
    };

    if keys.recipient_type == types.internal {
        if let Some(pinned_key) = pinned_key {
            if !keys.keys.iter().any(|key| key.public_key == pinned_key) {
                return Err(PolicyError::KeyMismatch(email.to_string()));
            }
            return Ok(RecipientPlan {
                email: email.to_string(),
                internal: true,
                scheme: PackageScheme::Internal,
                public_key: Some(pinned_key.to_string()),
                sign: true,
                format: if prefers_plain(pinned) {
                    BodyFormat::Plain
                } else {
                    BodyFormat::Html
                },
            });
        }

        let key = keys
            .first_key()
            .ok_or_else(|| PolicyError::NoKey(email.to_string()))?;
        return Ok(RecipientPlan {
            email: email.to_string(),
            internal: true,
            scheme: PackageScheme::Internal,
            public_key: Some(key.to_string()),
            sign: false,
            format: if prefers_plain(None) {
                BodyFormat::Plain
            } else {
                BodyFormat::Html
            },
        });
    }

    if let (Some(contact), Some(pinned_key)) = (pinned, pinned_key) {
        if contact.encrypt {
            let (scheme, format) = if contact.mime {
                (PackageScheme::PgpMime, BodyFormat::Mime)
            } else {
                (PackageScheme::PgpInline, BodyFormat::Plain)
            };
            return Ok(RecipientPlan {
                email: email.to_string(),
                internal: false,
                scheme,
                public_key: Some(pinned_key.to_string()),
                sign: contact.sign,
                format,
            });
        }
    }

    if outside_password {
        return Ok(RecipientPlan {
            email: email.to_string(),
            internal: false,
            scheme: PackageScheme::EncryptedOutside,
            public_key: None,
            sign: false,
            format: BodyFormat::Html,
        });
    }

    let sign = pinned.is_some_and(|contact| contact.sign);
    let (scheme, format) = match pinned {
        Some(contact) if contact.sign && contact.mime => (PackageScheme::ClearMime, BodyFormat::Mime),
        contact if prefers_plain(contact) => (PackageScheme::Clear, BodyFormat::Plain),
        _ => (PackageScheme::Clear, BodyFormat::Html),
    };
    Ok(RecipientPlan {
        email: email.to_string(),
        internal: false,
        scheme,
        public_key: None,
        sign,
        format,
    })
}
