//! Send request payloads.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use super::policy::{BodyFormat, PackageScheme};
use crate::crypto::SessionKey;

/// A session key handed to the service in clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionKeyPayload {
    /// Base64 key bytes.
    pub key: String,
    /// Symmetric algorithm.
    pub algorithm: String,
}

impl From<&SessionKey> for SessionKeyPayload {
    fn from(session: &SessionKey) -> Self {
        Self {
            key: STANDARD.encode(&session.key),
            algorithm: session.algorithm.clone(),
        }
    }
}

/// Encrypted material for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressPackage {
    /// Recipient address.
    pub email: String,
    /// Protection scheme.
    #[serde(rename = "Type")]
    pub scheme: PackageScheme,
    /// Body rendering the recipient receives.
    #[serde(rename = "MIMEType")]
    pub format: BodyFormat,
    /// Sign the copy.
    pub signature: bool,
    /// Base64 body session key, encrypted for the recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_key_packet: Option<String>,
    /// Base64 attachment session keys by remote attachment id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attachment_key_packets: BTreeMap<String, String>,
    /// Hint for password-protected copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hint: Option<String>,
}

/// Everything the service needs to deliver one draft.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendRequest {
    /// Seconds until the message expires (0 for never).
    #[serde(skip_serializing_if = "is_zero")]
    pub expiration_time: i64,
    /// One package per recipient.
    pub packages: Vec<AddressPackage>,
    /// Base64 data packet of the canonical body.
    pub body: String,
    /// Base64 data packet of the MIME rendering.
    #[serde(rename = "MIMEBody", skip_serializing_if = "Option::is_none")]
    pub mime_body: Option<String>,
    /// Base64 data packet of the plain-text rendering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_text_body: Option<String>,
    /// Body session key, when some recipient gets a clear copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_key: Option<SessionKeyPayload>,
    /// Attachment session keys, when some recipient gets a clear copy.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attachment_keys: BTreeMap<String, SessionKeyPayload>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl SendRequest {
    /// Returns true if any recipient is outside the service.
    #[must_use]
    pub fn has_clear_recipient(&self) -> bool {
        self.packages.iter().any(|package| package.scheme.is_clear())
    }
}
