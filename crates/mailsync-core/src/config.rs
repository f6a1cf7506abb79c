//! Runtime configuration.
//!
//! Label ids, domain error codes and recipient types are a contract with the
//! remote service. They live here so a deployment can override them without
//! touching the classifier or the reconciliation rules.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ids of the system labels the core treats specially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelIds {
    /// Inbox.
    pub inbox: String,
    /// Drafts.
    pub draft: String,
    /// Sent mail.
    pub sent: String,
    /// Trash.
    pub trash: String,
    /// Spam.
    pub spam: String,
    /// All mail.
    pub all_mail: String,
    /// Archive.
    pub archive: String,
    /// Starred.
    pub starred: String,
}

impl Default for LabelIds {
    fn default() -> Self {
        Self {
            inbox: "0".into(),
            draft: "1".into(),
            sent: "2".into(),
            trash: "3".into(),
            spam: "4".into(),
            all_mail: "5".into(),
            archive: "6".into(),
            starred: "10".into(),
        }
    }
}

impl LabelIds {
    /// Returns true if `id` names one of the system labels.
    #[must_use]
    pub fn is_system(&self, id: &str) -> bool {
        [
            &self.inbox,
            &self.draft,
            &self.sent,
            &self.trash,
            &self.spam,
            &self.all_mail,
            &self.archive,
            &self.starred,
        ]
        .iter()
        .any(|label| label.as_str() == id)
    }
}

/// Domain error codes returned inside otherwise successful (status 200) responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCodes {
    /// Code of a successful response.
    pub success: i64,
    /// The account must pass a human verification challenge.
    pub human_verification: i64,
    /// The message exceeds a size or credit limit.
    pub send_size_limit: i64,
    /// The stored event cursor is no longer valid.
    pub invalid_cursor: i64,
    /// Codes strictly above this are business-rule rejections.
    pub non_retryable_above: i64,
    /// Codes strictly below this are local failures.
    pub local_below: i64,
}

impl Default for ErrorCodes {
    fn default() -> Self {
        Self {
            success: 1000,
            human_verification: 9001,
            send_size_limit: 15198,
            invalid_cursor: 18001,
            non_retryable_above: 1000,
            local_below: 200,
        }
    }
}

/// Recipient type values reported by the public key endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipientTypes {
    /// Recipient hosted by the same service.
    pub internal: i64,
    /// Recipient outside the service.
    pub external: i64,
}

impl Default for RecipientTypes {
    fn default() -> Self {
        Self {
            internal: 1,
            external: 2,
        }
    }
}

/// Bits of the `Refresh` field of an event batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshFlags {
    /// Mail must be refetched.
    pub mail: u32,
    /// Contacts must be refetched.
    pub contacts: u32,
    /// Everything must be refetched.
    pub all: u32,
}

impl Default for RefreshFlags {
    fn default() -> Self {
        Self {
            mail: 1,
            contacts: 2,
            all: 255,
        }
    }
}

impl RefreshFlags {
    /// Returns true if `refresh` requires wiping the mail replica.
    #[must_use]
    pub const fn requires_mail(&self, refresh: u32) -> bool {
        refresh != 0 && (refresh & self.all == self.all || refresh & self.mail != 0)
    }

    /// Returns true if `refresh` requires refetching contacts.
    #[must_use]
    pub const fn requires_contacts(&self, refresh: u32) -> bool {
        refresh & self.contacts != 0
    }
}

/// Top-level configuration for the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// System label ids.
    pub labels: LabelIds,
    /// Domain error code table.
    pub codes: ErrorCodes,
    /// Recipient type values.
    pub recipients: RecipientTypes,
    /// Event refresh flag bits.
    pub refresh: RefreshFlags,
    /// `Location` value the server uses for drafts in message events.
    pub draft_location: i64,
    /// Removing this label from a message invalidates its downloaded detail.
    /// Defaults to the all-mail label when unset.
    pub detail_reset_label: Option<String>,
    /// Milliseconds the background drain waits before retrying a kept action.
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            labels: LabelIds::default(),
            codes: ErrorCodes::default(),
            recipients: RecipientTypes::default(),
            refresh: RefreshFlags::default(),
            draft_location: 1,
            detail_reset_label: None,
            retry_delay_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location, falling back to defaults
    /// when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform has no configuration directory.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("mailsync").join("sync.json"))
            .ok_or_else(|| Error::Config("could not find config directory".into()))
    }

    /// Label whose removal marks a message's detail as stale.
    #[must_use]
    pub fn detail_reset_label(&self) -> &str {
        self.detail_reset_label
            .as_deref()
            .unwrap_or(&self.labels.all_mail)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"codes": {"human_verification": 12087}}"#).unwrap();
        assert_eq!(config.codes.human_verification, 12087);
        assert_eq!(config.codes.invalid_cursor, 18001);
        assert_eq!(config.labels.inbox, "0");
    }

    #[test]
    fn test_refresh_flags() {
        let flags = RefreshFlags::default();
        assert!(flags.requires_mail(255));
        assert!(flags.requires_mail(1));
        assert!(!flags.requires_mail(2));
        assert!(!flags.requires_mail(0));
        assert!(flags.requires_contacts(2));
    }

    #[test]
    fn test_detail_reset_label_defaults_to_all_mail() {
        let mut config = SyncConfig::default();
        assert_eq!(config.detail_reset_label(), "5");
        config.detail_reset_label = Some("1".into());
        assert_eq!(config.detail_reset_label(), "1");
    }

    #[test]
    fn test_system_labels() {
        let labels = LabelIds::default();
        assert!(labels.is_system("10"));
        assert!(!labels.is_system("custom"));
    }
}
