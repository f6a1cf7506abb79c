//! Cryptographic provider contract.
//!
//! The core only decides what gets encrypted for whom. The primitives come
//! from a [`CryptoProvider`] supplied by the embedder.

use thiserror::Error;

/// Errors raised by a crypto provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption or signing failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// A required key is not available.
    #[error("Missing key: {0}")]
    MissingKey(String),

    /// Input was not a well-formed message or packet.
    #[error("Malformed input: {0}")]
    Malformed(String),
}

/// An armored private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    /// Armored key material.
    pub armored: String,
}

impl PrivateKey {
    /// Wrap armored key material.
    #[must_use]
    pub fn new(armored: impl Into<String>) -> Self {
        Self {
            armored: armored.into(),
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// The mailbox passphrase unlocking private keys.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wrap a passphrase.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// How a message's key packet is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySchema {
    /// Address keys, themselves unlocked through the user keys.
    #[default]
    AddressKeys,
    /// Legacy per-user keys.
    Legacy,
}

/// Keys available to the sending address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderKeys {
    /// Which keys unlock message key packets.
    pub schema: KeySchema,
    /// User keys.
    pub user_keys: Vec<PrivateKey>,
    /// Keys of the sending address, primary first.
    pub address_keys: Vec<PrivateKey>,
}

impl SenderKeys {
    /// Primary key of the sending address.
    #[must_use]
    pub fn primary(&self) -> Option<&PrivateKey> {
        self.address_keys.first()
    }

    /// Keys that can decrypt a message body under the current schema.
    #[must_use]
    pub fn decryption_keys(&self) -> &[PrivateKey] {
        match self.schema {
            KeySchema::AddressKeys => &self.address_keys,
            KeySchema::Legacy => &self.user_keys,
        }
    }
}

/// A symmetric session key.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    /// Raw key bytes.
    pub key: Vec<u8>,
    /// Symmetric algorithm name.
    pub algorithm: String,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Output of an encrypt-and-sign operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptedPayload {
    /// Session key encrypted to the signing key.
    pub key_packet: Vec<u8>,
    /// Symmetrically encrypted data.
    pub data_packet: Vec<u8>,
    /// Detached signature.
    pub signature: Vec<u8>,
}

/// Cryptographic primitives used by the handlers and the send pipeline.
pub trait CryptoProvider: Send + Sync {
    /// Encrypt `data` to `key` and sign it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be unlocked or encryption fails.
    fn encrypt_and_sign(
        &self,
        data: &[u8],
        key: &PrivateKey,
        passphrase: &Passphrase,
    ) -> Result<EncryptedPayload, CryptoError>;

    /// Decrypt an armored message with any of `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error if no key decrypts the message.
    fn decrypt(
        &self,
        armored: &str,
        keys: &[PrivateKey],
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Split an armored message into its key packet and data packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed.
    fn split_message(&self, armored: &str) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Recover the session key from a key packet.
    ///
    /// # Errors
    ///
    /// Returns an error if no key under the sender's schema opens the packet.
    fn resolve_session_key(
        &self,
        key_packet: &[u8],
        keys: &SenderKeys,
        passphrase: &Passphrase,
    ) -> Result<SessionKey, CryptoError>;

    /// Encrypt `data` symmetrically under an existing session key.
    ///
    /// Returns the data packet only; the key packet of `session` is reused.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    fn encrypt_with_session(&self, data: &[u8], session: &SessionKey) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt a session key to a recipient's public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the public key is unusable.
    fn encrypt_session_key(
        &self,
        session: &SessionKey,
        public_key: &str,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt a session key with a shared password.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    fn encrypt_session_key_with_password(
        &self,
        session: &SessionKey,
        password: &str,
    ) -> Result<Vec<u8>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let passphrase = Passphrase::new("hunter2");
        assert_eq!(format!("{passphrase:?}"), "Passphrase(..)");
        let session = SessionKey {
            key: vec![1, 2, 3],
            algorithm: "aes256".into(),
        };
        assert!(!format!("{session:?}").contains('1'));
    }

    #[test]
    fn test_decryption_keys_follow_schema() {
        let keys = SenderKeys {
            schema: KeySchema::Legacy,
            user_keys: vec![PrivateKey::new("user")],
            address_keys: vec![PrivateKey::new("address")],
        };
        assert_eq!(keys.decryption_keys()[0].armored, "user");
        assert_eq!(keys.primary().map(|k| k.armored.as_str()), Some("address"));
    }
}
