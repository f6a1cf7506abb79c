//! Error types for the sync core.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::transport::TransportError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote call failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Replica store transaction failed.
    #[error("Replica store error: {0}")]
    Store(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Credentials (auth, passphrase or keys) are not available.
    #[error("Credentials are locked")]
    CredentialsLocked,

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
