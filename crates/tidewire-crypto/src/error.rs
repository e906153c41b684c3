//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Pre-key bundle failed verification; no session may be created from it
    #[error("Invalid pre-key bundle: {0}")]
    InvalidBundle(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication failed (AEAD tag mismatch)
    #[error("Message authentication failed")]
    AuthenticationFailed,

    /// The message key was already consumed or never existed
    #[error("Duplicate or unknown message {message_number} on chain {ratchet_key}")]
    DuplicateOrUnknownMessage {
        /// Hex of the sender ratchet key
        ratchet_key: String,
        /// Message number in that chain
        message_number: u32,
    },

    /// Too many messages would have to be skipped; the session is desynchronized
    #[error("Too many skipped messages: gap of {gap} exceeds limit {max}")]
    TooManySkippedMessages {
        /// Requested gap
        gap: u32,
        /// Configured maximum
        max: u32,
    },

    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Message too large
    #[error("Message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Plaintext length in bytes
        size: usize,
        /// Largest plaintext accepted
        max: usize,
    },

    /// Malformed wire data
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Prekey not found
    #[error("Prekey not found: {0}")]
    PrekeyNotFound(String),

    /// Session has no sending chain yet
    #[error("Session not established")]
    SessionNotEstablished,
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        CryptoError::InvalidSignature
    }
}
