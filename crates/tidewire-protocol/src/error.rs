//! Protocol error types
//!
//! Every error carries a [`Disposition`] telling the caller whether to show
//! it, drop the offending input silently, or throw the session away.

use thiserror::Error;

use tidewire_core::{MessageId, PeerAddress};
use tidewire_crypto::CryptoError;

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// What the caller should do with an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Report to the application
    Surface,
    /// Log and discard the input that caused it
    Drop,
    /// Discard the session and re-handshake
    ResetSession,
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] tidewire_core::Error),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// No acknowledgement after every retry
    #[error("Delivery of {message_id} timed out after {attempts} attempts")]
    DeliveryTimeout {
        /// The undelivered message
        message_id: MessageId,
        /// Transmissions made, including the first
        attempts: u32,
    },

    /// The connection supervisor gave up
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed {
        /// Remote peer
        peer: PeerAddress,
        /// Last failure
        reason: String,
    },

    /// Fragments of a message did not all arrive in time
    #[error("Reassembly of {message_id} timed out with {} fragments missing", missing.len())]
    ReassemblyTimeout {
        /// The incomplete message
        message_id: MessageId,
        /// Indices never received
        missing: Vec<u32>,
    },

    /// Fragments of one message disagree on its fragment count
    #[error("Inconsistent fragment {index}/{total} for {message_id}")]
    InconsistentFragment {
        /// The message
        message_id: MessageId,
        /// Offending fragment index
        index: u32,
        /// Fragment count it claims
        total: u32,
    },

    /// The directory has no bundle for the peer
    #[error("No pre-key bundle available for {0}")]
    PreKeyUnavailable(PeerAddress),

    /// A message arrived without a handshake for a peer with no session
    #[error("No session with {0}")]
    SessionNotFound(PeerAddress),

    /// Fetching a bundle took too long
    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(PeerAddress),

    /// Undecodable frame or payload
    #[error("Invalid wire data: {0}")]
    InvalidWire(String),

    /// Frame larger than the transport accepts
    #[error("Frame of {size} bytes exceeds transport limit {max}")]
    FrameTooLarge {
        /// Frame size
        size: usize,
        /// Transport limit
        max: usize,
    },

    /// The offline queue for a peer is full
    #[error("Offline queue for {0} is full")]
    QueueFull(PeerAddress),

    /// The offline queue already discarded this message for age
    #[error("Message {0} expired in the offline queue")]
    MessageExpired(MessageId),

    /// A handshake that was already answered arrived again
    #[error("Replayed handshake from {0}")]
    HandshakeReplay(PeerAddress),

    /// A handshake carried an identity other than the one known for the peer
    #[error("Identity key of {0} does not match the known identity")]
    IdentityMismatch(PeerAddress),

    /// A background task has stopped
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// How the caller should react
    pub fn disposition(&self) -> Disposition {
        match self {
            ProtocolError::Crypto(err) => match err {
                CryptoError::AuthenticationFailed
                | CryptoError::DuplicateOrUnknownMessage { .. }
                | CryptoError::Malformed(_) => Disposition::Drop,
                CryptoError::TooManySkippedMessages { .. } => Disposition::ResetSession,
                _ => Disposition::Surface,
            },
            ProtocolError::SessionNotFound(_) => Disposition::ResetSession,
            ProtocolError::ReassemblyTimeout { .. }
            | ProtocolError::InconsistentFragment { .. }
            | ProtocolError::InvalidWire(_)
            | ProtocolError::MessageExpired(_)
            | ProtocolError::HandshakeReplay(_)
            | ProtocolError::IdentityMismatch(_) => Disposition::Drop,
            _ => Disposition::Surface,
        }
    }

    /// True for a replayed or already-consumed message
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            ProtocolError::Crypto(CryptoError::DuplicateOrUnknownMessage { .. })
        )
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::InvalidWire(err.to_string())
    }
}
