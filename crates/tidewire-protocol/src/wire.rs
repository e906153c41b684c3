//! Wire formats
//!
//! Three layers nest inside each other:
//!
//! ```text
//! Frame::Fragment ─▶ SealedMessage ─▶ RatchetMessage ─▶ AppPayload
//!  (transport)        (+handshake)     (ciphertext)      (plaintext)
//! ```
//!
//! Frames carry a one-byte version prefix followed by bincode.

use serde::{Deserialize, Serialize};

use tidewire_core::{MessageId, Timestamp};
use tidewire_crypto::ratchet::RatchetMessage;
use tidewire_crypto::x3dh::HandshakeInit;

use crate::error::{ProtocolError, Result};
use crate::fragment::Fragment;
use crate::receipts::ReceiptKind;
use crate::sync::SyncEnvelope;

/// Frame format version
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on the bytes a fragment frame adds around its payload
pub const FRAME_OVERHEAD: usize = 64;

/// Upper bound on a serialized [`SealedMessage`]: the largest plaintext the
/// ratchet accepts plus room for the header, tag and handshake
pub const MAX_SEALED_MESSAGE_SIZE: usize = tidewire_crypto::MAX_MESSAGE_SIZE + 1024;

/// Unit exchanged over a transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// One piece of a sealed message
    Fragment(Fragment),
    /// Batched acknowledgements of complete messages
    Ack {
        /// Acknowledged messages
        message_ids: Vec<MessageId>,
    },
    /// Request for missing fragments of a stalled message
    Nack {
        /// The stalled message
        message_id: MessageId,
        /// Indices not yet received
        missing: Vec<u32>,
    },
}

impl Frame {
    /// Encode with version prefix
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![WIRE_VERSION];
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    /// Decode a versioned frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&WIRE_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((version, _)) => Err(ProtocolError::InvalidWire(format!(
                "unsupported frame version {}",
                version
            ))),
            None => Err(ProtocolError::InvalidWire("empty frame".to_string())),
        }
    }
}

/// Ratchet ciphertext plus the handshake that created the session, if the
/// peer has not replied yet
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Present until the initiator decrypts a reply
    pub handshake: Option<HandshakeInit>,
    /// Serialized [`RatchetMessage`]
    pub body: Vec<u8>,
}

impl SealedMessage {
    /// Wrap a ratchet message
    pub fn new(handshake: Option<HandshakeInit>, message: &RatchetMessage) -> Self {
        Self {
            handshake,
            body: message.to_bytes(),
        }
    }

    /// Parse the ratchet message
    pub fn ratchet_message(&self) -> Result<RatchetMessage> {
        Ok(RatchetMessage::from_bytes(&self.body)?)
    }

    /// Serialize
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Plaintext carried inside a ratchet message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppPayload {
    /// Application message
    Message {
        /// Opaque body
        body: Vec<u8>,
        /// Sender clock at send time
        sent_at: Timestamp,
    },
    /// Receipt about a message the receiver of this payload sent
    Receipt {
        /// The message the receipt is about
        message_id: MessageId,
        /// Receipt kind
        kind: ReceiptKind,
        /// When it happened on the sender's clock
        at: Timestamp,
    },
    /// Multi-device sync event
    Sync(SyncEnvelope),
}

impl AppPayload {
    /// Serialize
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_frame_overhead() {
        let payload = vec![7u8; 1000];
        let frame = Frame::Fragment(Fragment {
            message_id: MessageId::new(),
            index: u32::MAX - 1,
            total: u32::MAX,
            payload: payload.clone(),
        });
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() <= payload.len() + FRAME_OVERHEAD);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut encoded = Frame::Ack {
            message_ids: vec![MessageId::new()],
        }
        .encode()
        .unwrap();
        encoded[0] = 9;

        assert!(matches!(
            Frame::decode(&encoded),
            Err(ProtocolError::InvalidWire(_))
        ));
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_garbage_is_invalid_wire() {
        let err = Frame::decode(&[WIRE_VERSION, 0xff, 0xff, 0xff, 0xff, 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidWire(_)));
    }
}
