//! Key types used by the handshake and the ratchet
//!
//! - [`KeyPair`]: X25519 key pair for ratchet steps and handshake ephemerals
//! - [`PreKeyBundle`]: the peer material consumed once by the handshake

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::identity::{IdentityPublicKey, IDENTITY_WIRE_SIZE};

/// X25519 key pair used for ratchet steps and handshake ephemerals
pub struct KeyPair {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl KeyPair {
    /// Fresh key pair from the OS RNG
    pub fn generate() -> Self {
        Self::from_secret(X25519StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a pair from a session snapshot
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(X25519StaticSecret::from(bytes))
    }

    fn from_secret(secret: X25519StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half
    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from_x25519(&self.public)
    }

    /// X25519 agreement with `their_public`
    pub fn dh(&self, their_public: &PublicKeyBytes) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_x25519());
        SharedSecret(*shared.as_bytes())
    }

    /// Raw secret, only for session snapshots
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret.to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Output of an X25519 agreement, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    /// Raw secret
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// X25519 public key as it appears in headers and bundles
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(#[serde(with = "hex::serde")] pub [u8; 32]);

impl PublicKeyBytes {
    /// Wrap a dalek public key
    pub fn from_x25519(key: &X25519PublicKey) -> Self {
        Self(*key.as_bytes())
    }

    /// Unwrap into a dalek public key
    pub fn to_x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }

    /// Raw key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First six bytes in hex, for logs
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKeyBytes({})", self.short_hex())
    }
}

/// Medium-term pre-key, signed by the identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Identifier echoed back in the handshake
    pub id: u32,
    /// X25519 key
    pub public_key: PublicKeyBytes,
    /// Identity signature over `public_key`
    #[serde(with = "hex::serde")]
    pub signature: [u8; 64],
    /// Creation time in unix milliseconds
    pub timestamp: i64,
}

/// Pre-key handed to at most one initiator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Identifier echoed back in the handshake
    pub id: u32,
    /// X25519 key
    pub public_key: PublicKeyBytes,
}

/// Responder material for one handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Responder identity in wire form
    #[serde(with = "hex::serde")]
    pub identity_key: [u8; IDENTITY_WIRE_SIZE],
    /// Signed pre-key
    pub signed_prekey: SignedPreKey,
    /// Absent once the responder has run out
    pub one_time_prekey: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Verify the signed pre-key against the bundle's identity key
    ///
    /// Any failure (unparseable identity key or bad signature) is reported as
    /// [`CryptoError::InvalidBundle`].
    pub fn verify(&self) -> Result<IdentityPublicKey> {
        let identity = IdentityPublicKey::from_wire(&self.identity_key)
            .map_err(|e| CryptoError::InvalidBundle(e.to_string()))?;
        identity
            .verify(
                self.signed_prekey.public_key.as_bytes(),
                &self.signed_prekey.signature,
            )
            .map_err(|_| CryptoError::InvalidBundle("signed pre-key signature".to_string()))?;
        Ok(identity)
    }
}

/// Everything the identity collaborator publishes for one device
///
/// Each call to [`take_bundle`](Self::take_bundle) hands out a different
/// one-time pre-key, so no two initiators share one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyUpload {
    /// Identity in wire form
    #[serde(with = "hex::serde")]
    pub identity_key: [u8; IDENTITY_WIRE_SIZE],
    /// Signed pre-key
    pub signed_prekey: SignedPreKey,
    /// Remaining one-time pre-keys
    pub one_time_prekeys: Vec<OneTimePreKey>,
}

impl PreKeyUpload {
    /// Build a bundle, consuming one one-time pre-key if any are left
    pub fn take_bundle(&mut self) -> PreKeyBundle {
        let one_time_prekey = if self.one_time_prekeys.is_empty() {
            None
        } else {
            Some(self.one_time_prekeys.remove(0))
        };
        PreKeyBundle {
            identity_key: self.identity_key,
            signed_prekey: self.signed_prekey.clone(),
            one_time_prekey,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_agreement() {
        let ours = KeyPair::generate();
        let theirs = KeyPair::generate();
        assert_ne!(ours.public_key(), theirs.public_key());
        assert_eq!(
            ours.dh(&theirs.public_key()).as_bytes(),
            theirs.dh(&ours.public_key()).as_bytes()
        );
    }

    #[test]
    fn test_snapshot_secret_restores_same_pair() {
        let ratchet = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(ratchet.secret_bytes());
        assert_eq!(ratchet.public_key(), restored.public_key());
        assert_eq!(format!("{:?}", ratchet), format!("{:?}", restored));
    }

    #[test]
    fn test_upload_hands_out_each_one_time_prekey_once() {
        let spk = SignedPreKey {
            id: 1,
            public_key: PublicKeyBytes([1u8; 32]),
            signature: [0u8; 64],
            timestamp: 0,
        };
        let mut upload = PreKeyUpload {
            identity_key: [0u8; 64],
            signed_prekey: spk,
            one_time_prekeys: vec![
                OneTimePreKey { id: 7, public_key: PublicKeyBytes([2u8; 32]) },
                OneTimePreKey { id: 8, public_key: PublicKeyBytes([3u8; 32]) },
            ],
        };

        let ids: Vec<_> = (0..3)
            .map(|_| upload.take_bundle().one_time_prekey.map(|k| k.id))
            .collect();
        assert_eq!(ids, vec![Some(7), Some(8), None]);
    }
}
