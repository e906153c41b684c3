//! Long-term identity keys
//!
//! An identity is an Ed25519 signing key. The X25519 key used in the
//! handshake is derived from the same seed, so a single 32-byte secret
//! backs both roles. Storage and lifecycle of this secret belong to the
//! identity collaborator; this module only uses it.
//!
//! On the wire an identity travels as 64 bytes, the Ed25519 key followed by
//! its X25519 counterpart. The second half is redundant and is checked
//! against the first on decode, so a peer cannot pair somebody else's
//! signing key with a DH key of its own.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{CryptoError, Result};
use crate::keys::{PublicKeyBytes, SharedSecret};

/// Size of an identity on the wire
pub const IDENTITY_WIRE_SIZE: usize = 64;

/// Identity key pair (Ed25519 for signing, derived X25519 for DH)
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    dh_secret: X25519StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        // Same expansion as libsodium's crypto_sign_ed25519_sk_to_curve25519
        let hash = Sha512::digest(signing_key.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;

        Self {
            signing_key,
            dh_secret: X25519StaticSecret::from(scalar),
        }
    }

    /// The public half
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            verifying_key: self.signing_key.verifying_key(),
            dh_key: X25519PublicKey::from(&self.dh_secret),
        }
    }

    /// Sign `message` with the Ed25519 key
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// X25519 agreement between the identity key and `their_public`
    pub fn dh(&self, their_public: &PublicKeyBytes) -> SharedSecret {
        let shared = self.dh_secret.diffie_hellman(&their_public.to_x25519());
        SharedSecret(*shared.as_bytes())
    }
}

impl Clone for IdentityKeyPair {
    fn clone(&self) -> Self {
        Self::from_signing_key(self.signing_key.clone())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.public_key().fingerprint_hex())
            .finish_non_exhaustive()
    }
}

/// A peer's public identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    verifying_key: VerifyingKey,
    dh_key: X25519PublicKey,
}

impl IdentityPublicKey {
    /// Decode the 64-byte wire form, rejecting a DH half that does not
    /// belong to the signing half
    pub fn from_wire(bytes: &[u8; IDENTITY_WIRE_SIZE]) -> Result<Self> {
        let mut ed = [0u8; 32];
        ed.copy_from_slice(&bytes[..32]);
        let verifying_key = VerifyingKey::from_bytes(&ed)
            .map_err(|_| CryptoError::InvalidPublicKey("Invalid Ed25519 public key".to_string()))?;

        let montgomery = CompressedEdwardsY(ed)
            .decompress()
            .ok_or_else(|| CryptoError::InvalidPublicKey("Could not decompress point".to_string()))?
            .to_montgomery()
            .to_bytes();
        if bytes[32..] != montgomery {
            return Err(CryptoError::InvalidPublicKey(
                "X25519 key does not match the Ed25519 key".to_string(),
            ));
        }

        Ok(Self {
            verifying_key,
            dh_key: X25519PublicKey::from(montgomery),
        })
    }

    /// Encode as Ed25519 key followed by X25519 key
    pub fn to_wire(&self) -> [u8; IDENTITY_WIRE_SIZE] {
        let mut bytes = [0u8; IDENTITY_WIRE_SIZE];
        bytes[..32].copy_from_slice(self.verifying_key.as_bytes());
        bytes[32..].copy_from_slice(self.dh_key.as_bytes());
        bytes
    }

    /// Verify an Ed25519 signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        self.verifying_key
            .verify_strict(message, &Signature::from_bytes(signature))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// X25519 key used in the handshake
    pub fn dh_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from_x25519(&self.dh_key)
    }

    /// SHA-256 of the wire form, hex encoded
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(Sha256::digest(self.to_wire()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign(b"tide table");

        assert!(identity.public_key().verify(b"tide table", &signature).is_ok());
        assert!(identity.public_key().verify(b"tide tables", &signature).is_err());
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let alice_shared = alice.dh(&bob.public_key().dh_key());
        let bob_shared = bob.dh(&alice.public_key().dh_key());
        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_wire_form_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let public = identity.public_key();

        let restored = IdentityPublicKey::from_wire(&public.to_wire()).unwrap();
        assert_eq!(public, restored);
        assert_eq!(public.fingerprint_hex(), restored.fingerprint_hex());
        assert_eq!(identity.clone().public_key(), public);
    }

    #[test]
    fn test_foreign_dh_half_rejected() {
        let victim = IdentityKeyPair::generate().public_key();
        let attacker = IdentityKeyPair::generate().public_key();

        let mut spliced = victim.to_wire();
        spliced[32..].copy_from_slice(attacker.dh_key().as_bytes());

        let err = IdentityPublicKey::from_wire(&spliced).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPublicKey(_)));
    }
}
