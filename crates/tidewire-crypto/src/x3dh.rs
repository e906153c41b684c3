//! X3DH (Extended Triple Diffie-Hellman) key agreement
//!
//! Establishes a [`RatchetSession`] with a peer that may be offline.
//!
//! # Protocol Overview
//!
//! 1. The responder publishes its identity key (IK), signed pre-key (SPK)
//!    and optional one-time pre-keys (OPK)
//! 2. The initiator fetches a pre-key bundle and verifies the SPK signature
//! 3. The initiator generates an ephemeral key (EK) and computes:
//!    - DH1 = DH(IK_A, SPK_B)
//!    - DH2 = DH(EK_A, IK_B)
//!    - DH3 = DH(EK_A, SPK_B)
//!    - DH4 = DH(EK_A, OPK_B) (if OPK present)
//! 4. SK = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4])
//!
//! The initiator's ratchet starts from SK with EK as its first ratchet key
//! pair. The responder starts from SK with SPK as its ratchet key pair and
//! performs its first DH ratchet step when the first message arrives.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::identity::{IdentityKeyPair, IdentityPublicKey, IDENTITY_WIRE_SIZE};
use crate::kdf::{domain, KeyDerivationContext, RootKey};
use crate::keys::{
    KeyPair, OneTimePreKey, PreKeyBundle, PreKeyUpload, PublicKeyBytes, SharedSecret, SignedPreKey,
};
use crate::ratchet::{RatchetLimits, RatchetSession};

/// Handshake data the initiator attaches to its messages until the peer replies
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// Initiator identity in wire form
    #[serde(with = "hex::serde")]
    pub identity_key: [u8; IDENTITY_WIRE_SIZE],
    /// Ephemeral key, which is also the initiator's first ratchet key
    pub ephemeral_key: PublicKeyBytes,
    /// ID of the responder's signed pre-key that was used
    pub signed_prekey_id: u32,
    /// ID of the responder's one-time pre-key that was used (if any)
    pub one_time_prekey_id: Option<u32>,
}

impl HandshakeInit {
    /// Parse the initiator's identity key
    pub fn initiator_identity(&self) -> Result<IdentityPublicKey> {
        IdentityPublicKey::from_wire(&self.identity_key)
    }
}

struct SignedPreKeyPair {
    id: u32,
    key_pair: KeyPair,
    signature: [u8; 64],
    timestamp: i64,
}

impl SignedPreKeyPair {
    fn public(&self) -> SignedPreKey {
        SignedPreKey {
            id: self.id,
            public_key: self.key_pair.public_key(),
            signature: self.signature,
            timestamp: self.timestamp,
        }
    }
}

struct OneTimePreKeyPair {
    id: u32,
    key_pair: KeyPair,
}

/// Local pre-key material of a responder
///
/// The previous signed pre-key is kept after a rotation so handshakes that
/// were started against it still complete.
pub struct PreKeyManager {
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKeyPair,
    previous_signed_prekey: Option<SignedPreKeyPair>,
    one_time_prekeys: Vec<OneTimePreKeyPair>,
    opk_counter: u32,
}

impl PreKeyManager {
    /// Create a new pre-key manager with a fresh signed pre-key
    pub fn new(identity: IdentityKeyPair) -> Self {
        let signed_prekey = Self::generate_signed_prekey(&identity, 1);
        Self {
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: Vec::new(),
            opk_counter: 0,
        }
    }

    fn generate_signed_prekey(identity: &IdentityKeyPair, id: u32) -> SignedPreKeyPair {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(key_pair.public_key().as_bytes());
        SignedPreKeyPair {
            id,
            key_pair,
            signature,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Generate one-time pre-keys
    pub fn generate_one_time_prekeys(&mut self, count: usize) {
        for _ in 0..count {
            self.opk_counter += 1;
            self.one_time_prekeys.push(OneTimePreKeyPair {
                id: self.opk_counter,
                key_pair: KeyPair::generate(),
            });
        }
        debug!("Generated {} one-time pre-keys", count);
    }

    /// Bundle advertising the first unused one-time pre-key
    pub fn get_bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: self.identity.public_key().to_wire(),
            signed_prekey: self.signed_prekey.public(),
            one_time_prekey: self.one_time_prekeys.first().map(|opk| OneTimePreKey {
                id: opk.id,
                public_key: opk.key_pair.public_key(),
            }),
        }
    }

    /// All public pre-key material, for publishing to a directory
    pub fn upload(&self) -> PreKeyUpload {
        PreKeyUpload {
            identity_key: self.identity.public_key().to_wire(),
            signed_prekey: self.signed_prekey.public(),
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .map(|opk| OneTimePreKey {
                    id: opk.id,
                    public_key: opk.key_pair.public_key(),
                })
                .collect(),
        }
    }

    /// Remove a one-time pre-key, returning its pair if it existed
    pub fn consume_one_time_prekey(&mut self, id: u32) -> Option<KeyPair> {
        let pos = self.one_time_prekeys.iter().position(|k| k.id == id)?;
        Some(self.one_time_prekeys.remove(pos).key_pair)
    }

    /// Number of unused one-time pre-keys
    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    fn signed_prekey(&self, id: u32) -> Option<&KeyPair> {
        if self.signed_prekey.id == id {
            return Some(&self.signed_prekey.key_pair);
        }
        self.previous_signed_prekey
            .as_ref()
            .filter(|spk| spk.id == id)
            .map(|spk| &spk.key_pair)
    }

    /// Rotate the signed pre-key, keeping the previous one for late handshakes
    pub fn rotate_signed_prekey(&mut self) {
        let new_id = self.signed_prekey.id + 1;
        let next = Self::generate_signed_prekey(&self.identity, new_id);
        self.previous_signed_prekey = Some(std::mem::replace(&mut self.signed_prekey, next));
        info!("Rotated signed pre-key to id {}", new_id);
    }

    /// Identity key pair
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }
}

/// X3DH handshake
pub struct HandshakeEngine;

impl HandshakeEngine {
    /// Start a session from the peer's pre-key bundle
    ///
    /// Fails with [`CryptoError::InvalidBundle`] if the signed pre-key does
    /// not verify against the bundle's identity key.
    #[instrument(skip_all, fields(spk = bundle.signed_prekey.id))]
    pub fn initiate(
        local_identity: &IdentityKeyPair,
        bundle: &PreKeyBundle,
        limits: RatchetLimits,
    ) -> Result<(RatchetSession, HandshakeInit)> {
        let their_identity = bundle.verify()?;
        let ephemeral = KeyPair::generate();
        let spk = &bundle.signed_prekey.public_key;

        let dh1 = local_identity.dh(spk);
        let dh2 = ephemeral.dh(&their_identity.dh_key());
        let dh3 = ephemeral.dh(spk);
        let dh4 = bundle
            .one_time_prekey
            .as_ref()
            .map(|opk| ephemeral.dh(&opk.public_key));

        let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

        let init = HandshakeInit {
            identity_key: local_identity.public_key().to_wire(),
            ephemeral_key: ephemeral.public_key(),
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|opk| opk.id),
        };
        let session = RatchetSession::new_initiator(shared_secret, ephemeral, *spk, limits)?;

        info!(
            "Initiated handshake with {} (one-time pre-key: {})",
            &their_identity.fingerprint_hex()[..12],
            init.one_time_prekey_id.is_some()
        );
        Ok((session, init))
    }

    /// Complete a session from the initiator's [`HandshakeInit`]
    ///
    /// Consumes the referenced one-time pre-key; a missing one fails with
    /// [`CryptoError::PrekeyNotFound`].
    #[instrument(skip_all, fields(spk = init.signed_prekey_id, opk = ?init.one_time_prekey_id))]
    pub fn respond(
        local_prekeys: &mut PreKeyManager,
        init: &HandshakeInit,
        limits: RatchetLimits,
    ) -> Result<RatchetSession> {
        let their_identity = init.initiator_identity()?;
        let spk = local_prekeys
            .signed_prekey(init.signed_prekey_id)
            .cloned()
            .ok_or_else(|| {
                CryptoError::PrekeyNotFound(format!("signed pre-key {}", init.signed_prekey_id))
            })?;

        let opk = match init.one_time_prekey_id {
            Some(id) => Some(
                local_prekeys
                    .consume_one_time_prekey(id)
                    .ok_or_else(|| CryptoError::PrekeyNotFound(format!("one-time pre-key {}", id)))?,
            ),
            None => None,
        };

        let dh1 = spk.dh(&their_identity.dh_key());
        let dh2 = local_prekeys.identity().dh(&init.ephemeral_key);
        let dh3 = spk.dh(&init.ephemeral_key);
        let dh4 = opk.as_ref().map(|opk| opk.dh(&init.ephemeral_key));

        let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

        info!(
            "Accepted handshake from {}",
            &their_identity.fingerprint_hex()[..12]
        );
        Ok(RatchetSession::new_responder(shared_secret, spk, limits))
    }
}

fn derive_shared_secret(
    dh1: &SharedSecret,
    dh2: &SharedSecret,
    dh3: &SharedSecret,
    dh4: Option<&SharedSecret>,
) -> Result<RootKey> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4.as_bytes());
    }

    KeyDerivationContext::new(None, &ikm).derive(domain::HANDSHAKE_SECRET)
}
