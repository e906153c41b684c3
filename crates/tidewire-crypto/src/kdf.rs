//! Key Derivation Functions (KDF) for the ratchet
//!
//! Root-chain derivation uses HKDF-SHA512 salted with the current root key,
//! chain stepping uses HMAC-SHA256 with distinct constants. Both are one-way:
//! a chain key cannot be recovered from a message key derived from it.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// HKDF using SHA-512 for key derivation
pub type HkdfSha512 = Hkdf<Sha512>;

/// HMAC-SHA256 for chain stepping
pub type HmacSha256 = Hmac<Sha256>;

/// Domain separation strings for different key derivation contexts
pub mod domain {
    /// Initial shared secret from X3DH
    pub const HANDSHAKE_SECRET: &[u8] = b"Tidewire_v1_X3DH";
    /// Root key derivation in a DH ratchet step
    pub const ROOT_KEY: &[u8] = b"Tidewire_v1_RootKey";
    /// Chain key derivation in a DH ratchet step
    pub const CHAIN_KEY: &[u8] = b"Tidewire_v1_ChainKey";
}

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// A 32-byte key with automatic zeroization
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub(crate) [u8; 32]);

impl SymmetricKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Root key of a ratchet session
pub type RootKey = SymmetricKey;
/// Chain key of a sending or receiving chain
pub type ChainKey = SymmetricKey;
/// Single-use message key
pub type MessageKey = SymmetricKey;

/// Key derivation context for HKDF operations
pub struct KeyDerivationContext {
    hkdf: HkdfSha512,
}

impl KeyDerivationContext {
    /// Create a new KDF context from input key material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zero-filled salt)
    /// * `ikm` - Input Key Material (e.g., shared secret from DH)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            hkdf: HkdfSha512::new(salt, ikm),
        }
    }

    /// Derive a 32-byte key with the given info string
    pub fn derive(&self, info: &[u8]) -> Result<SymmetricKey> {
        let mut output = [0u8; 32];
        self.hkdf
            .expand(info, &mut output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;
        Ok(SymmetricKey(output))
    }
}

/// Derive a new root key and chain key from the current root key and a DH output
pub fn kdf_root_chain(root_key: &RootKey, dh_output: &[u8; 32]) -> Result<(RootKey, ChainKey)> {
    let kdf = KeyDerivationContext::new(Some(root_key.as_bytes()), dh_output);
    let new_root_key = kdf.derive(domain::ROOT_KEY)?;
    let chain_key = kdf.derive(domain::CHAIN_KEY)?;
    Ok((new_root_key, chain_key))
}

/// Advance a chain by one step
///
/// Returns `(next_chain_key, message_key)`.
pub fn kdf_chain_step(chain_key: &ChainKey) -> (ChainKey, MessageKey) {
    let message_key = hmac_derive(chain_key.as_bytes(), MESSAGE_KEY_SEED);
    let next_chain_key = hmac_derive(chain_key.as_bytes(), CHAIN_KEY_SEED);
    (SymmetricKey(next_chain_key), SymmetricKey(message_key))
}

fn hmac_derive(key: &[u8; 32], seed: u8) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(&[seed]);
    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}
