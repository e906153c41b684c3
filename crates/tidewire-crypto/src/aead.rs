//! Authenticated Encryption with Associated Data (AEAD)
//!
//! Message bodies are sealed with XChaCha20-Poly1305. The 24-byte random
//! nonce is prefixed to the ciphertext, so the wire form is
//! `nonce || ciphertext || tag`.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::error::{CryptoError, Result};
use crate::kdf::MessageKey;
use crate::MAX_MESSAGE_SIZE;

/// Nonce size for XChaCha20-Poly1305 (192 bits)
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Seal `plaintext` under `key`, authenticating `associated_data`
pub fn encrypt(key: &MessageKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() > MAX_MESSAGE_SIZE {
        return Err(CryptoError::MessageTooLarge {
            size: plaintext.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed("XChaCha20-Poly1305 failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a ciphertext produced by [`encrypt`]
///
/// Any tampering with the nonce, body, tag or associated data yields
/// [`CryptoError::AuthenticationFailed`].
pub fn decrypt(key: &MessageKey, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }
    let (nonce, body) = ciphertext.split_at(NONCE_SIZE);

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
