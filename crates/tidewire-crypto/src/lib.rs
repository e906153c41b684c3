//! # Tidewire Cryptographic Core
//!
//! Forward-secret session cryptography for the Tidewire messaging layer.
//!
//! ## Core Components
//!
//! - [`kdf`] and [`aead`]: stateless primitives (HKDF/HMAC chains, XChaCha20-Poly1305)
//! - [`identity`] and [`keys`]: long-term identity keys, X25519 pairs, pre-key bundles
//! - [`x3dh`]: the handshake that turns a pre-key bundle into a session
//! - [`ratchet`]: the Double Ratchet session
//! - [`skipped`]: bounded store of keys for out-of-order messages

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod skipped;
pub mod x3dh;

pub use error::{CryptoError, Result};

/// Maximum plaintext size accepted by the AEAD layer (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{CryptoError, Result};
    pub use crate::identity::{IdentityKeyPair, IdentityPublicKey};
    pub use crate::keys::{KeyPair, PreKeyBundle, PreKeyUpload, PublicKeyBytes, SignedPreKey};
    pub use crate::ratchet::{
        ChainCounters, MessageHeader, RatchetLimits, RatchetMessage, RatchetSession,
    };
    pub use crate::x3dh::{HandshakeEngine, HandshakeInit, PreKeyManager};
}
