//! Double Ratchet sessions
//!
//! A [`RatchetSession`] holds the state for one ordered pair of endpoints.
//! It combines:
//! - **DH ratchet**: a fresh X25519 exchange every time the peer's ratchet
//!   key changes, providing break-in recovery
//! - **Symmetric ratchet**: one-way chain stepping per message, providing
//!   forward secrecy
//!
//! Decryption is transactional. All state changes (DH step, chain walk,
//! newly skipped keys) are staged on a copy and committed only after the
//! AEAD tag verifies, so a forged or corrupted message never advances the
//! session.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::aead;
use crate::error::{CryptoError, Result};
use crate::kdf::{kdf_chain_step, kdf_root_chain, ChainKey, MessageKey, RootKey, SymmetricKey};
use crate::keys::{KeyPair, PublicKeyBytes};
use crate::skipped::SkippedKeyStore;

/// Encoded header size: ratchet key, previous chain length, message number
pub const HEADER_SIZE: usize = 32 + 4 + 4;

/// Default bound on skipped message keys (store size and single gap)
pub const DEFAULT_MAX_SKIPPED_MESSAGE_KEYS: u32 = 1000;

/// Receiving ratchet keys remembered after they are replaced
const MAX_RETIRED_RATCHET_KEYS: usize = 16;

const SNAPSHOT_VERSION: u8 = 1;

/// Per-session limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Maximum number of cached skipped keys, and maximum gap within one chain
    pub max_skipped_message_keys: u32,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skipped_message_keys: DEFAULT_MAX_SKIPPED_MESSAGE_KEYS,
        }
    }
}

/// Cleartext header of a ratchet message, bound into the AEAD associated data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKeyBytes,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Message number in the current sending chain
    pub message_number: u32,
}

impl MessageHeader {
    /// Fixed 40-byte encoding (big-endian counters)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(self.ratchet_key.as_bytes());
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        out
    }

    /// Parse the fixed encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(CryptoError::Malformed(format!(
                "header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        let ratchet_key = PublicKeyBytes(key);
        let mut prev = [0u8; 4];
        prev.copy_from_slice(&bytes[32..36]);
        let mut number = [0u8; 4];
        number.copy_from_slice(&bytes[36..40]);
        Ok(Self {
            ratchet_key,
            previous_chain_length: u32::from_be_bytes(prev),
            message_number: u32::from_be_bytes(number),
        })
    }
}

/// Encrypted message with its header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Cleartext header
    pub header: MessageHeader,
    /// `nonce || ciphertext || tag`
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Encode as `header || ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from `header || ciphertext`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CryptoError::Malformed(format!(
                "ratchet message too short: {} bytes",
                bytes.len()
            )));
        }
        let (header, ciphertext) = bytes.split_at(HEADER_SIZE);
        Ok(Self {
            header: MessageHeader::from_bytes(header)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

#[derive(Clone)]
struct Chain {
    key: ChainKey,
    counter: u32,
}

impl Chain {
    fn new(key: ChainKey) -> Self {
        Self { key, counter: 0 }
    }

    /// Derive the key for `counter` and advance
    fn step(&mut self) -> MessageKey {
        let (next, message_key) = kdf_chain_step(&self.key);
        self.key = next;
        self.counter += 1;
        message_key
    }
}

/// Ratchet state, mutated only through [`RatchetSession`]
#[derive(Clone)]
struct RatchetState {
    root_key: RootKey,
    sending_chain: Option<Chain>,
    receiving_chain: Option<Chain>,
    sending_ratchet: KeyPair,
    receiving_ratchet_key: Option<PublicKeyBytes>,
    previous_sending_chain_length: u32,
    retired_ratchet_keys: VecDeque<PublicKeyBytes>,
}

impl RatchetState {
    /// DH ratchet step on receipt of a new peer ratchet key
    fn dh_ratchet_step(&mut self, their_ratchet_key: &PublicKeyBytes) -> Result<()> {
        self.previous_sending_chain_length =
            self.sending_chain.as_ref().map_or(0, |chain| chain.counter);

        if let Some(old) = self.receiving_ratchet_key.replace(*their_ratchet_key) {
            self.retired_ratchet_keys.push_back(old);
            if self.retired_ratchet_keys.len() > MAX_RETIRED_RATCHET_KEYS {
                self.retired_ratchet_keys.pop_front();
            }
        }

        let dh_recv = self.sending_ratchet.dh(their_ratchet_key);
        let (root_key, receiving_key) = kdf_root_chain(&self.root_key, dh_recv.as_bytes())?;

        // Replacing the pair drops (and zeroizes) the previous secret
        self.sending_ratchet = KeyPair::generate();
        let dh_send = self.sending_ratchet.dh(their_ratchet_key);
        let (root_key, sending_key) = kdf_root_chain(&root_key, dh_send.as_bytes())?;

        self.root_key = root_key;
        self.receiving_chain = Some(Chain::new(receiving_key));
        self.sending_chain = Some(Chain::new(sending_key));

        debug!(
            "DH ratchet step: peer key {}, new sending key {}",
            their_ratchet_key.short_hex(),
            self.sending_ratchet.public_key().short_hex()
        );
        Ok(())
    }

    /// Walk the receiving chain up to `until`, caching intermediate keys
    fn skip_message_keys(&mut self, staged: &mut SkippedKeyStore, until: u32, max_skip: u32) -> Result<()> {
        let (Some(chain), Some(ratchet_key)) =
            (self.receiving_chain.as_mut(), self.receiving_ratchet_key)
        else {
            return Ok(());
        };

        if until <= chain.counter {
            return Ok(());
        }
        let gap = until - chain.counter;
        if gap > max_skip {
            return Err(CryptoError::TooManySkippedMessages { gap, max: max_skip });
        }

        while chain.counter < until {
            let number = chain.counter;
            let key = chain.step();
            staged.insert(ratchet_key, number, key);
        }
        Ok(())
    }
}

/// Position of a session's chains, shared with the user's other devices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCounters {
    /// Messages sent on the current sending chain
    pub sending: u32,
    /// Messages received on the current receiving chain
    pub receiving: u32,
    /// Length of the previous sending chain
    pub previous_sending: u32,
}

/// Double Ratchet session for one (local, peer) pair
pub struct RatchetSession {
    state: RatchetState,
    skipped: SkippedKeyStore,
    limits: RatchetLimits,
}

impl RatchetSession {
    /// Initialize the handshake initiator
    ///
    /// `sending_ratchet` is the handshake ephemeral pair and
    /// `their_ratchet_key` the responder's signed prekey. The first sending
    /// chain is derived immediately.
    pub fn new_initiator(
        shared_secret: RootKey,
        sending_ratchet: KeyPair,
        their_ratchet_key: PublicKeyBytes,
        limits: RatchetLimits,
    ) -> Result<Self> {
        let dh = sending_ratchet.dh(&their_ratchet_key);
        let (root_key, sending_key) = kdf_root_chain(&shared_secret, dh.as_bytes())?;

        Ok(Self {
            state: RatchetState {
                root_key,
                sending_chain: Some(Chain::new(sending_key)),
                receiving_chain: None,
                sending_ratchet,
                receiving_ratchet_key: Some(their_ratchet_key),
                previous_sending_chain_length: 0,
                retired_ratchet_keys: VecDeque::new(),
            },
            skipped: SkippedKeyStore::new(limits.max_skipped_message_keys as usize),
            limits,
        })
    }

    /// Initialize the handshake responder
    ///
    /// The responder has no chains until the first inbound message triggers
    /// a DH ratchet step.
    pub fn new_responder(shared_secret: RootKey, signed_prekey: KeyPair, limits: RatchetLimits) -> Self {
        Self {
            state: RatchetState {
                root_key: shared_secret,
                sending_chain: None,
                receiving_chain: None,
                sending_ratchet: signed_prekey,
                receiving_ratchet_key: None,
                previous_sending_chain_length: 0,
                retired_ratchet_keys: VecDeque::new(),
            },
            skipped: SkippedKeyStore::new(limits.max_skipped_message_keys as usize),
            limits,
        }
    }

    /// Encrypt a message on the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let ratchet_key = self.state.sending_ratchet.public_key();
        let previous_chain_length = self.state.previous_sending_chain_length;
        let chain = self
            .state
            .sending_chain
            .as_ref()
            .ok_or(CryptoError::SessionNotEstablished)?;

        let header = MessageHeader {
            ratchet_key,
            previous_chain_length,
            message_number: chain.counter,
        };
        let (next_key, message_key) = kdf_chain_step(&chain.key);
        let ciphertext = aead::encrypt(&message_key, plaintext, &header.to_bytes())?;

        if let Some(chain) = self.state.sending_chain.as_mut() {
            chain.key = next_key;
            chain.counter += 1;
        }
        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypt a message, advancing the session only on success
    #[instrument(skip_all, fields(ratchet_key = %message.header.ratchet_key.short_hex(), n = message.header.message_number))]
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let header = &message.header;
        let associated_data = header.to_bytes();

        if let Some(key) = self.skipped.get(&header.ratchet_key, header.message_number) {
            let plaintext = aead::decrypt(key, &message.ciphertext, &associated_data)
                .map_err(|e| log_auth_failure(e, header))?;
            self.skipped.take(&header.ratchet_key, header.message_number);
            debug!("Decrypted with skipped key ({} left)", self.skipped.len());
            return Ok(plaintext);
        }

        if self.state.receiving_ratchet_key != Some(header.ratchet_key)
            && self.state.retired_ratchet_keys.contains(&header.ratchet_key)
        {
            return Err(duplicate(header));
        }

        let max_skip = self.limits.max_skipped_message_keys;
        let mut state = self.state.clone();
        let mut staged = SkippedKeyStore::new(self.skipped.capacity());

        if state.receiving_ratchet_key != Some(header.ratchet_key) {
            state.skip_message_keys(&mut staged, header.previous_chain_length, max_skip)?;
            state.dh_ratchet_step(&header.ratchet_key)?;
        }

        let counter = match state.receiving_chain.as_ref() {
            Some(chain) => chain.counter,
            None => return Err(duplicate(header)),
        };
        if header.message_number < counter {
            return Err(duplicate(header));
        }

        state.skip_message_keys(&mut staged, header.message_number, max_skip)?;
        let message_key = match state.receiving_chain.as_mut() {
            Some(chain) => chain.step(),
            None => return Err(duplicate(header)),
        };

        let plaintext = aead::decrypt(&message_key, &message.ciphertext, &associated_data)
            .map_err(|e| log_auth_failure(e, header))?;

        self.state = state;
        self.skipped.absorb(staged);
        Ok(plaintext)
    }

    /// Current sending ratchet public key
    pub fn sending_ratchet_key(&self) -> PublicKeyBytes {
        self.state.sending_ratchet.public_key()
    }

    /// Whether the session can encrypt
    pub fn can_send(&self) -> bool {
        self.state.sending_chain.is_some()
    }

    /// Whether at least one inbound message has been decrypted
    pub fn has_received(&self) -> bool {
        self.state.receiving_chain.is_some()
    }

    /// Current chain positions
    pub fn chain_counters(&self) -> ChainCounters {
        ChainCounters {
            sending: self.state.sending_chain.as_ref().map_or(0, |c| c.counter),
            receiving: self.state.receiving_chain.as_ref().map_or(0, |c| c.counter),
            previous_sending: self.state.previous_sending_chain_length,
        }
    }

    /// Number of cached skipped keys
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Session limits
    pub fn limits(&self) -> RatchetLimits {
        self.limits
    }

    /// Export the full state as an opaque blob
    ///
    /// The blob contains secret key material. At-rest protection is the
    /// persistence layer's job.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let state = &self.state;
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            root_key: *state.root_key.as_bytes(),
            sending_chain: state.sending_chain.as_ref().map(ChainSnapshot::from),
            receiving_chain: state.receiving_chain.as_ref().map(ChainSnapshot::from),
            sending_ratchet_secret: state.sending_ratchet.secret_bytes(),
            receiving_ratchet_key: state.receiving_ratchet_key,
            previous_sending_chain_length: state.previous_sending_chain_length,
            retired_ratchet_keys: state.retired_ratchet_keys.iter().copied().collect(),
            skipped: self
                .skipped
                .iter()
                .map(|((key, n), mk)| (*key, *n, *mk.as_bytes()))
                .collect(),
            max_skipped_message_keys: self.limits.max_skipped_message_keys,
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    /// Rebuild a session from [`snapshot`](Self::snapshot) output
    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let snapshot: SessionSnapshot = bincode::deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let limits = RatchetLimits {
            max_skipped_message_keys: snapshot.max_skipped_message_keys,
        };
        let mut skipped = SkippedKeyStore::new(limits.max_skipped_message_keys as usize);
        for (key, n, mk) in &snapshot.skipped {
            skipped.insert(*key, *n, SymmetricKey::from_bytes(*mk));
        }

        Ok(Self {
            state: RatchetState {
                root_key: SymmetricKey::from_bytes(snapshot.root_key),
                sending_chain: snapshot.sending_chain.as_ref().map(Chain::from),
                receiving_chain: snapshot.receiving_chain.as_ref().map(Chain::from),
                sending_ratchet: KeyPair::from_secret_bytes(snapshot.sending_ratchet_secret),
                receiving_ratchet_key: snapshot.receiving_ratchet_key,
                previous_sending_chain_length: snapshot.previous_sending_chain_length,
                retired_ratchet_keys: snapshot.retired_ratchet_keys.iter().copied().collect(),
            },
            skipped,
            limits,
        })
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("sending_ratchet_key", &self.sending_ratchet_key())
            .field("receiving_ratchet_key", &self.state.receiving_ratchet_key)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

fn duplicate(header: &MessageHeader) -> CryptoError {
    CryptoError::DuplicateOrUnknownMessage {
        ratchet_key: header.ratchet_key.short_hex(),
        message_number: header.message_number,
    }
}

fn log_auth_failure(err: CryptoError, header: &MessageHeader) -> CryptoError {
    warn!(
        "Authentication failed for {}#{}: possible tampering or replay",
        header.ratchet_key.short_hex(),
        header.message_number
    );
    err
}

#[derive(Serialize, Deserialize)]
struct ChainSnapshot {
    key: [u8; 32],
    counter: u32,
}

impl From<&Chain> for ChainSnapshot {
    fn from(chain: &Chain) -> Self {
        Self {
            key: *chain.key.as_bytes(),
            counter: chain.counter,
        }
    }
}

impl From<&ChainSnapshot> for Chain {
    fn from(snapshot: &ChainSnapshot) -> Self {
        Self {
            key: SymmetricKey::from_bytes(snapshot.key),
            counter: snapshot.counter,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    version: u8,
    root_key: [u8; 32],
    sending_chain: Option<ChainSnapshot>,
    receiving_chain: Option<ChainSnapshot>,
    sending_ratchet_secret: [u8; 32],
    receiving_ratchet_key: Option<PublicKeyBytes>,
    previous_sending_chain_length: u32,
    retired_ratchet_keys: Vec<PublicKeyBytes>,
    skipped: Vec<(PublicKeyBytes, u32, [u8; 32])>,
    max_skipped_message_keys: u32,
}
