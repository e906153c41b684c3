//! Bounded cache of skipped message keys
//!
//! Keys are indexed by `(ratchet key, message number)` and evicted
//! oldest-first once the store is full. A key is deleted as soon as it is
//! consumed.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::kdf::MessageKey;
use crate::keys::PublicKeyBytes;

/// Index of a skipped message key
pub type SkippedKeyId = (PublicKeyBytes, u32);

/// Skipped message keys for one ratchet session
#[derive(Clone, Debug)]
pub struct SkippedKeyStore {
    keys: HashMap<SkippedKeyId, MessageKey>,
    order: VecDeque<SkippedKeyId>,
    capacity: usize,
}

impl SkippedKeyStore {
    /// Create an empty store holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Look up a key without consuming it
    pub fn get(&self, ratchet_key: &PublicKeyBytes, message_number: u32) -> Option<&MessageKey> {
        self.keys.get(&(*ratchet_key, message_number))
    }

    /// Whether a key is cached
    pub fn contains(&self, ratchet_key: &PublicKeyBytes, message_number: u32) -> bool {
        self.keys.contains_key(&(*ratchet_key, message_number))
    }

    /// Remove and return a key
    pub fn take(&mut self, ratchet_key: &PublicKeyBytes, message_number: u32) -> Option<MessageKey> {
        let id = (*ratchet_key, message_number);
        let key = self.keys.remove(&id)?;
        self.order.retain(|entry| entry != &id);
        Some(key)
    }

    /// Insert a key, evicting the oldest entries if the store is full
    pub fn insert(&mut self, ratchet_key: PublicKeyBytes, message_number: u32, key: MessageKey) {
        if self.capacity == 0 {
            return;
        }
        let id = (ratchet_key, message_number);
        if self.keys.insert(id, key).is_none() {
            self.order.push_back(id);
        }
        while self.keys.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.keys.remove(&oldest);
                    debug!(
                        "Evicted skipped key {}#{}",
                        oldest.0.short_hex(),
                        oldest.1
                    );
                }
                None => break,
            }
        }
    }

    /// Move every key of `other` into this store, oldest first
    pub fn absorb(&mut self, other: SkippedKeyStore) {
        let SkippedKeyStore {
            mut keys, order, ..
        } = other;
        for id in order {
            if let Some(key) = keys.remove(&id) {
                self.insert(id.0, id.1, key);
            }
        }
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&SkippedKeyId, &MessageKey)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.keys.get(id).map(|key| (id, key)))
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Maximum number of keys held
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
