//! Duplicate filter for fragments and acks
//!
//! Remembers what was seen for a time window, bounded in size. Keys are
//! kept in insertion order as well, so expired entries and, when full, the
//! oldest entry are found at the front without scanning.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use tidewire_core::MessageId;

use crate::config::FragmentConfig;

/// Something the filter remembers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// One fragment of a message
    Fragment {
        /// Message
        message_id: MessageId,
        /// Fragment index
        index: u32,
    },
    /// An ack for a message
    Ack {
        /// Acknowledged message
        message_id: MessageId,
    },
    /// A message that was reassembled and decrypted
    Delivered {
        /// Message
        message_id: MessageId,
    },
}

/// Time and size bounded set of seen keys
pub struct DuplicateFilter {
    seen: DashMap<DedupKey, Instant>,
    /// Insertion order; an entry whose time differs from `seen` is stale
    order: Mutex<VecDeque<(DedupKey, Instant)>>,
    window: Duration,
    capacity: usize,
    enabled: bool,
}

impl DuplicateFilter {
    /// Create from config
    pub fn new(config: &FragmentConfig) -> Self {
        Self {
            seen: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            window: config.dedup_window(),
            capacity: config.max_dedup_cache_size.max(1),
            enabled: config.enable_dedup,
        }
    }

    /// Record `key`, returning false if it was already seen within the window
    pub fn check_and_insert(&self, key: DedupKey) -> bool {
        if !self.enabled {
            return true;
        }

        let mut order = self.order.lock();
        let now = Instant::now();
        let previous = self.seen.get(&key).map(|seen_at| *seen_at);
        if let Some(seen_at) = previous {
            if now.duration_since(seen_at) < self.window {
                return false;
            }
        }

        self.make_room(&mut order, now, previous.is_none());
        self.seen.insert(key, now);
        order.push_back((key, now));
        true
    }

    /// Whether `key` was seen within the window
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.enabled
            && self
                .seen
                .get(key)
                .map(|seen_at| seen_at.elapsed() < self.window)
                .unwrap_or(false)
    }

    /// Forget every fragment of a message so a full retransmission is accepted
    pub fn forget_fragments(&self, message_id: &MessageId) {
        self.seen.retain(|key, _| {
            !matches!(key, DedupKey::Fragment { message_id: id, .. } if id == message_id)
        });
    }

    /// Pop expired entries, then the oldest ones while a new key would not fit
    fn make_room(&self, order: &mut VecDeque<(DedupKey, Instant)>, now: Instant, needs_slot: bool) {
        let mut expired = 0;
        let mut evicted = 0;
        while let Some(&(key, seen_at)) = order.front() {
            let live = self.seen.get(&key).map_or(false, |at| *at == seen_at);
            let is_expired = now.duration_since(seen_at) >= self.window;
            let full = needs_slot && self.seen.len() >= self.capacity;
            if live && !is_expired && !full {
                break;
            }
            order.pop_front();
            if live {
                self.seen.remove(&key);
                if is_expired {
                    expired += 1;
                } else {
                    evicted += 1;
                }
            }
        }

        if order.len() > self.capacity * 2 {
            order.retain(|(key, seen_at)| self.seen.get(key).map_or(false, |at| *at == *seen_at));
        }
        if expired + evicted > 0 {
            debug!(
                "Dedup cache dropped {} expired and {} live entries",
                expired, evicted
            );
        }
    }

    /// Number of remembered keys
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True if nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
