//! Per-message receipt status
//!
//! Receipts can arrive in any order. The first timestamp set for each flag
//! wins, READ implies DELIVERED, and the read time is never earlier than the
//! delivery time.
//!
//! Only the most recently tracked messages stay in memory. With a store
//! attached, an evicted status is reloaded before the next receipt for it is
//! applied.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use tidewire_core::storage::ReceiptStore;
use tidewire_core::{MessageId, Timestamp};

use crate::error::Result;

/// Messages whose status is kept in memory by default
pub const DEFAULT_RECEIPT_CAPACITY: usize = 10_000;

/// Receipt kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptKind {
    /// Reached the recipient device
    Delivered,
    /// Displayed to the recipient
    Read,
    /// Media played
    Played,
    /// Recipient took a screenshot
    Screenshot,
}

/// Accumulated receipts of one message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptStatus {
    /// Delivered flag
    pub delivered: bool,
    /// First delivery time
    pub delivered_at: Option<Timestamp>,
    /// Read flag
    pub read: bool,
    /// First read time
    pub read_at: Option<Timestamp>,
    /// Played flag
    pub played: bool,
    /// First play time
    pub played_at: Option<Timestamp>,
    /// Screenshot flag
    pub screenshot: bool,
    /// First screenshot time
    pub screenshot_at: Option<Timestamp>,
}

impl ReceiptStatus {
    /// Apply a receipt, returning whether anything changed
    pub fn apply(&mut self, kind: ReceiptKind, at: Timestamp) -> bool {
        match kind {
            ReceiptKind::Delivered => {
                if self.delivered {
                    return false;
                }
                self.delivered = true;
                self.delivered_at = Some(at);
                true
            }
            ReceiptKind::Read => {
                if self.read {
                    return false;
                }
                if !self.delivered {
                    self.delivered = true;
                    self.delivered_at = Some(at);
                }
                self.read = true;
                self.read_at = Some(match self.delivered_at {
                    Some(delivered_at) => at.max(delivered_at),
                    None => at,
                });
                true
            }
            ReceiptKind::Played => set_once(&mut self.played, &mut self.played_at, at),
            ReceiptKind::Screenshot => {
                set_once(&mut self.screenshot, &mut self.screenshot_at, at)
            }
        }
    }
}

fn set_once(flag: &mut bool, at_slot: &mut Option<Timestamp>, at: Timestamp) -> bool {
    if *flag {
        return false;
    }
    *flag = true;
    *at_slot = Some(at);
    true
}

/// Receipt status of recently tracked messages
pub struct ReceiptTracker {
    statuses: DashMap<MessageId, ReceiptStatus>,
    /// Tracked ids, oldest first
    order: Mutex<VecDeque<MessageId>>,
    capacity: usize,
    store: Option<Arc<dyn ReceiptStore>>,
}

impl Default for ReceiptTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECEIPT_CAPACITY)
    }
}

impl ReceiptTracker {
    /// Create an in-memory tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an in-memory tracker holding at most `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            store: None,
        }
    }

    /// Create a tracker persisting to `store`, loading what it holds
    pub async fn with_store(store: Arc<dyn ReceiptStore>) -> Result<Self> {
        let mut tracker = Self::new();
        for (message_id, blob) in store.load_all_receipts().await? {
            let status: ReceiptStatus = bincode::deserialize(&blob)?;
            tracker.insert(message_id, status);
        }
        debug!("Loaded {} receipts", tracker.len());
        tracker.store = Some(store);
        Ok(tracker)
    }

    fn insert(&self, message_id: MessageId, status: ReceiptStatus) {
        if self.statuses.insert(message_id, status).is_none() {
            self.remember(message_id);
        }
    }

    fn remember(&self, message_id: MessageId) {
        let mut order = self.order.lock();
        order.push_back(message_id);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }

    /// Apply a receipt in memory and return the resulting status
    pub fn apply(&self, message_id: MessageId, kind: ReceiptKind, at: Timestamp) -> ReceiptStatus {
        let mut created = false;
        let status = {
            let mut status = self.statuses.entry(message_id).or_insert_with(|| {
                created = true;
                ReceiptStatus::default()
            });
            if status.apply(kind, at) {
                debug!("Receipt {:?} for {}", kind, message_id.short());
            }
            status.clone()
        };
        if created {
            self.remember(message_id);
        }
        status
    }

    /// Apply a receipt and persist the status if a store is attached
    pub async fn record(
        &self,
        message_id: MessageId,
        kind: ReceiptKind,
        at: Timestamp,
    ) -> Result<ReceiptStatus> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(self.apply(message_id, kind, at)),
        };
        if !self.statuses.contains_key(&message_id) {
            if let Some(blob) = store.load_receipt(&message_id).await? {
                self.insert(message_id, bincode::deserialize(&blob)?);
            }
        }
        let status = self.apply(message_id, kind, at);
        store
            .save_receipt(&message_id, bincode::serialize(&status)?)
            .await?;
        Ok(status)
    }

    /// Current status of a message, if still in memory
    pub fn status(&self, message_id: &MessageId) -> Option<ReceiptStatus> {
        self.statuses.get(message_id).map(|status| status.clone())
    }

    /// Number of messages in memory
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}
