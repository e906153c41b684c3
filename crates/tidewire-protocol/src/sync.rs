//! Multi-device session sync
//!
//! Every device of a user publishes its session events to the user's other
//! devices. Session records and recall flags are last-write-wins keyed on
//! `(timestamp, device)`. Clocks are not synchronized across devices, so two
//! concurrent edits resolve by wall clock and one of them is silently lost.
//!
//! A session record carries the session id, the chain counters of the
//! publishing device and free-form metadata. Links publish it on their own
//! whenever a session is established, confirmed or reset.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tidewire_core::{DeviceId, MessageId, PeerAddress, SessionId, Timestamp, UserId};
use tidewire_crypto::ratchet::ChainCounters;

use crate::error::{ProtocolError, Result};
use crate::receipts::{ReceiptKind, ReceiptTracker};

/// Session events shared between a user's devices
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionSyncEvent {
    /// State of one session, replaced as a whole
    SessionMetadata {
        /// Session the record describes
        session_id: SessionId,
        /// Conversation peer
        peer: PeerAddress,
        /// Chain counters on the publishing device; `None` once it has no
        /// live session
        counters: Option<ChainCounters>,
        /// Per-conversation settings
        metadata: BTreeMap<String, String>,
    },
    /// A message sent or received on another device
    Message {
        /// Conversation peer
        peer: PeerAddress,
        /// Message
        message_id: MessageId,
        /// Body
        body: Vec<u8>,
        /// True if the origin device sent it
        outgoing: bool,
    },
    /// A receipt observed on another device
    ReadStatus {
        /// Message
        message_id: MessageId,
        /// Receipt kind
        kind: ReceiptKind,
        /// When it happened
        at: Timestamp,
    },
    /// A message was recalled or un-recalled
    RecallStatus {
        /// Message
        message_id: MessageId,
        /// Recall flag
        recalled: bool,
    },
}

/// A sync event tagged with its origin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Device that produced the event
    pub origin: DeviceId,
    /// Origin clock when it was produced
    pub timestamp: Timestamp,
    /// The event
    pub event: SessionSyncEvent,
}

/// Result of applying a received envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// State was updated
    Applied,
    /// Older than what is already known
    Stale,
    /// From this device or an unregistered one
    Ignored,
    /// A message for the caller to surface
    Message {
        /// Conversation peer
        peer: PeerAddress,
        /// Message
        message_id: MessageId,
        /// Body
        body: Vec<u8>,
        /// True if the origin device sent it
        outgoing: bool,
    },
}

/// Last known state of one session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionRecord {
    /// Conversation peer
    pub peer: Option<PeerAddress>,
    /// Chain counters on the device that wrote the record
    pub counters: Option<ChainCounters>,
    /// Per-conversation settings
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
struct Versioned<T> {
    timestamp: Timestamp,
    device: DeviceId,
    value: T,
}

impl<T> Versioned<T> {
    fn is_older_than(&self, timestamp: Timestamp, device: &DeviceId) -> bool {
        (self.timestamp, &self.device) < (timestamp, device)
    }
}

/// Keeps a user's devices in sync
pub struct SessionSyncCoordinator {
    user_id: UserId,
    local_device: DeviceId,
    devices: RwLock<BTreeSet<DeviceId>>,
    receipts: Arc<ReceiptTracker>,
    outbound: mpsc::Sender<(DeviceId, SyncEnvelope)>,
    sessions: DashMap<SessionId, Versioned<SessionRecord>>,
    recalls: DashMap<MessageId, Versioned<bool>>,
    /// Unix millis of the last envelope stamped here
    last_stamp: Mutex<i64>,
}

impl SessionSyncCoordinator {
    /// Create a coordinator for `local_device`
    ///
    /// Envelopes for other devices are written to `outbound`; the caller
    /// routes them over the encrypted link to each device.
    pub fn new(
        user_id: UserId,
        local_device: DeviceId,
        receipts: Arc<ReceiptTracker>,
        outbound: mpsc::Sender<(DeviceId, SyncEnvelope)>,
    ) -> Self {
        let mut devices = BTreeSet::new();
        devices.insert(local_device.clone());
        Self {
            user_id,
            local_device,
            devices: RwLock::new(devices),
            receipts,
            outbound,
            sessions: DashMap::new(),
            recalls: DashMap::new(),
            last_stamp: Mutex::new(i64::MIN),
        }
    }

    /// User the devices belong to
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Add a device of the user
    pub fn register_device(&self, device: DeviceId) {
        if self.devices.write().insert(device.clone()) {
            debug!("Registered sync device {}", device);
        }
    }

    /// Remove a device of the user
    pub fn unregister_device(&self, device: &DeviceId) {
        self.devices.write().remove(device);
    }

    /// Registered devices, including this one
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.read().iter().cloned().collect()
    }

    /// Publish an event stamped with the current time
    ///
    /// Stamps from one device strictly increase, so two events published
    /// within the same millisecond still apply in order.
    pub async fn publish(&self, event: SessionSyncEvent) -> Result<SyncEnvelope> {
        let timestamp = {
            let mut last = self.last_stamp.lock();
            *last = Timestamp::now().as_millis().max(last.saturating_add(1));
            Timestamp::from_millis(*last)
        };
        self.publish_at(event, timestamp).await
    }

    /// Publish an event with an explicit timestamp
    ///
    /// The event is applied locally and sent to every other device.
    pub async fn publish_at(
        &self,
        event: SessionSyncEvent,
        timestamp: Timestamp,
    ) -> Result<SyncEnvelope> {
        let envelope = SyncEnvelope {
            origin: self.local_device.clone(),
            timestamp,
            event,
        };
        self.apply(&envelope).await?;

        let targets: Vec<DeviceId> = self
            .devices
            .read()
            .iter()
            .filter(|device| **device != self.local_device)
            .cloned()
            .collect();
        for device in targets {
            self.outbound
                .send((device, envelope.clone()))
                .await
                .map_err(|_| ProtocolError::ChannelClosed("sync outbound"))?;
        }
        Ok(envelope)
    }

    /// Publish the session state with `peer`, keeping its current metadata
    pub async fn publish_session(
        &self,
        peer: &PeerAddress,
        counters: Option<ChainCounters>,
    ) -> Result<SyncEnvelope> {
        let session_id = SessionId::for_peer(peer);
        let metadata = self
            .sessions
            .get(&session_id)
            .map(|slot| slot.value.metadata.clone())
            .unwrap_or_default();
        self.publish(SessionSyncEvent::SessionMetadata {
            session_id,
            peer: peer.clone(),
            counters,
            metadata,
        })
        .await
    }

    /// Publish new settings for the conversation with `peer`, keeping the
    /// last known counters
    pub async fn publish_metadata(
        &self,
        peer: &PeerAddress,
        metadata: BTreeMap<String, String>,
    ) -> Result<SyncEnvelope> {
        let session_id = SessionId::for_peer(peer);
        let counters = self
            .sessions
            .get(&session_id)
            .and_then(|slot| slot.value.counters);
        self.publish(SessionSyncEvent::SessionMetadata {
            session_id,
            peer: peer.clone(),
            counters,
            metadata,
        })
        .await
    }

    /// Apply an envelope from another device
    pub async fn receive(&self, envelope: SyncEnvelope) -> Result<SyncOutcome> {
        if envelope.origin == self.local_device {
            debug!("Ignoring sync event from this device");
            return Ok(SyncOutcome::Ignored);
        }
        if !self.devices.read().contains(&envelope.origin) {
            warn!("Ignoring sync event from unregistered device {}", envelope.origin);
            return Ok(SyncOutcome::Ignored);
        }
        self.apply(&envelope).await
    }

    async fn apply(&self, envelope: &SyncEnvelope) -> Result<SyncOutcome> {
        let SyncEnvelope {
            origin,
            timestamp,
            event,
        } = envelope;

        match event {
            SessionSyncEvent::SessionMetadata {
                session_id,
                peer,
                counters,
                metadata,
            } => {
                let mut slot = self
                    .sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| Versioned {
                        timestamp: Timestamp::from_millis(i64::MIN),
                        device: origin.clone(),
                        value: SessionRecord::default(),
                    });
                if !slot.is_older_than(*timestamp, origin) {
                    debug!(
                        "Stale record for session {} from {} (last write wins)",
                        session_id, origin
                    );
                    return Ok(SyncOutcome::Stale);
                }
                *slot = Versioned {
                    timestamp: *timestamp,
                    device: origin.clone(),
                    value: SessionRecord {
                        peer: Some(peer.clone()),
                        counters: *counters,
                        metadata: metadata.clone(),
                    },
                };
                Ok(SyncOutcome::Applied)
            }
            SessionSyncEvent::RecallStatus {
                message_id,
                recalled,
            } => {
                if let Some(current) = self.recalls.get(message_id) {
                    if !current.is_older_than(*timestamp, origin) {
                        return Ok(SyncOutcome::Stale);
                    }
                }
                self.recalls.insert(
                    *message_id,
                    Versioned {
                        timestamp: *timestamp,
                        device: origin.clone(),
                        value: *recalled,
                    },
                );
                Ok(SyncOutcome::Applied)
            }
            SessionSyncEvent::ReadStatus {
                message_id,
                kind,
                at,
            } => {
                self.receipts.record(*message_id, *kind, *at).await?;
                Ok(SyncOutcome::Applied)
            }
            SessionSyncEvent::Message {
                peer,
                message_id,
                body,
                outgoing,
            } => {
                if *origin == self.local_device {
                    return Ok(SyncOutcome::Applied);
                }
                Ok(SyncOutcome::Message {
                    peer: peer.clone(),
                    message_id: *message_id,
                    body: body.clone(),
                    outgoing: *outgoing,
                })
            }
        }
    }

    /// Current metadata of a conversation
    pub fn metadata(&self, peer: &PeerAddress) -> Option<BTreeMap<String, String>> {
        self.session(&SessionId::for_peer(peer))
            .map(|record| record.metadata)
    }

    /// Last known record of a session
    pub fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|slot| slot.value.clone())
    }

    /// Whether a message is recalled
    pub fn is_recalled(&self, message_id: &MessageId) -> bool {
        self.recalls
            .get(message_id)
            .map(|slot| slot.value)
            .unwrap_or(false)
    }
}
