//! Peer link
//!
//! A [`PeerLink`] carries application payloads to one remote device. It
//! seals each payload with the session manager, splits it into fragment
//! frames and hands them to the connection supervisor. Inbound frames go
//! the opposite way through the duplicate filter, the reassembler and the
//! session. A background task turns ack, nack, retry and reassembly
//! deadline notifications into frames and reports everything the caller
//! needs as [`LinkEvent`]s.
//!
//! With a [`SessionSyncCoordinator`] attached, the link publishes the
//! session record whenever the session is established, confirmed or reset,
//! and every receipt that changes a message's status.

use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use tidewire_core::{MessageId, PeerAddress, Timestamp};

use crate::config::ProtocolConfig;
use crate::dedup::{DedupKey, DuplicateFilter};
use crate::delivery::{AckBatcher, DeliveryEvent, DeliveryState, DeliveryTracker};
use crate::error::{Disposition, ProtocolError, Result};
use crate::fragment::{Fragment, Fragmenter, Reassembler, ReassemblyEvent};
use crate::receipts::{ReceiptKind, ReceiptStatus, ReceiptTracker};
use crate::session_manager::SessionManager;
use crate::supervisor::{
    ConnectionState, ConnectionSupervisor, FrameKey, OfflineQueue, SendOutcome, SupervisorEvent,
};
use crate::sync::{SessionSyncCoordinator, SessionSyncEvent, SyncEnvelope};
use crate::transport::Connector;
use crate::wire::{AppPayload, Frame, SealedMessage};

/// Notifications for the application
#[derive(Debug)]
pub enum LinkEvent {
    /// A message from the peer
    Message {
        /// Message id
        id: MessageId,
        /// Body
        body: Vec<u8>,
        /// Sender clock at send time
        sent_at: Timestamp,
    },
    /// The peer sent a receipt for one of our messages
    Receipt {
        /// Our message
        id: MessageId,
        /// Receipt kind
        kind: ReceiptKind,
        /// Accumulated status after applying it
        status: ReceiptStatus,
    },
    /// The peer acknowledged one of our payloads
    Delivered {
        /// Acknowledged payload
        id: MessageId,
    },
    /// A payload was never acknowledged
    DeliveryFailed {
        /// Undelivered payload
        id: MessageId,
        /// Why
        error: ProtocolError,
    },
    /// A sync envelope from another device of the same user
    Sync(SyncEnvelope),
    /// The session was discarded; the next send re-handshakes
    SessionReset {
        /// Remote peer
        peer: PeerAddress,
    },
    /// Connection state changed
    ConnectionState(ConnectionState),
    /// Queued messages were discarded for age and will not be delivered
    QueueExpired {
        /// Messages discarded
        count: usize,
        /// Their ids, oldest first
        message_ids: Vec<MessageId>,
    },
    /// A failure the application should see
    Error(ProtocolError),
}

struct LinkInner {
    peer: PeerAddress,
    config: ProtocolConfig,
    sessions: Arc<SessionManager>,
    supervisor: ConnectionSupervisor,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    dedup: DuplicateFilter,
    tracker: DeliveryTracker,
    batcher: Option<AckBatcher>,
    receipts: Arc<ReceiptTracker>,
    /// Application messages awaiting an ack, as opposed to receipts and sync
    messages: DashSet<MessageId>,
    outbound: mpsc::Sender<(Option<FrameKey>, Vec<u8>)>,
    events: mpsc::Sender<LinkEvent>,
    sync: OnceLock<Arc<SessionSyncCoordinator>>,
    /// Session generation last published to the other devices
    synced_generation: AtomicU64,
}

/// Reliable encrypted link to one peer device
pub struct PeerLink {
    inner: Arc<LinkInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerLink {
    /// Spawn a link to `peer` and return the receiver of its events
    ///
    /// The link starts disconnected; call [`connect`](Self::connect).
    /// Frames stashed in `offline` by an earlier link to the same peer are
    /// sent once the connection is up.
    pub fn spawn(
        peer: PeerAddress,
        sessions: Arc<SessionManager>,
        connector: Arc<dyn Connector>,
        receipts: Arc<ReceiptTracker>,
        offline: Arc<OfflineQueue>,
        config: ProtocolConfig,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>)> {
        config.validate().map_err(ProtocolError::Configuration)?;

        let (supervisor, supervisor_rx) = ConnectionSupervisor::spawn(
            peer.clone(),
            connector,
            config.connection.clone(),
            offline,
        );
        let (reassembler, reassembly_rx) = Reassembler::new(&config.fragment);
        let (tracker, delivery_rx) = DeliveryTracker::new(config.delivery.clone());
        let (batcher, batch_rx) = if config.delivery.enable_acks {
            let (batcher, batch_rx) = AckBatcher::spawn(&config.delivery);
            (Some(batcher), Some(batch_rx))
        } else {
            (None, None)
        };
        let (outbound, outbound_rx) = mpsc::channel(1024);
        let (events, events_rx) = mpsc::channel(256);

        let inner = Arc::new(LinkInner {
            fragmenter: Fragmenter::new(config.fragment.fragment_max_size),
            dedup: DuplicateFilter::new(&config.fragment),
            peer,
            config,
            sessions,
            supervisor: supervisor.clone(),
            reassembler,
            tracker,
            batcher,
            receipts,
            messages: DashSet::new(),
            outbound,
            events,
            sync: OnceLock::new(),
            synced_generation: AtomicU64::new(0),
        });

        let tasks = vec![
            tokio::spawn(run_outbound(supervisor, outbound_rx)),
            tokio::spawn(inner.clone().run(supervisor_rx, delivery_rx, reassembly_rx, batch_rx)),
        ];

        Ok((Self { inner, tasks }, events_rx))
    }

    /// Remote peer
    pub fn peer(&self) -> &PeerAddress {
        &self.inner.peer
    }

    /// Start connecting
    pub async fn connect(&self) -> Result<()> {
        self.inner.supervisor.connect().await
    }

    /// Retry after the supervisor gave up
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.supervisor.reset().await?;
        self.inner.supervisor.connect().await
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Connection supervisor of this link
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    /// Publish session and receipt changes through `coordinator`
    ///
    /// Only the first coordinator attached is used. Links to the user's own
    /// devices never publish their session.
    pub fn attach_sync(&self, coordinator: Arc<SessionSyncCoordinator>) {
        if self.inner.sync.set(coordinator).is_err() {
            warn!("Link to {} already has a sync coordinator", self.inner.peer);
        }
    }

    /// Send an application message
    pub async fn send_message(&self, body: Vec<u8>) -> Result<MessageId> {
        let payload = AppPayload::Message {
            body,
            sent_at: Timestamp::now(),
        };
        self.inner.send_payload(&payload, true).await
    }

    /// Tell the peer something happened to one of its messages
    pub async fn send_receipt(&self, message_id: MessageId, kind: ReceiptKind) -> Result<MessageId> {
        let payload = AppPayload::Receipt {
            message_id,
            kind,
            at: Timestamp::now(),
        };
        self.inner.send_payload(&payload, false).await
    }

    /// Forward a sync envelope to another device of the same user
    pub async fn send_sync(&self, envelope: SyncEnvelope) -> Result<MessageId> {
        self.inner.send_payload(&AppPayload::Sync(envelope), false).await
    }

    /// Delivery state of a payload sent over this link
    pub fn delivery_state(&self, id: &MessageId) -> Option<DeliveryState> {
        self.inner.tracker.state(id)
    }

    /// Payloads still waiting for an ack
    pub fn pending_deliveries(&self) -> usize {
        self.inner.tracker.pending_count()
    }

    /// Messages still being reassembled
    pub fn pending_reassemblies(&self) -> usize {
        self.inner.reassembler.pending_count()
    }

    /// Stop the link
    ///
    /// Cancels ack and reassembly timers, persists the session and moves
    /// queued frames into the offline queue.
    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.tracker.shutdown();
        self.inner.reassembler.shutdown();
        if let Some(batcher) = &self.inner.batcher {
            batcher.shutdown();
        }
        self.inner.supervisor.shutdown().await?;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.inner.sessions.has_session(&self.inner.peer).await {
            self.inner.sessions.persist(&self.inner.peer).await?;
        }
        info!("Link to {} shut down", self.inner.peer);
        Ok(())
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl LinkInner {
    async fn send_payload(&self, payload: &AppPayload, is_message: bool) -> Result<MessageId> {
        let id = MessageId::new();
        let sealed = self.sessions.seal(&self.peer, &payload.to_bytes()?).await?;
        let fragments = self.fragmenter.split(id, &sealed.to_bytes()?);

        self.sync_session().await;

        let mut queued = 0;
        for fragment in &fragments {
            let key = FrameKey {
                message_id: id,
                index: fragment.index,
            };
            let frame = Frame::Fragment(fragment.clone()).encode()?;
            if self.supervisor.send_fragment(key, frame).await? == SendOutcome::Queued {
                queued += 1;
            }
        }
        debug!(
            "Sent {} as {} fragments ({} queued)",
            id.short(),
            fragments.len(),
            queued
        );

        if self.config.delivery.enable_acks {
            if is_message {
                self.messages.insert(id);
            }
            self.tracker.track(id, fragments);
        }
        Ok(id)
    }

    #[instrument(skip_all, fields(peer = %self.peer))]
    async fn run(
        self: Arc<Self>,
        mut supervisor_rx: mpsc::Receiver<SupervisorEvent>,
        mut delivery_rx: mpsc::Receiver<DeliveryEvent>,
        mut reassembly_rx: mpsc::Receiver<ReassemblyEvent>,
        mut batch_rx: Option<mpsc::Receiver<Vec<MessageId>>>,
    ) {
        loop {
            tokio::select! {
                event = supervisor_rx.recv() => match event {
                    Some(event) => self.handle_supervisor_event(event).await,
                    None => break,
                },
                Some(event) = delivery_rx.recv() => self.handle_delivery_event(event).await,
                Some(event) = reassembly_rx.recv() => self.handle_reassembly_event(event).await,
                Some(batch) = next_batch(&mut batch_rx) => {
                    self.queue_frame(None, Frame::Ack { message_ids: batch }).await;
                }
            }
        }
        debug!("Link task stopped");
    }

    async fn emit(&self, event: LinkEvent) {
        if let Err(err) = self.events.send(event).await {
            debug!("Link event dropped, receiver is gone: {:?}", err.0);
        }
    }

    async fn queue_frame(&self, key: Option<FrameKey>, frame: Frame) {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Failed to encode frame: {}", err);
                return;
            }
        };
        if self.outbound.send((key, bytes)).await.is_err() {
            debug!("Outbound task for {} has stopped, frame dropped", self.peer);
        }
    }

    /// Publish the session record if the session changed since last time
    async fn sync_session(&self) {
        let sync = match self.sync.get() {
            Some(sync) if self.peer.user_id != *sync.user_id() => sync,
            _ => return,
        };
        let generation = self.sessions.session_generation(&self.peer).await;
        if self.synced_generation.swap(generation, Ordering::AcqRel) == generation {
            return;
        }
        let counters = self.sessions.chain_counters(&self.peer).await;
        if let Err(err) = sync.publish_session(&self.peer, counters).await {
            warn!("Session record for {} not published: {}", self.peer, err);
        }
    }

    /// Record a receipt, publishing it if it changed the status
    async fn record_receipt(
        &self,
        message_id: MessageId,
        kind: ReceiptKind,
        at: Timestamp,
    ) -> Result<ReceiptStatus> {
        let before = self.receipts.status(&message_id);
        let status = self.receipts.record(message_id, kind, at).await?;
        if before.as_ref() == Some(&status) {
            return Ok(status);
        }
        if let Some(sync) = self.sync.get() {
            let event = SessionSyncEvent::ReadStatus {
                message_id,
                kind,
                at,
            };
            if let Err(err) = sync.publish(event).await {
                warn!("Receipt for {} not published: {}", message_id.short(), err);
            }
        }
        Ok(status)
    }

    async fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Data(bytes) => self.handle_frame(&bytes).await,
            SupervisorEvent::StateChanged(state) => {
                self.emit(LinkEvent::ConnectionState(state)).await
            }
            SupervisorEvent::QueueExpired { message_ids } => {
                for id in &message_ids {
                    self.messages.remove(id);
                    self.tracker.expire(id);
                }
                self.emit(LinkEvent::QueueExpired {
                    count: message_ids.len(),
                    message_ids,
                })
                .await
            }
            SupervisorEvent::Failed { reason } => {
                self.emit(LinkEvent::Error(ProtocolError::ConnectionFailed {
                    peer: self.peer.clone(),
                    reason,
                }))
                .await
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Dropping frame from {}: {}", self.peer, err);
                return;
            }
        };

        match frame {
            Frame::Fragment(fragment) => self.handle_fragment(fragment).await,
            Frame::Ack { message_ids } => {
                for id in message_ids {
                    if self.dedup.check_and_insert(DedupKey::Ack { message_id: id }) {
                        self.tracker.ack(&id).await;
                    }
                }
            }
            Frame::Nack {
                message_id,
                missing,
            } => {
                self.tracker.nack(&message_id, &missing).await;
            }
        }
    }

    async fn handle_fragment(&self, fragment: Fragment) {
        let message_id = fragment.message_id;

        // the sender missed our ack; acknowledge again
        if self.dedup.contains(&DedupKey::Delivered { message_id }) {
            debug!("Fragment of delivered {}, re-acking", message_id.short());
            self.push_ack(message_id).await;
            return;
        }
        if !self.dedup.check_and_insert(DedupKey::Fragment {
            message_id,
            index: fragment.index,
        }) {
            debug!(
                "Duplicate fragment {}/{} of {}",
                fragment.index,
                fragment.total,
                message_id.short()
            );
            return;
        }

        match self.reassembler.accept(fragment) {
            Ok(Some(bytes)) => self.handle_sealed(message_id, &bytes).await,
            Ok(None) => {}
            Err(err) => warn!("Dropping fragment from {}: {}", self.peer, err),
        }
    }

    async fn handle_sealed(&self, message_id: MessageId, bytes: &[u8]) {
        let opened = match SealedMessage::from_bytes(bytes) {
            Ok(sealed) => self.sessions.open(&self.peer, &sealed).await,
            Err(err) => Err(err),
        };

        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(err) if err.is_duplicate() => {
                // retransmission of a message whose delivery we already forgot
                debug!("Replay of {} from {}", message_id.short(), self.peer);
                self.push_ack(message_id).await;
                return;
            }
            Err(err) => {
                self.handle_open_error(message_id, err).await;
                return;
            }
        };

        self.dedup
            .check_and_insert(DedupKey::Delivered { message_id });
        self.push_ack(message_id).await;
        self.sync_session().await;

        match AppPayload::from_bytes(&plaintext) {
            Ok(AppPayload::Message { body, sent_at }) => {
                self.emit(LinkEvent::Message {
                    id: message_id,
                    body,
                    sent_at,
                })
                .await
            }
            Ok(AppPayload::Receipt {
                message_id: id,
                kind,
                at,
            }) => match self.record_receipt(id, kind, at).await {
                Ok(status) => self.emit(LinkEvent::Receipt { id, kind, status }).await,
                Err(err) => self.emit(LinkEvent::Error(err)).await,
            },
            Ok(AppPayload::Sync(envelope)) => self.emit(LinkEvent::Sync(envelope)).await,
            Err(err) => warn!("Undecodable payload in {}: {}", message_id.short(), err),
        }
    }

    async fn handle_open_error(&self, message_id: MessageId, err: ProtocolError) {
        match err.disposition() {
            Disposition::Drop => warn!(
                "Dropping {} from {} (possible tampering or replay): {}",
                message_id.short(),
                self.peer,
                err
            ),
            Disposition::ResetSession => {
                warn!("Session with {} is unusable: {}", self.peer, err);
                if let Err(reset_err) = self.sessions.reset(&self.peer).await {
                    self.emit(LinkEvent::Error(reset_err)).await;
                }
                self.sync_session().await;
                self.emit(LinkEvent::SessionReset {
                    peer: self.peer.clone(),
                })
                .await;
            }
            Disposition::Surface => self.emit(LinkEvent::Error(err)).await,
        }
    }

    async fn push_ack(&self, message_id: MessageId) {
        if let Some(batcher) = &self.batcher {
            if let Err(err) = batcher.push(message_id).await {
                debug!("Ack for {} not queued: {}", message_id.short(), err);
            }
        }
    }

    async fn handle_delivery_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Retransmit { fragments, .. } => {
                for fragment in fragments {
                    let key = FrameKey {
                        message_id: fragment.message_id,
                        index: fragment.index,
                    };
                    self.queue_frame(Some(key), Frame::Fragment(fragment)).await;
                }
            }
            DeliveryEvent::Delivered { message_id } => {
                if self.messages.remove(&message_id).is_some() {
                    if let Err(err) = self
                        .record_receipt(message_id, ReceiptKind::Delivered, Timestamp::now())
                        .await
                    {
                        self.emit(LinkEvent::Error(err)).await;
                    }
                }
                self.emit(LinkEvent::Delivered { id: message_id }).await;
            }
            failed @ DeliveryEvent::Failed { message_id, .. } => {
                self.messages.remove(&message_id);
                if let Some(error) = failed.into_error() {
                    self.emit(LinkEvent::DeliveryFailed {
                        id: message_id,
                        error,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_reassembly_event(&self, event: ReassemblyEvent) {
        match event {
            ReassemblyEvent::Expired {
                message_id,
                missing,
            } => {
                if self.config.fragment.enable_nack {
                    debug!(
                        "Requesting {} missing fragments of {}",
                        missing.len(),
                        message_id.short()
                    );
                    self.queue_frame(
                        None,
                        Frame::Nack {
                            message_id,
                            missing,
                        },
                    )
                    .await;
                }
            }
            ReassemblyEvent::Abandoned {
                message_id,
                missing,
            } => {
                self.dedup.forget_fragments(&message_id);
                let err = ProtocolError::ReassemblyTimeout {
                    message_id,
                    missing,
                };
                warn!("{}", err);
            }
        }
    }
}

async fn next_batch(
    batch_rx: &mut Option<mpsc::Receiver<Vec<MessageId>>>,
) -> Option<Vec<MessageId>> {
    match batch_rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

/// Sends frames produced by the link task
///
/// Runs apart from the link task so that waiting on the supervisor never
/// blocks the draining of supervisor events.
async fn run_outbound(
    supervisor: ConnectionSupervisor,
    mut outbound_rx: mpsc::Receiver<(Option<FrameKey>, Vec<u8>)>,
) {
    while let Some((key, bytes)) = outbound_rx.recv().await {
        let sent = match key {
            Some(key) => supervisor.send_fragment(key, bytes).await,
            None => supervisor.send(bytes).await,
        };
        if let Err(err) = sent {
            debug!("Frame to {} not sent: {}", supervisor.peer(), err);
        }
    }
}
