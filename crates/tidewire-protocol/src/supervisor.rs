//! Connection supervision
//!
//! One actor task per peer owns the transport. It connects, reconnects with
//! exponential backoff, pings on an interval and queues outbound frames
//! while the connection is down. Queued fragments are grouped by message:
//! a message takes one slot of the queue limit, ages from its first queued
//! fragment and is discarded whole. Callers talk to it through
//! [`ConnectionSupervisor`]; state changes are published on a watch channel
//! and inbound data on an event channel.
//!
//! ```text
//! DISCONNECTED ─connect─▶ CONNECTING ─ready─▶ CONNECTED
//!                             ▲                  │ error / heartbeat timeout
//!                          backoff               ▼
//!                             └────────── RECONNECTING ──max attempts──▶ FAILED
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use tidewire_core::{MessageId, PeerAddress};

use crate::config::ConnectionConfig;
use crate::error::{ProtocolError, Result};
use crate::transport::{Connector, TransportEvent, TransportHandle};

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected
    Connected,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Gave up; needs a reset
    Failed,
}

/// Notifications from the supervisor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The state changed
    StateChanged(ConnectionState),
    /// A frame from the peer
    Data(Vec<u8>),
    /// Queued messages were discarded for age
    QueueExpired {
        /// Messages discarded, oldest first
        message_ids: Vec<MessageId>,
    },
    /// Reconnect attempts exhausted
    Failed {
        /// Last failure
        reason: String,
    },
}

/// What happened to a sent frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport
    Sent,
    /// Held until the connection is back
    Queued,
}

/// Position of a fragment frame within its message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    /// Message the fragment belongs to
    pub message_id: MessageId,
    /// Fragment index
    pub index: u32,
}

pub(crate) struct QueuedFrame {
    key: Option<FrameKey>,
    bytes: Vec<u8>,
    queued_at: Instant,
}

struct QueuedMessage {
    since: Instant,
    frames: usize,
}

/// Outbound frames held for one peer
#[derive(Default)]
pub(crate) struct FrameQueue {
    frames: VecDeque<QueuedFrame>,
    messages: HashMap<MessageId, QueuedMessage>,
    control: usize,
}

impl FrameQueue {
    /// Messages plus unkeyed frames, the unit of the queue limit
    fn slots(&self) -> usize {
        self.messages.len() + self.control
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Queue a frame; a fragment already queued has its bytes replaced
    ///
    /// Returns false if a new slot is needed and `limit` are taken.
    fn push(&mut self, key: Option<FrameKey>, bytes: Vec<u8>, limit: usize) -> bool {
        if let Some(key) = key {
            if let Some(queued) = self.frames.iter_mut().find(|f| f.key == Some(key)) {
                queued.bytes = bytes;
                return true;
            }
        }

        let needs_slot = match key {
            Some(key) => !self.messages.contains_key(&key.message_id),
            None => true,
        };
        if needs_slot && self.slots() >= limit {
            return false;
        }

        let now = Instant::now();
        match key {
            Some(key) => {
                self.messages
                    .entry(key.message_id)
                    .or_insert(QueuedMessage {
                        since: now,
                        frames: 0,
                    })
                    .frames += 1
            }
            None => self.control += 1,
        }
        self.frames.push_back(QueuedFrame {
            key,
            bytes,
            queued_at: now,
        });
        true
    }

    fn front(&self) -> Option<&QueuedFrame> {
        self.frames.front()
    }

    fn pop_front(&mut self) -> Option<QueuedFrame> {
        let frame = self.frames.pop_front()?;
        match frame.key {
            Some(key) => {
                if let Some(message) = self.messages.get_mut(&key.message_id) {
                    message.frames -= 1;
                    if message.frames == 0 {
                        self.messages.remove(&key.message_id);
                    }
                }
            }
            None => self.control -= 1,
        }
        Some(frame)
    }

    /// Drop messages and control frames older than `expiry`
    ///
    /// Returns the discarded messages, oldest first.
    fn expire(&mut self, expiry: Duration) -> Vec<MessageId> {
        let now = Instant::now();
        let mut expired: Vec<(Instant, MessageId)> = self
            .messages
            .iter()
            .filter(|(_, message)| now.duration_since(message.since) >= expiry)
            .map(|(id, message)| (message.since, *id))
            .collect();
        expired.sort();
        for (_, id) in &expired {
            self.messages.remove(id);
        }

        let messages = &self.messages;
        self.frames.retain(|frame| match frame.key {
            Some(key) => messages.contains_key(&key.message_id),
            None => now.duration_since(frame.queued_at) < expiry,
        });
        let control = self.frames.iter().filter(|f| f.key.is_none()).count();
        if control < self.control {
            debug!("Discarded {} expired control frames", self.control - control);
        }
        self.control = control;

        expired.into_iter().map(|(_, id)| id).collect()
    }

    fn absorb(&mut self, other: FrameQueue) {
        for (id, message) in other.messages {
            match self.messages.get_mut(&id) {
                Some(existing) => {
                    existing.frames += message.frames;
                    existing.since = existing.since.min(message.since);
                }
                None => {
                    self.messages.insert(id, message);
                }
            }
        }
        self.control += other.control;
        self.frames.extend(other.frames);
    }
}

/// Frames left behind by shut-down links, per peer
///
/// A supervisor spawned for a peer picks up whatever is stashed here.
#[derive(Default)]
pub struct OfflineQueue {
    queues: Mutex<HashMap<PeerAddress, FrameQueue>>,
}

impl OfflineQueue {
    /// Create an empty queue
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn stash(&self, peer: &PeerAddress, queue: FrameQueue) {
        if queue.is_empty() {
            return;
        }
        self.queues
            .lock()
            .entry(peer.clone())
            .or_default()
            .absorb(queue);
    }

    fn take(&self, peer: &PeerAddress) -> FrameQueue {
        self.queues.lock().remove(peer).unwrap_or_default()
    }

    /// Frames stashed for a peer
    pub fn len(&self, peer: &PeerAddress) -> usize {
        self.queues.lock().get(peer).map(FrameQueue::len).unwrap_or(0)
    }

    /// Distinct messages stashed for a peer
    pub fn message_count(&self, peer: &PeerAddress) -> usize {
        self.queues
            .lock()
            .get(peer)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    /// True if nothing is stashed for any peer
    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(FrameQueue::is_empty)
    }
}

enum SupervisorCommand {
    Connect,
    Send {
        key: Option<FrameKey>,
        bytes: Vec<u8>,
        response: oneshot::Sender<Result<SendOutcome>>,
    },
    Reset {
        response: oneshot::Sender<()>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Handle to a peer's supervisor task
#[derive(Clone)]
pub struct ConnectionSupervisor {
    peer: PeerAddress,
    command_tx: mpsc::Sender<SupervisorCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task for `peer`
    ///
    /// The task starts DISCONNECTED; call [`connect`](Self::connect).
    pub fn spawn(
        peer: PeerAddress,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        offline: Arc<OfflineQueue>,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let period = config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let actor = SupervisorActor {
            queue: offline.take(&peer),
            peer: peer.clone(),
            connector,
            config,
            offline,
            state_tx,
            event_tx,
            command_rx,
            link: None,
            expired: VecDeque::new(),
            heartbeat,
            failures: 0,
            retry_at: None,
        };
        tokio::spawn(actor.run());

        let handle = Self {
            peer,
            command_tx,
            state_rx,
        };
        (handle, event_rx)
    }

    /// Remote peer
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Start connecting
    pub async fn connect(&self) -> Result<()> {
        self.command(SupervisorCommand::Connect).await
    }

    /// Send a control frame, or queue it while disconnected
    pub async fn send(&self, bytes: Vec<u8>) -> Result<SendOutcome> {
        self.send_keyed(None, bytes).await
    }

    /// Send one fragment of a message, or queue it while disconnected
    ///
    /// Queuing the same fragment again replaces the earlier copy. Fragments
    /// of a message the queue already discarded are refused with
    /// [`ProtocolError::MessageExpired`].
    pub async fn send_fragment(&self, key: FrameKey, bytes: Vec<u8>) -> Result<SendOutcome> {
        self.send_keyed(Some(key), bytes).await
    }

    async fn send_keyed(&self, key: Option<FrameKey>, bytes: Vec<u8>) -> Result<SendOutcome> {
        let (response, rx) = oneshot::channel();
        self.command(SupervisorCommand::Send {
            key,
            bytes,
            response,
        })
        .await?;
        rx.await
            .map_err(|_| ProtocolError::ChannelClosed("supervisor"))?
    }

    /// Leave FAILED (or DISCONNECTED) with a fresh attempt budget
    pub async fn reset(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.command(SupervisorCommand::Reset { response }).await?;
        rx.await.map_err(|_| ProtocolError::ChannelClosed("supervisor"))
    }

    /// Close the transport and stash queued frames in the offline queue
    pub async fn shutdown(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.command(SupervisorCommand::Shutdown { response })
            .await?;
        rx.await.map_err(|_| ProtocolError::ChannelClosed("supervisor"))
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the supervisor reaches `state`
    pub async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::ChannelClosed("supervisor"))
    }

    async fn command(&self, command: SupervisorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ProtocolError::ChannelClosed("supervisor"))
    }
}

struct SupervisorActor {
    peer: PeerAddress,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    offline: Arc<OfflineQueue>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<SupervisorEvent>,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    link: Option<TransportHandle>,
    queue: FrameQueue,
    /// Messages recently discarded for age, so late retransmissions are refused
    expired: VecDeque<MessageId>,
    heartbeat: Interval,
    failures: u32,
    retry_at: Option<Instant>,
}

impl SupervisorActor {
    #[instrument(skip(self), fields(peer = %self.peer))]
    async fn run(mut self) {
        let sweep_period = self
            .config
            .offline_message_expiry()
            .min(Duration::from_secs(60));
        let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);

        loop {
            let connected = self.state() == ConnectionState::Connected;
            let retry_at = self.retry_at;

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.close_link().await;
                        self.offline.stash(&self.peer, std::mem::take(&mut self.queue));
                        break;
                    }
                },
                event = next_event(&mut self.link) => self.handle_transport_event(event).await,
                _ = self.heartbeat.tick(), if connected => self.check_heartbeat().await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
                _ = sweep.tick() => self.expire_queue().await,
            }
        }

        debug!("Supervisor stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    async fn set_state(&self, state: ConnectionState) {
        if self.state() == state {
            return;
        }
        self.state_tx.send_replace(state);
        debug!("Connection state -> {:?}", state);
        self.emit(SupervisorEvent::StateChanged(state)).await;
    }

    async fn emit(&self, event: SupervisorEvent) {
        if let Err(err) = self.event_tx.send(event).await {
            debug!("Supervisor event dropped, link is gone: {:?}", err.0);
        }
    }

    async fn handle_command(&mut self, command: SupervisorCommand) -> bool {
        match command {
            SupervisorCommand::Connect => {
                if self.state() == ConnectionState::Disconnected {
                    self.failures = 0;
                    self.attempt_connect().await;
                }
            }
            SupervisorCommand::Send {
                key,
                bytes,
                response,
            } => {
                let outcome = self.send_or_queue(key, bytes).await;
                let _ = response.send(outcome);
            }
            SupervisorCommand::Reset { response } => {
                if matches!(
                    self.state(),
                    ConnectionState::Failed | ConnectionState::Disconnected
                ) {
                    self.failures = 0;
                    self.retry_at = None;
                    self.set_state(ConnectionState::Disconnected).await;
                }
                let _ = response.send(());
            }
            SupervisorCommand::Shutdown { response } => {
                self.close_link().await;
                self.retry_at = None;
                let queued = std::mem::take(&mut self.queue);
                if !queued.is_empty() {
                    info!(
                        "Stashing {} queued frames of {} messages for {}",
                        queued.len(),
                        queued.messages.len(),
                        self.peer
                    );
                }
                self.offline.stash(&self.peer, queued);
                self.set_state(ConnectionState::Disconnected).await;
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Data(bytes)) => self.emit(SupervisorEvent::Data(bytes)).await,
            Some(TransportEvent::Closed { reason }) => self.connection_lost(reason).await,
            None => self.connection_lost("transport dropped".to_string()).await,
        }
    }

    async fn send_or_queue(&mut self, key: Option<FrameKey>, bytes: Vec<u8>) -> Result<SendOutcome> {
        let transport = match (&self.link, self.state()) {
            (Some(handle), ConnectionState::Connected) => handle.transport.clone(),
            _ => {
                self.enqueue(key, bytes)?;
                return Ok(SendOutcome::Queued);
            }
        };

        match transport.send(bytes.clone()).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(err @ ProtocolError::FrameTooLarge { .. }) => Err(err),
            Err(err) => {
                self.enqueue(key, bytes)?;
                self.connection_lost(err.to_string()).await;
                Ok(SendOutcome::Queued)
            }
        }
    }

    fn enqueue(&mut self, key: Option<FrameKey>, bytes: Vec<u8>) -> Result<()> {
        if let Some(key) = key {
            if self.expired.contains(&key.message_id) {
                return Err(ProtocolError::MessageExpired(key.message_id));
            }
        }
        if !self.queue.push(key, bytes, self.config.max_queued_messages) {
            return Err(ProtocolError::QueueFull(self.peer.clone()));
        }
        Ok(())
    }

    async fn attempt_connect(&mut self) {
        self.set_state(ConnectionState::Connecting).await;

        match timeout(self.config.connect_timeout(), self.connector.connect(&self.peer)).await {
            Ok(Ok(handle)) => {
                self.link = Some(handle);
                self.failures = 0;
                self.heartbeat.reset();
                info!("Connected to {}", self.peer);
                self.set_state(ConnectionState::Connected).await;
                self.flush_queue().await;
            }
            Ok(Err(err)) => self.connect_failed(err.to_string()).await,
            Err(_) => self.connect_failed("connect timed out".to_string()).await,
        }
    }

    async fn connect_failed(&mut self, reason: String) {
        self.failures += 1;
        if self.failures >= self.config.max_reconnect_attempts {
            warn!(
                "Giving up on {} after {} attempts: {}",
                self.peer, self.failures, reason
            );
            self.set_state(ConnectionState::Failed).await;
            self.emit(SupervisorEvent::Failed { reason }).await;
            return;
        }

        let delay = self.config.reconnect_delay(self.failures - 1);
        debug!(
            "Connect attempt {} failed ({}), retrying in {:?}",
            self.failures, reason, delay
        );
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting).await;
    }

    async fn connection_lost(&mut self, reason: String) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!("Lost connection to {}: {}", self.peer, reason);
        self.close_link().await;
        self.failures = 0;
        self.retry_at = Some(Instant::now() + self.config.reconnect_delay(0));
        self.set_state(ConnectionState::Reconnecting).await;
    }

    async fn check_heartbeat(&mut self) {
        let transport = match &self.link {
            Some(handle) => handle.transport.clone(),
            None => return,
        };
        match timeout(self.config.heartbeat_timeout(), transport.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.connection_lost(format!("heartbeat failed: {}", err)).await,
            Err(_) => self.connection_lost("heartbeat timed out".to_string()).await,
        }
    }

    async fn close_link(&mut self) {
        if let Some(handle) = self.link.take() {
            handle.transport.close().await;
        }
    }

    async fn flush_queue(&mut self) {
        self.expire_queue().await;
        let mut sent = 0;

        while let Some(bytes) = self.queue.front().map(|frame| frame.bytes.clone()) {
            let transport = match &self.link {
                Some(handle) => handle.transport.clone(),
                None => break,
            };
            match transport.send(bytes).await {
                Ok(()) => {
                    self.queue.pop_front();
                    sent += 1;
                }
                Err(err @ ProtocolError::FrameTooLarge { .. }) => {
                    self.queue.pop_front();
                    warn!("Dropping queued frame: {}", err);
                }
                Err(err) => {
                    self.connection_lost(err.to_string()).await;
                    break;
                }
            }
        }

        if sent > 0 {
            debug!("Flushed {} queued frames", sent);
        }
    }

    async fn expire_queue(&mut self) {
        let message_ids = self.queue.expire(self.config.offline_message_expiry());
        if message_ids.is_empty() {
            return;
        }
        warn!(
            "Discarded {} queued messages for {} (expired)",
            message_ids.len(),
            self.peer
        );
        for id in &message_ids {
            if self.expired.len() >= self.config.max_queued_messages {
                self.expired.pop_front();
            }
            self.expired.push_back(*id);
        }
        self.emit(SupervisorEvent::QueueExpired { message_ids }).await;
    }
}

async fn next_event(link: &mut Option<TransportHandle>) -> Option<TransportEvent> {
    match link {
        Some(handle) => handle.events.recv().await,
        None => futures::future::pending().await,
    }
}
