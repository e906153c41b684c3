//! Delivery tracking and ack batching
//!
//! [`DeliveryTracker`] owns one retry task per outbound message. The task
//! asks for a retransmission every ack timeout and fails the message after
//! the last retry; an ack aborts it. [`AckBatcher`] runs on the receiving
//! side and coalesces acks into batches.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use tidewire_core::MessageId;

use crate::config::DeliveryConfig;
use crate::error::{ProtocolError, Result};
use crate::fragment::Fragment;

/// Delivery state of one outbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting for an ack
    Pending,
    /// Acknowledged by the peer
    Acked,
    /// Retries exhausted
    Failed,
}

/// Tracker notifications for the link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Send these fragments again
    Retransmit {
        /// Message
        message_id: MessageId,
        /// Fragments to resend
        fragments: Vec<Fragment>,
    },
    /// The peer acknowledged the message
    Delivered {
        /// Message
        message_id: MessageId,
    },
    /// No ack after every retry
    Failed {
        /// Message
        message_id: MessageId,
        /// Transmissions made, including the first
        attempts: u32,
    },
}

impl DeliveryEvent {
    /// Error for a failed delivery
    pub fn into_error(self) -> Option<ProtocolError> {
        match self {
            DeliveryEvent::Failed {
                message_id,
                attempts,
            } => Some(ProtocolError::DeliveryTimeout {
                message_id,
                attempts,
            }),
            _ => None,
        }
    }
}

/// Tracking record of one outbound message
#[derive(Debug)]
pub struct AckEntry {
    /// Message
    pub message_id: MessageId,
    /// First transmission
    pub sent_at: Instant,
    /// Retransmissions so far
    pub retry_count: u32,
    /// Current state
    pub state: DeliveryState,
    fragments: Arc<Vec<Fragment>>,
    task: AbortHandle,
}

/// Tracks outbound messages until they are acknowledged or fail
pub struct DeliveryTracker {
    entries: Arc<DashMap<MessageId, AckEntry>>,
    config: DeliveryConfig,
    events: mpsc::Sender<DeliveryEvent>,
}

impl DeliveryTracker {
    /// Create a tracker and the receiver of its events
    pub fn new(config: DeliveryConfig) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let tracker = Self {
            entries: Arc::new(DashMap::new()),
            config,
            events,
        };
        (tracker, events_rx)
    }

    /// Start tracking a message that was just sent
    pub fn track(&self, message_id: MessageId, fragments: Vec<Fragment>) {
        let task = self.spawn_retry_task(message_id);
        let entry = AckEntry {
            message_id,
            sent_at: Instant::now(),
            retry_count: 0,
            state: DeliveryState::Pending,
            fragments: Arc::new(fragments),
            task,
        };
        if let Some(previous) = self.entries.insert(message_id, entry) {
            previous.task.abort();
        }
        debug!("Tracking delivery of {}", message_id.short());
    }

    fn spawn_retry_task(&self, message_id: MessageId) -> AbortHandle {
        let entries = self.entries.clone();
        let events = self.events.clone();
        let ack_timeout = self.config.ack_timeout();
        let max_retries = self.config.max_retries;
        let grace = self.config.ack_grace();

        tokio::spawn(async move {
            loop {
                sleep(ack_timeout).await;

                let retransmit = {
                    let mut entry = match entries.get_mut(&message_id) {
                        Some(entry) if entry.state == DeliveryState::Pending => entry,
                        _ => return,
                    };
                    if entry.retry_count >= max_retries {
                        entry.state = DeliveryState::Failed;
                        None
                    } else {
                        entry.retry_count += 1;
                        Some((entry.retry_count, entry.fragments.as_ref().clone()))
                    }
                };

                match retransmit {
                    Some((retry, fragments)) => {
                        debug!(
                            "No ack for {}, retransmitting (retry {}/{})",
                            message_id.short(),
                            retry,
                            max_retries
                        );
                        notify(
                            &events,
                            DeliveryEvent::Retransmit {
                                message_id,
                                fragments,
                            },
                        )
                        .await;
                    }
                    None => {
                        warn!(
                            "Delivery of {} failed after {} attempts",
                            message_id.short(),
                            max_retries + 1
                        );
                        notify(
                            &events,
                            DeliveryEvent::Failed {
                                message_id,
                                attempts: max_retries + 1,
                            },
                        )
                        .await;
                        sleep(grace).await;
                        entries.remove(&message_id);
                        return;
                    }
                }
            }
        })
        .abort_handle()
    }

    /// Record an ack; returns true if it completed a pending delivery
    pub async fn ack(&self, message_id: &MessageId) -> bool {
        {
            let mut entry = match self.entries.get_mut(message_id) {
                Some(entry) if entry.state == DeliveryState::Pending => entry,
                _ => return false,
            };
            entry.state = DeliveryState::Acked;
            entry.task.abort();
            debug!(
                "Delivered {} after {:?}",
                message_id.short(),
                entry.sent_at.elapsed()
            );
        }

        notify(
            &self.events,
            DeliveryEvent::Delivered {
                message_id: *message_id,
            },
        )
        .await;
        self.schedule_removal(*message_id);
        true
    }

    /// Stop retrying a message the offline queue discarded
    ///
    /// The message is failed without a [`DeliveryEvent`]; whoever discarded
    /// it reports the loss. Returns false if it was not pending.
    pub fn expire(&self, message_id: &MessageId) -> bool {
        {
            let mut entry = match self.entries.get_mut(message_id) {
                Some(entry) if entry.state == DeliveryState::Pending => entry,
                _ => return false,
            };
            entry.state = DeliveryState::Failed;
            entry.task.abort();
        }
        debug!("Stopped retrying expired {}", message_id.short());
        self.schedule_removal(*message_id);
        true
    }

    fn schedule_removal(&self, message_id: MessageId) {
        let entries = self.entries.clone();
        let grace = self.config.ack_grace();
        let task = tokio::spawn(async move {
            sleep(grace).await;
            entries.remove(&message_id);
        })
        .abort_handle();
        if let Some(mut entry) = self.entries.get_mut(&message_id) {
            entry.task = task;
        }
    }

    /// Resend only the fragments the peer reported missing
    ///
    /// Does not count as a retry.
    pub async fn nack(&self, message_id: &MessageId, missing: &[u32]) -> bool {
        let wanted: HashSet<u32> = missing.iter().copied().collect();
        let fragments: Vec<Fragment> = match self.entries.get(message_id) {
            Some(entry) if entry.state == DeliveryState::Pending => entry
                .fragments
                .iter()
                .filter(|f| wanted.contains(&f.index))
                .cloned()
                .collect(),
            _ => return false,
        };
        if fragments.is_empty() {
            return false;
        }

        info!(
            "Peer is missing {} fragments of {}, resending",
            fragments.len(),
            message_id.short()
        );
        notify(
            &self.events,
            DeliveryEvent::Retransmit {
                message_id: *message_id,
                fragments,
            },
        )
        .await;
        true
    }

    /// Current state of a tracked message
    pub fn state(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.entries.get(message_id).map(|entry| entry.state)
    }

    /// Retransmissions made for a tracked message
    pub fn retry_count(&self, message_id: &MessageId) -> Option<u32> {
        self.entries.get(message_id).map(|entry| entry.retry_count)
    }

    /// Messages still waiting for an ack
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == DeliveryState::Pending)
            .count()
    }

    /// Cancel every retry task and forget all entries
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            entry.task.abort();
        }
        self.entries.clear();
    }
}

impl Drop for DeliveryTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Coalesces acks into batches
///
/// A batch is flushed when it reaches the configured size or when the
/// configured interval has passed since its first ack.
pub struct AckBatcher {
    ack_tx: mpsc::Sender<MessageId>,
    task: JoinHandle<()>,
}

impl AckBatcher {
    /// Spawn the batching task and return the receiver of flushed batches
    pub fn spawn(config: &DeliveryConfig) -> (Self, mpsc::Receiver<Vec<MessageId>>) {
        let (ack_tx, ack_rx) = mpsc::channel(256);
        let (batch_tx, batch_rx) = mpsc::channel(64);
        let task = tokio::spawn(run_batcher(
            ack_rx,
            batch_tx,
            config.batch_ack_size,
            config.batch_ack_interval(),
        ));
        (Self { ack_tx, task }, batch_rx)
    }

    /// Queue an ack
    pub async fn push(&self, message_id: MessageId) -> Result<()> {
        self.ack_tx
            .send(message_id)
            .await
            .map_err(|_| ProtocolError::ChannelClosed("ack batcher"))
    }

    /// Stop batching; pending acks are dropped
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AckBatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_batcher(
    mut ack_rx: mpsc::Receiver<MessageId>,
    batch_tx: mpsc::Sender<Vec<MessageId>>,
    batch_size: usize,
    interval: Duration,
) {
    let mut pending: Vec<MessageId> = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            ack = ack_rx.recv() => match ack {
                Some(message_id) => {
                    if pending.is_empty() {
                        deadline = Instant::now() + interval;
                    }
                    if !pending.contains(&message_id) {
                        pending.push(message_id);
                    }
                    if pending.len() >= batch_size {
                        flush(&mut pending, &batch_tx).await;
                    }
                }
                None => {
                    flush(&mut pending, &batch_tx).await;
                    return;
                }
            },
            _ = sleep_until(deadline), if !pending.is_empty() => {
                flush(&mut pending, &batch_tx).await;
            }
        }
    }
}

async fn flush(pending: &mut Vec<MessageId>, batch_tx: &mpsc::Sender<Vec<MessageId>>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    debug!("Flushing {} acks", batch.len());
    if let Err(err) = batch_tx.send(batch).await {
        debug!("Ack batch of {} dropped, link is gone", err.0.len());
    }
}

async fn notify(events: &mpsc::Sender<DeliveryEvent>, event: DeliveryEvent) {
    if let Err(err) = events.send(event).await {
        debug!("Delivery event dropped, link is gone: {:?}", err.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragmenter;

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout_secs: 30,
            max_retries: 3,
            ack_grace_secs: 5,
            batch_ack_interval_ms: 100,
            batch_ack_size: 3,
            ..Default::default()
        }
    }

    fn fragments(id: MessageId) -> Vec<Fragment> {
        Fragmenter::new(2).split(id, b"abcdef")
    }

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_before_timeout() {
        let (tracker, mut events) = DeliveryTracker::new(config());
        let id = MessageId::new();
        tracker.track(id, fragments(id));
        assert_eq!(tracker.state(&id), Some(DeliveryState::Pending));

        assert!(tracker.ack(&id).await);
        assert_eq!(
            events.recv().await.unwrap(),
            DeliveryEvent::Delivered { message_id: id }
        );
        assert_eq!(tracker.state(&id), Some(DeliveryState::Acked));
        assert!(!tracker.ack(&id).await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tracker.state(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_fails_once() {
        let (tracker, mut events) = DeliveryTracker::new(config());
        let id = MessageId::new();
        let start = Instant::now();
        tracker.track(id, fragments(id));

        for retry in 1..=3u64 {
            match events.recv().await.unwrap() {
                DeliveryEvent::Retransmit {
                    message_id,
                    fragments,
                } => {
                    assert_eq!(message_id, id);
                    assert_eq!(fragments.len(), 3);
                    assert_elapsed(start, Duration::from_secs(30 * retry));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        let failed = events.recv().await.unwrap();
        assert_elapsed(start, Duration::from_secs(120));
        assert_eq!(
            failed,
            DeliveryEvent::Failed {
                message_id: id,
                attempts: 4,
            }
        );
        assert!(matches!(
            failed.into_error(),
            Some(ProtocolError::DeliveryTimeout { attempts: 4, .. })
        ));
        assert_eq!(tracker.state(&id), Some(DeliveryState::Failed));
        assert!(!tracker.ack(&id).await);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(tracker.state(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_resends_missing_without_retry() {
        let (tracker, mut events) = DeliveryTracker::new(config());
        let id = MessageId::new();
        tracker.track(id, fragments(id));

        assert!(tracker.nack(&id, &[2]).await);
        match events.recv().await.unwrap() {
            DeliveryEvent::Retransmit { fragments, .. } => {
                assert_eq!(fragments.len(), 1);
                assert_eq!(fragments[0].index, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(tracker.retry_count(&id), Some(0));
        assert!(!tracker.nack(&MessageId::new(), &[0]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_stops_retrying_silently() {
        let (tracker, mut events) = DeliveryTracker::new(config());
        let id = MessageId::new();
        tracker.track(id, fragments(id));

        assert!(tracker.expire(&id));
        assert_eq!(tracker.state(&id), Some(DeliveryState::Failed));
        assert!(!tracker.expire(&id));
        assert!(!tracker.ack(&id).await);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(tracker.state(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retries() {
        let (tracker, mut events) = DeliveryTracker::new(config());
        let id = MessageId::new();
        tracker.track(id, fragments(id));
        tracker.shutdown();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_flushes_on_size() {
        let (batcher, mut batches) = AckBatcher::spawn(&config());
        let ids: Vec<_> = (0..3).map(|_| MessageId::new()).collect();
        for id in &ids {
            batcher.push(*id).await.unwrap();
        }

        let start = Instant::now();
        assert_eq!(batches.recv().await.unwrap(), ids);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_flushes_on_interval() {
        let (batcher, mut batches) = AckBatcher::spawn(&config());
        let start = Instant::now();
        let id = MessageId::new();
        batcher.push(id).await.unwrap();
        batcher.push(id).await.unwrap();

        assert_eq!(batches.recv().await.unwrap(), vec![id]);
        assert_elapsed(start, Duration::from_millis(100));
    }
}
