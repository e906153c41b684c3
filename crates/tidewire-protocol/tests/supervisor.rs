//! Connection supervisor behaviour under failing and stalling transports

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tidewire_core::{MessageId, PeerAddress};
use tidewire_protocol::config::ConnectionConfig;
use tidewire_protocol::error::{ProtocolError, Result};
use tidewire_protocol::supervisor::{
    ConnectionState, ConnectionSupervisor, FrameKey, OfflineQueue, SendOutcome, SupervisorEvent,
};
use tidewire_protocol::transport::{
    Connector, LinkProfile, MemoryNetwork, Transport, TransportEvent, TransportHandle,
};

fn bob() -> PeerAddress {
    PeerAddress::new("bob", "laptop")
}

fn alice() -> PeerAddress {
    PeerAddress::new("alice", "phone")
}

fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    let tolerance = Duration::from_millis(50);
    assert!(
        elapsed + tolerance >= expected && elapsed <= expected + tolerance,
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
}

/// Refuses every connection
#[derive(Default)]
struct RefusingConnector {
    attempts: AtomicU32,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, peer: &PeerAddress) -> Result<TransportHandle> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProtocolError::ConnectionFailed {
            peer: peer.clone(),
            reason: "refused".to_string(),
        })
    }
}

/// Connects, then never answers a ping
#[derive(Default)]
struct StallingConnector {
    connections: AtomicU32,
    inbound: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

struct StallingTransport;

#[async_trait]
impl Transport for StallingTransport {
    async fn send(&self, _bytes: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        futures::future::pending().await
    }

    async fn close(&self) {}

    fn max_payload(&self) -> usize {
        1024
    }
}

#[async_trait]
impl Connector for StallingConnector {
    async fn connect(&self, _peer: &PeerAddress) -> Result<TransportHandle> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::channel(16);
        self.inbound.lock().push(tx);
        Ok(TransportHandle {
            transport: Arc::new(StallingTransport),
            events,
        })
    }
}

fn fast_backoff() -> ConnectionConfig {
    ConnectionConfig {
        max_reconnect_attempts: 4,
        base_reconnect_delay_ms: 1000,
        max_reconnect_delay_ms: 30_000,
        reconnect_backoff_multiplier: 2.0,
        ..ConnectionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_until_failed() {
    let connector = Arc::new(RefusingConnector::default());
    let (supervisor, mut events) = ConnectionSupervisor::spawn(
        bob(),
        connector.clone(),
        fast_backoff(),
        OfflineQueue::new(),
    );

    let start = Instant::now();
    supervisor.connect().await.unwrap();
    supervisor.wait_for(ConnectionState::Failed).await.unwrap();

    // 1s + 2s + 4s between four attempts
    assert_elapsed(start, Duration::from_secs(7));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

    // FAILED is terminal until reset
    supervisor.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::Failed { reason } = event {
            assert!(reason.contains("refused"));
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    supervisor.reset().await.unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    supervisor.connect().await.unwrap();
    supervisor.wait_for(ConnectionState::Failed).await.unwrap();
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 8);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delay_is_capped() {
    let config = ConnectionConfig {
        max_reconnect_attempts: 6,
        base_reconnect_delay_ms: 1000,
        max_reconnect_delay_ms: 3000,
        reconnect_backoff_multiplier: 2.0,
        ..ConnectionConfig::default()
    };
    let (supervisor, _events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(RefusingConnector::default()),
        config,
        OfflineQueue::new(),
    );

    let start = Instant::now();
    supervisor.connect().await.unwrap();
    supervisor.wait_for(ConnectionState::Failed).await.unwrap();

    // 1 + 2 + 3 + 3 + 3
    assert_elapsed(start, Duration::from_secs(12));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_triggers_reconnect() {
    let connector = Arc::new(StallingConnector::default());
    let config = ConnectionConfig {
        heartbeat_interval_secs: 30,
        heartbeat_timeout_secs: 10,
        ..ConnectionConfig::default()
    };
    let (supervisor, _events) =
        ConnectionSupervisor::spawn(bob(), connector.clone(), config, OfflineQueue::new());

    supervisor.connect().await.unwrap();
    supervisor.wait_for(ConnectionState::Connected).await.unwrap();
    let connected_at = Instant::now();

    supervisor.wait_for(ConnectionState::Reconnecting).await.unwrap();
    assert_elapsed(connected_at, Duration::from_secs(40));

    supervisor.wait_for(ConnectionState::Connected).await.unwrap();
    assert_eq!(connector.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queued_frames_flush_on_connect() {
    let network = MemoryNetwork::new(LinkProfile::perfect());
    let mut remote = network.connector(bob()).connect(&alice()).await.unwrap();
    let (supervisor, _events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(network.connector(alice())),
        ConnectionConfig::default(),
        OfflineQueue::new(),
    );

    assert_eq!(supervisor.send(vec![1]).await.unwrap(), SendOutcome::Queued);
    assert_eq!(supervisor.send(vec![2]).await.unwrap(), SendOutcome::Queued);

    supervisor.connect().await.unwrap();
    supervisor.wait_for(ConnectionState::Connected).await.unwrap();

    assert_eq!(remote.events.recv().await, Some(TransportEvent::Data(vec![1])));
    assert_eq!(remote.events.recv().await, Some(TransportEvent::Data(vec![2])));
    assert_eq!(supervisor.send(vec![3]).await.unwrap(), SendOutcome::Sent);
    assert_eq!(remote.events.recv().await, Some(TransportEvent::Data(vec![3])));
}

fn key(message_id: MessageId, index: u32) -> FrameKey {
    FrameKey { message_id, index }
}

#[tokio::test(start_paused = true)]
async fn test_offline_expiry_counts_messages_not_frames() {
    let config = ConnectionConfig {
        offline_message_expiry_secs: 60,
        ..ConnectionConfig::default()
    };
    let (supervisor, mut events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(RefusingConnector::default()),
        config,
        OfflineQueue::new(),
    );

    let early: Vec<MessageId> = (0..3).map(|_| MessageId::new()).collect();
    for id in &early {
        for index in 0..4 {
            let outcome = supervisor.send_fragment(key(*id, index), vec![index as u8]).await;
            assert_eq!(outcome.unwrap(), SendOutcome::Queued);
        }
    }
    // a retransmission replaces the queued copy
    supervisor
        .send_fragment(key(early[0], 0), vec![0])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let late = MessageId::new();
    supervisor.send_fragment(key(late, 0), vec![9]).await.unwrap();

    let mut reported = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(200);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let SupervisorEvent::QueueExpired { message_ids } = event {
            reported.push(message_ids);
        }
    }

    assert_eq!(reported.len(), 2);
    let mut first = reported[0].clone();
    first.sort();
    let mut expected = early.clone();
    expected.sort();
    assert_eq!(first, expected);
    assert_eq!(reported[1], vec![late]);

    // late retransmissions of an expired message are refused
    assert!(matches!(
        supervisor.send_fragment(key(early[1], 2), vec![2]).await,
        Err(ProtocolError::MessageExpired(id)) if id == early[1]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_new_messages() {
    let config = ConnectionConfig {
        max_queued_messages: 2,
        ..ConnectionConfig::default()
    };
    let (supervisor, _events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(RefusingConnector::default()),
        config,
        OfflineQueue::new(),
    );

    let first = MessageId::new();
    supervisor.send_fragment(key(first, 0), vec![1]).await.unwrap();
    supervisor.send(vec![2]).await.unwrap();

    // more fragments of a queued message need no new slot
    supervisor.send_fragment(key(first, 1), vec![3]).await.unwrap();
    assert!(matches!(
        supervisor.send_fragment(key(MessageId::new(), 0), vec![4]).await,
        Err(ProtocolError::QueueFull(_))
    ));
    assert!(matches!(
        supervisor.send(vec![5]).await,
        Err(ProtocolError::QueueFull(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stashes_queue_for_next_supervisor() {
    let network = MemoryNetwork::new(LinkProfile::perfect());
    let offline = OfflineQueue::new();
    let mut remote = network.connector(bob()).connect(&alice()).await.unwrap();

    let (first, _events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(network.connector(alice())),
        ConnectionConfig::default(),
        offline.clone(),
    );
    first.send(b"one".to_vec()).await.unwrap();
    first.send(b"two".to_vec()).await.unwrap();
    first.shutdown().await.unwrap();
    assert_eq!(offline.len(&bob()), 2);

    let (second, _events) = ConnectionSupervisor::spawn(
        bob(),
        Arc::new(network.connector(alice())),
        ConnectionConfig::default(),
        offline.clone(),
    );
    assert!(offline.is_empty());
    second.connect().await.unwrap();
    second.wait_for(ConnectionState::Connected).await.unwrap();

    assert_eq!(
        remote.events.recv().await,
        Some(TransportEvent::Data(b"one".to_vec()))
    );
    assert_eq!(
        remote.events.recv().await,
        Some(TransportEvent::Data(b"two".to_vec()))
    );
}
