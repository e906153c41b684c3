//! Transport abstraction and an in-memory lossy network
//!
//! A [`Connector`] opens a [`TransportHandle`]: the send half is an
//! `Arc<dyn Transport>`, inbound bytes and close notifications arrive on a
//! channel. Nothing in a transport holds a pointer back into the layers
//! above it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use tidewire_core::PeerAddress;

use crate::error::{ProtocolError, Result};

/// Inbound notifications from a transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes from the peer
    Data(Vec<u8>),
    /// The transport closed
    Closed {
        /// Why it closed
        reason: String,
    },
}

/// Send half of an open connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame
    async fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Round-trip liveness check
    async fn ping(&self) -> Result<()>;

    /// Close the connection
    async fn close(&self);

    /// Largest frame the transport accepts
    fn max_payload(&self) -> usize;
}

/// An open connection
pub struct TransportHandle {
    /// Send half
    pub transport: Arc<dyn Transport>,
    /// Inbound events
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to peers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `peer`
    async fn connect(&self, peer: &PeerAddress) -> Result<TransportHandle>;
}

/// Impairments applied by [`MemoryNetwork`]
#[derive(Clone, Debug, PartialEq)]
pub struct LinkProfile {
    /// Probability a frame is dropped
    pub loss: f64,
    /// Probability a frame is delivered twice
    pub duplicate: f64,
    /// Probability a frame is held back by a random delay
    pub reorder: f64,
    /// Upper bound of that delay (milliseconds)
    pub max_delay_ms: u64,
    /// Largest frame accepted
    pub max_payload: usize,
}

impl LinkProfile {
    /// A link that delivers everything in order
    pub fn perfect() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            max_delay_ms: 0,
            max_payload: 64 * 1024,
        }
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self::perfect()
    }
}

/// Counters kept by [`MemoryNetwork`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Frames handed to a receiver
    pub delivered: u64,
    /// Frames dropped by loss or an absent receiver
    pub dropped: u64,
    /// Extra copies injected
    pub duplicated: u64,
    /// Frames delivered late
    pub delayed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    delayed: AtomicU64,
}

type Endpoint = (PeerAddress, PeerAddress);

/// In-process network connecting any number of peers
///
/// Each `(local, remote)` pair has at most one open inbound channel; a new
/// connection replaces the previous one.
pub struct MemoryNetwork {
    endpoints: DashMap<Endpoint, mpsc::Sender<TransportEvent>>,
    unreachable: DashMap<PeerAddress, ()>,
    profile: RwLock<LinkProfile>,
    rng: Mutex<StdRng>,
    counters: Counters,
}

impl MemoryNetwork {
    /// Create a network with the given impairments
    pub fn new(profile: LinkProfile) -> Arc<Self> {
        Self::build(profile, StdRng::from_entropy())
    }

    /// Create a network whose impairments are reproducible
    pub fn with_seed(profile: LinkProfile, seed: u64) -> Arc<Self> {
        Self::build(profile, StdRng::seed_from_u64(seed))
    }

    fn build(profile: LinkProfile, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            unreachable: DashMap::new(),
            profile: RwLock::new(profile),
            rng: Mutex::new(rng),
            counters: Counters::default(),
        })
    }

    /// Connector acting for `local`
    pub fn connector(self: &Arc<Self>, local: PeerAddress) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local,
        }
    }

    /// Replace the impairments
    pub fn set_profile(&self, profile: LinkProfile) {
        *self.profile.write() = profile;
    }

    /// Take a peer offline or bring it back
    ///
    /// Going offline closes every connection that involves the peer.
    pub fn set_reachable(&self, peer: &PeerAddress, reachable: bool) {
        if reachable {
            self.unreachable.remove(peer);
            return;
        }

        self.unreachable.insert(peer.clone(), ());
        let affected: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|entry| &entry.key().0 == peer || &entry.key().1 == peer)
            .map(|entry| entry.key().clone())
            .collect();
        for key in affected {
            if let Some((_, tx)) = self.endpoints.remove(&key) {
                let _ = tx.try_send(TransportEvent::Closed {
                    reason: format!("{} went offline", peer),
                });
            }
        }
        debug!("{} is now unreachable", peer);
    }

    /// Whether a peer is reachable
    pub fn is_reachable(&self, peer: &PeerAddress) -> bool {
        !self.unreachable.contains_key(peer)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicated: self.counters.duplicated.load(Ordering::Relaxed),
            delayed: self.counters.delayed.load(Ordering::Relaxed),
        }
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && self.rng.lock().gen_bool(probability.min(1.0))
    }

    fn random_delay(&self, max_ms: u64) -> Duration {
        Duration::from_millis(self.rng.lock().gen_range(0..=max_ms))
    }

    async fn deliver(&self, from: &PeerAddress, to: &PeerAddress, bytes: Vec<u8>) {
        let profile = self.profile.read().clone();
        let target = match self.endpoints.get(&(to.clone(), from.clone())) {
            Some(tx) => tx.clone(),
            None => {
                trace!("No receiver at {} for {}, dropping", to, from);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if self.roll(profile.loss) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let copies = if self.roll(profile.duplicate) {
            self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
            2
        } else {
            1
        };

        for _ in 0..copies {
            if profile.max_delay_ms > 0 && self.roll(profile.reorder) {
                self.counters.delayed.fetch_add(1, Ordering::Relaxed);
                let delay = self.random_delay(profile.max_delay_ms);
                let target = target.clone();
                let bytes = bytes.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = target.send(TransportEvent::Data(bytes)).await;
                });
            } else if target
                .send(TransportEvent::Data(bytes.clone()))
                .await
                .is_err()
            {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// [`Connector`] over a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
    local: PeerAddress,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, peer: &PeerAddress) -> Result<TransportHandle> {
        if !self.network.is_reachable(&self.local) || !self.network.is_reachable(peer) {
            return Err(ProtocolError::ConnectionFailed {
                peer: peer.clone(),
                reason: "unreachable".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(1024);
        self.network
            .endpoints
            .insert((self.local.clone(), peer.clone()), tx.clone());
        debug!("{} connected to {}", self.local, peer);

        Ok(TransportHandle {
            transport: Arc::new(MemoryTransport {
                network: self.network.clone(),
                local: self.local.clone(),
                remote: peer.clone(),
                inbound: tx,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// One direction of a [`MemoryNetwork`] connection
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: PeerAddress,
    remote: PeerAddress,
    inbound: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn check_open(&self) -> Result<()> {
        let reachable =
            self.network.is_reachable(&self.local) && self.network.is_reachable(&self.remote);
        if self.closed.load(Ordering::Acquire) || !reachable {
            return Err(ProtocolError::ConnectionFailed {
                peer: self.remote.clone(),
                reason: "transport closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let max = self.max_payload();
        if bytes.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max,
            });
        }
        self.network.deliver(&self.local, &self.remote, bytes).await;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let key = (self.local.clone(), self.remote.clone());
        self.network
            .endpoints
            .remove_if(&key, |_, tx| tx.same_channel(&self.inbound));
    }

    fn max_payload(&self) -> usize {
        self.network.profile.read().max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> (PeerAddress, PeerAddress) {
        (
            PeerAddress::new("alice", "phone"),
            PeerAddress::new("bob", "laptop"),
        )
    }

    #[tokio::test]
    async fn test_perfect_link_delivers_in_order() {
        let network = MemoryNetwork::new(LinkProfile::perfect());
        let (alice, bob) = peers();
        let a = network.connector(alice.clone()).connect(&bob).await.unwrap();
        let mut b = network.connector(bob).connect(&alice).await.unwrap();

        for i in 0..5u8 {
            a.transport.send(vec![i]).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(b.events.recv().await.unwrap(), TransportEvent::Data(vec![i]));
        }
        assert_eq!(network.stats().delivered, 5);
    }

    #[tokio::test]
    async fn test_total_loss() {
        let network = MemoryNetwork::with_seed(
            LinkProfile {
                loss: 1.0,
                ..LinkProfile::perfect()
            },
            7,
        );
        let (alice, bob) = peers();
        let a = network.connector(alice.clone()).connect(&bob).await.unwrap();
        let mut b = network.connector(bob).connect(&alice).await.unwrap();

        a.transport.send(vec![1]).await.unwrap();
        assert!(b.events.try_recv().is_err());
        assert_eq!(network.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_closes_connections() {
        let network = MemoryNetwork::new(LinkProfile::perfect());
        let (alice, bob) = peers();
        let mut a = network.connector(alice.clone()).connect(&bob).await.unwrap();

        network.set_reachable(&bob, false);
        assert!(matches!(
            a.events.recv().await.unwrap(),
            TransportEvent::Closed { .. }
        ));
        assert!(a.transport.ping().await.is_err());
        assert!(network.connector(alice).connect(&bob).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let network = MemoryNetwork::new(LinkProfile {
            max_payload: 8,
            ..LinkProfile::perfect()
        });
        let (alice, bob) = peers();
        let a = network.connector(alice).connect(&bob).await.unwrap();

        assert!(matches!(
            a.transport.send(vec![0; 9]).await,
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        ));
    }
}
