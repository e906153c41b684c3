//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tidewire_core::storage::SessionStore;
use tidewire_core::PeerAddress;
use tidewire_crypto::identity::IdentityKeyPair;
use tidewire_protocol::prelude::*;

/// One side of a link
pub struct Endpoint {
    pub address: PeerAddress,
    pub identity: IdentityKeyPair,
    pub link: PeerLink,
    pub events: mpsc::Receiver<LinkEvent>,
    pub receipts: Arc<ReceiptTracker>,
    pub sessions: Arc<SessionManager>,
    pub offline: Arc<OfflineQueue>,
}

pub struct Options {
    pub one_time_prekeys: usize,
    pub store: Option<Arc<dyn SessionStore>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            one_time_prekeys: 10,
            store: None,
        }
    }
}

pub fn alice() -> PeerAddress {
    PeerAddress::new("alice", "phone")
}

pub fn bob() -> PeerAddress {
    PeerAddress::new("bob", "laptop")
}

/// Sessions for `local`, with pre-keys published
pub async fn sessions(
    local: &PeerAddress,
    identity: IdentityKeyPair,
    directory: &Arc<dyn PreKeyDirectory>,
    config: &ProtocolConfig,
    options: &Options,
) -> Arc<SessionManager> {
    let mut manager = SessionManager::new(
        local.clone(),
        identity,
        directory.clone(),
        config.session.clone(),
    );
    if let Some(store) = &options.store {
        manager = manager.with_store(store.clone());
    }
    manager
        .publish_prekeys(options.one_time_prekeys)
        .await
        .unwrap();
    Arc::new(manager)
}

/// Spawn a link from `local` to `remote` and start connecting
pub async fn link(
    network: &Arc<MemoryNetwork>,
    local: &PeerAddress,
    remote: &PeerAddress,
    sessions: Arc<SessionManager>,
    identity: IdentityKeyPair,
    offline: Arc<OfflineQueue>,
    config: &ProtocolConfig,
) -> Endpoint {
    let receipts = Arc::new(ReceiptTracker::new());
    let (link, events) = PeerLink::spawn(
        remote.clone(),
        sessions.clone(),
        Arc::new(network.connector(local.clone())),
        receipts.clone(),
        offline.clone(),
        config.clone(),
    )
    .unwrap();
    link.connect().await.unwrap();
    Endpoint {
        address: local.clone(),
        identity,
        link,
        events,
        receipts,
        sessions,
        offline,
    }
}

/// Two connected endpoints sharing one directory
pub async fn connected_pair(
    network: &Arc<MemoryNetwork>,
    a: PeerAddress,
    b: PeerAddress,
    config: &ProtocolConfig,
    options: Options,
) -> (Endpoint, Endpoint) {
    let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());

    let a_identity = IdentityKeyPair::generate();
    let b_identity = IdentityKeyPair::generate();
    let a_sessions = sessions(&a, a_identity.clone(), &directory, config, &options).await;
    let b_sessions = sessions(&b, b_identity.clone(), &directory, config, &options).await;

    let first = link(network, &a, &b, a_sessions, a_identity, OfflineQueue::new(), config).await;
    let second = link(network, &b, &a, b_sessions, b_identity, OfflineQueue::new(), config).await;
    for endpoint in [&first, &second] {
        endpoint
            .link
            .supervisor()
            .wait_for(ConnectionState::Connected)
            .await
            .unwrap();
    }
    (first, second)
}

/// Wait for the first event matching `pred`, discarding others
pub async fn next_matching<F>(events: &mut mpsc::Receiver<LinkEvent>, mut pred: F) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("link closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Wait for the next application message and return its body
pub async fn next_message(events: &mut mpsc::Receiver<LinkEvent>) -> Vec<u8> {
    match next_matching(events, |e| matches!(e, LinkEvent::Message { .. })).await {
        LinkEvent::Message { body, .. } => body,
        _ => unreachable!(),
    }
}
