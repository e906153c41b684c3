//! Session management for encrypted communications
//!
//! One ratchet session per peer device, each behind its own async mutex so
//! encrypt and decrypt on a session run one at a time while different
//! sessions proceed in parallel. Sessions are created lazily: sealing for a
//! peer without a session runs the handshake, opening a message that
//! carries a handshake answers it.
//!
//! Every answered handshake is remembered in a per-peer log that outlives
//! the session, so a recorded handshake cannot set up a session again after
//! a reset. The log also pins the peer's identity key. A handshake is only
//! answered when its identity matches the directory's (or, failing that,
//! the pinned one) and its first message authenticates.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex as SessionLock;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use tidewire_core::storage::SessionStore;
use tidewire_core::{PeerAddress, SessionId};
use tidewire_crypto::identity::{IdentityKeyPair, IdentityPublicKey, IDENTITY_WIRE_SIZE};
use tidewire_crypto::keys::PublicKeyBytes;
use tidewire_crypto::ratchet::{ChainCounters, RatchetSession};
use tidewire_crypto::x3dh::{HandshakeEngine, HandshakeInit, PreKeyManager};
use tidewire_crypto::CryptoError;

use crate::config::SessionConfig;
use crate::directory::PreKeyDirectory;
use crate::error::{ProtocolError, Result};
use crate::wire::SealedMessage;

/// Live session with one peer device
struct SessionEntry {
    session: RatchetSession,
    /// Our handshake, attached to outgoing messages until the peer replies
    pending_handshake: Option<HandshakeInit>,
    /// Ephemeral key of the peer handshake this session answered
    answered_handshake: Option<PublicKeyBytes>,
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    ratchet: Vec<u8>,
    pending_handshake: Option<HandshakeInit>,
    answered_handshake: Option<PublicKeyBytes>,
}

/// Handshakes answered for one peer, oldest first, and its pinned identity
#[derive(Default, Serialize, Deserialize)]
struct HandshakeLog {
    answered: VecDeque<PublicKeyBytes>,
    identity: Option<Vec<u8>>,
}

impl HandshakeLog {
    fn contains(&self, ephemeral_key: &PublicKeyBytes) -> bool {
        self.answered.contains(ephemeral_key)
    }

    fn record(&mut self, ephemeral_key: PublicKeyBytes, limit: usize) {
        while self.answered.len() >= limit {
            self.answered.pop_front();
        }
        self.answered.push_back(ephemeral_key);
    }

    fn pinned(&self) -> Result<Option<IdentityPublicKey>> {
        let wire = match &self.identity {
            Some(wire) => wire,
            None => return Ok(None),
        };
        let wire: [u8; IDENTITY_WIRE_SIZE] = wire
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidWire("pinned identity has wrong length".to_string()))?;
        Ok(Some(IdentityPublicKey::from_wire(&wire)?))
    }

    fn pin(&mut self, identity: &IdentityPublicKey) {
        self.identity = Some(identity.to_wire().to_vec());
    }
}

/// Everything known about one peer device
#[derive(Default)]
struct PeerState {
    session: Option<SessionEntry>,
    log: HandshakeLog,
    log_loaded: bool,
    /// Bumped whenever a session is established, confirmed or discarded
    generation: u64,
}

type SessionSlot = Arc<SessionLock<PeerState>>;

/// Session manager
pub struct SessionManager {
    local: PeerAddress,
    identity: IdentityKeyPair,
    prekeys: Mutex<PreKeyManager>,
    directory: Arc<dyn PreKeyDirectory>,
    store: Option<Arc<dyn SessionStore>>,
    config: SessionConfig,
    sessions: DashMap<PeerAddress, SessionSlot>,
}

impl SessionManager {
    /// Create a session manager for the local device
    pub fn new(
        local: PeerAddress,
        identity: IdentityKeyPair,
        directory: Arc<dyn PreKeyDirectory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            local,
            prekeys: Mutex::new(PreKeyManager::new(identity.clone())),
            identity,
            directory,
            store: None,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Persist every session change to `store` and load sessions from it
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Local device address
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Our identity public key
    pub fn identity_public_key(&self) -> IdentityPublicKey {
        self.identity.public_key()
    }

    /// Generate one-time pre-keys and publish our bundle
    pub async fn publish_prekeys(&self, one_time_prekeys: usize) -> Result<()> {
        let upload = {
            let mut prekeys = self.prekeys.lock();
            prekeys.generate_one_time_prekeys(one_time_prekeys);
            prekeys.upload()
        };
        self.directory.publish_bundle(&self.local, upload).await?;
        info!(
            "Published {} one-time pre-keys for {}",
            one_time_prekeys, self.local
        );
        Ok(())
    }

    /// Rotate our signed pre-key and republish
    pub async fn rotate_signed_prekey(&self) -> Result<()> {
        let upload = {
            let mut prekeys = self.prekeys.lock();
            prekeys.rotate_signed_prekey();
            prekeys.upload()
        };
        self.directory.publish_bundle(&self.local, upload).await
    }

    /// Unused one-time pre-keys
    pub fn one_time_prekey_count(&self) -> usize {
        self.prekeys.lock().one_time_prekey_count()
    }

    fn slot(&self, peer: &PeerAddress) -> SessionSlot {
        self.sessions.entry(peer.clone()).or_default().clone()
    }

    /// Encrypt for `peer`, running the handshake first if there is no session
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn seal(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<SealedMessage> {
        let slot = self.slot(peer);
        let mut state = slot.lock().await;
        self.load_if_missing(peer, &mut state).await?;

        if state.session.is_none() {
            let entry = self.initiate(peer, &mut state.log).await?;
            self.save_log(peer, &state.log).await?;
            state.session = Some(entry);
            state.generation += 1;
        }
        let entry = state
            .session
            .as_mut()
            .ok_or_else(|| ProtocolError::SessionNotFound(peer.clone()))?;

        let message = entry.session.encrypt(plaintext)?;
        let sealed = SealedMessage::new(entry.pending_handshake.clone(), &message);
        self.save(peer, entry).await?;
        Ok(sealed)
    }

    async fn initiate(&self, peer: &PeerAddress, log: &mut HandshakeLog) -> Result<SessionEntry> {
        let bundle = timeout(
            self.config.handshake_timeout(),
            self.directory.fetch_bundle(peer),
        )
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout(peer.clone()))??;

        let (session, init) =
            HandshakeEngine::initiate(&self.identity, &bundle, self.config.ratchet_limits())?;
        log.pin(&bundle.verify()?);
        Ok(SessionEntry {
            session,
            pending_handshake: Some(init),
            answered_handshake: None,
        })
    }

    /// Decrypt a message from `peer`
    ///
    /// A desynchronized session is discarded; the error then has a
    /// `ResetSession` disposition.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn open(&self, peer: &PeerAddress, sealed: &SealedMessage) -> Result<Vec<u8>> {
        let message = sealed.ratchet_message()?;
        let slot = self.slot(peer);
        let mut state = slot.lock().await;
        self.load_if_missing(peer, &mut state).await?;

        if let Some(init) = &sealed.handshake {
            if self.accepts_handshake(peer, state.session.as_ref(), init) {
                if state.log.contains(&init.ephemeral_key) {
                    warn!("Ignoring replayed handshake from {}", peer);
                    return Err(ProtocolError::HandshakeReplay(peer.clone()));
                }
                let initiator = init.initiator_identity()?;
                self.check_identity(peer, &state.log, &initiator).await?;

                let mut session = {
                    let mut prekeys = self.prekeys.lock();
                    HandshakeEngine::respond(&mut prekeys, init, self.config.ratchet_limits())?
                };
                let plaintext = session.decrypt(&message)?;
                if state.session.is_some() {
                    info!("Replacing session with {} after a new handshake", peer);
                }

                state.log.record(init.ephemeral_key, self.config.max_answered_handshakes);
                state.log.pin(&initiator);
                self.save_log(peer, &state.log).await?;

                let entry = SessionEntry {
                    session,
                    pending_handshake: None,
                    answered_handshake: Some(init.ephemeral_key),
                };
                self.save(peer, &entry).await?;
                state.session = Some(entry);
                state.generation += 1;
                return Ok(plaintext);
            }
        }

        let state = &mut *state;
        let entry = state
            .session
            .as_mut()
            .ok_or_else(|| ProtocolError::SessionNotFound(peer.clone()))?;
        match entry.session.decrypt(&message) {
            Ok(plaintext) => {
                if entry.pending_handshake.take().is_some() {
                    debug!("Handshake with {} confirmed", peer);
                    state.generation += 1;
                }
                self.save(peer, entry).await?;
                Ok(plaintext)
            }
            Err(err @ CryptoError::TooManySkippedMessages { .. }) => {
                warn!("Session with {} desynchronized, discarding it", peer);
                state.session = None;
                state.generation += 1;
                self.delete_stored(peer).await?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn accepts_handshake(
        &self,
        peer: &PeerAddress,
        current: Option<&SessionEntry>,
        init: &HandshakeInit,
    ) -> bool {
        let entry = match current {
            None => return true,
            Some(entry) => entry,
        };
        if entry.answered_handshake == Some(init.ephemeral_key) {
            return false;
        }
        if entry.pending_handshake.is_some() {
            // Both sides initiated; the lower address keeps its own session
            return self.local > *peer;
        }
        true
    }

    /// The directory's identity for `peer` wins; a pinned one is the fallback
    async fn check_identity(
        &self,
        peer: &PeerAddress,
        log: &HandshakeLog,
        claimed: &IdentityPublicKey,
    ) -> Result<()> {
        let registered = timeout(
            self.config.handshake_timeout(),
            self.directory.identity_key(peer),
        )
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout(peer.clone()))??;

        let known = match registered {
            Some(identity) => Some(identity),
            None => log.pinned()?,
        };
        match known {
            Some(known) if known != *claimed => {
                warn!(
                    "Handshake from {} carries identity {}, expected {}",
                    peer,
                    claimed.fingerprint_hex(),
                    known.fingerprint_hex()
                );
                Err(ProtocolError::IdentityMismatch(peer.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn load_if_missing(&self, peer: &PeerAddress, state: &mut PeerState) -> Result<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let session_id = SessionId::for_peer(peer);

        if !state.log_loaded {
            if let Some(blob) = store.load_handshake_log(&session_id).await? {
                state.log = bincode::deserialize(&blob)?;
            }
            state.log_loaded = true;
        }

        if state.session.is_some() {
            return Ok(());
        }
        if let Some(blob) = store.load_session(&session_id).await? {
            let stored: StoredSession = bincode::deserialize(&blob)?;
            state.session = Some(SessionEntry {
                session: RatchetSession::restore(&stored.ratchet)?,
                pending_handshake: stored.pending_handshake,
                answered_handshake: stored.answered_handshake,
            });
            state.generation += 1;
            debug!("Restored session with {}", peer);
        }
        Ok(())
    }

    async fn save(&self, peer: &PeerAddress, entry: &SessionEntry) -> Result<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let stored = StoredSession {
            ratchet: entry.session.snapshot()?,
            pending_handshake: entry.pending_handshake.clone(),
            answered_handshake: entry.answered_handshake,
        };
        store
            .save_session(&SessionId::for_peer(peer), bincode::serialize(&stored)?)
            .await?;
        Ok(())
    }

    async fn save_log(&self, peer: &PeerAddress, log: &HandshakeLog) -> Result<()> {
        if let Some(store) = &self.store {
            store
                .save_handshake_log(&SessionId::for_peer(peer), bincode::serialize(log)?)
                .await?;
        }
        Ok(())
    }

    async fn delete_stored(&self, peer: &PeerAddress) -> Result<()> {
        if let Some(store) = &self.store {
            store.delete_session(&SessionId::for_peer(peer)).await?;
        }
        Ok(())
    }

    /// Write the session with `peer` to the store
    pub async fn persist(&self, peer: &PeerAddress) -> Result<()> {
        let slot = self.slot(peer);
        let state = slot.lock().await;
        match state.session.as_ref() {
            Some(entry) => self.save(peer, entry).await,
            None => Err(ProtocolError::SessionNotFound(peer.clone())),
        }
    }

    /// Load the session with `peer` from the store, replacing any live one
    ///
    /// Returns false if the store has no session for the peer.
    pub async fn restore(&self, peer: &PeerAddress) -> Result<bool> {
        let slot = self.slot(peer);
        let mut state = slot.lock().await;
        let previous = state.session.take();
        self.load_if_missing(peer, &mut state).await?;
        if state.session.is_none() {
            state.session = previous;
            return Ok(false);
        }
        Ok(true)
    }

    /// Discard the session with `peer`; the next seal re-handshakes
    ///
    /// The log of answered handshakes is kept.
    pub async fn reset(&self, peer: &PeerAddress) -> Result<()> {
        let slot = self.slot(peer);
        let mut state = slot.lock().await;
        state.session = None;
        state.generation += 1;
        self.delete_stored(peer).await?;
        info!("Reset session with {}", peer);
        Ok(())
    }

    fn existing(&self, peer: &PeerAddress) -> Option<SessionSlot> {
        self.sessions.get(peer).map(|slot| slot.clone())
    }

    /// Whether a live session with `peer` exists
    pub async fn has_session(&self, peer: &PeerAddress) -> bool {
        match self.existing(peer) {
            Some(slot) => slot.lock().await.session.is_some(),
            None => false,
        }
    }

    /// Whether our handshake with `peer` still awaits a reply
    pub async fn is_pending(&self, peer: &PeerAddress) -> bool {
        match self.existing(peer) {
            Some(slot) => slot
                .lock()
                .await
                .session
                .as_ref()
                .map(|entry| entry.pending_handshake.is_some())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Changes each time the session with `peer` is established, confirmed
    /// or discarded
    pub async fn session_generation(&self, peer: &PeerAddress) -> u64 {
        match self.existing(peer) {
            Some(slot) => slot.lock().await.generation,
            None => 0,
        }
    }

    /// Chain counters of the live session with `peer`
    pub async fn chain_counters(&self, peer: &PeerAddress) -> Option<ChainCounters> {
        let slot = self.existing(peer)?;
        let state = slot.lock().await;
        state.session.as_ref().map(|entry| entry.session.chain_counters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::error::Disposition;
    use tidewire_core::storage::MemoryStorage;

    struct Pair {
        alice: SessionManager,
        bob: SessionManager,
        alice_addr: PeerAddress,
        bob_addr: PeerAddress,
        directory: Arc<dyn PreKeyDirectory>,
    }

    async fn pair(config: SessionConfig) -> Pair {
        let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());
        let alice_addr = PeerAddress::new("alice", "phone");
        let bob_addr = PeerAddress::new("bob", "laptop");
        let alice = SessionManager::new(
            alice_addr.clone(),
            IdentityKeyPair::generate(),
            directory.clone(),
            config.clone(),
        );
        let bob = SessionManager::new(
            bob_addr.clone(),
            IdentityKeyPair::generate(),
            directory.clone(),
            config,
        );
        alice.publish_prekeys(5).await.unwrap();
        bob.publish_prekeys(5).await.unwrap();
        Pair {
            alice,
            bob,
            alice_addr,
            bob_addr,
            directory,
        }
    }

    #[tokio::test]
    async fn test_handshake_attached_until_reply() {
        let p = pair(SessionConfig::default()).await;

        let first = p.alice.seal(&p.bob_addr, b"one").await.unwrap();
        let second = p.alice.seal(&p.bob_addr, b"two").await.unwrap();
        assert!(first.handshake.is_some());
        assert_eq!(first.handshake, second.handshake);
        assert_eq!(p.bob.one_time_prekey_count(), 5);

        // first message lost; the second still establishes the session
        assert_eq!(p.bob.open(&p.alice_addr, &second).await.unwrap(), b"two");
        assert_eq!(p.bob.one_time_prekey_count(), 4);
        assert_eq!(p.bob.open(&p.alice_addr, &first).await.unwrap(), b"one");

        let reply = p.bob.seal(&p.alice_addr, b"three").await.unwrap();
        assert!(reply.handshake.is_none());
        assert_eq!(p.alice.open(&p.bob_addr, &reply).await.unwrap(), b"three");
        assert!(!p.alice.is_pending(&p.bob_addr).await);

        let after = p.alice.seal(&p.bob_addr, b"four").await.unwrap();
        assert!(after.handshake.is_none());
        assert_eq!(p.bob.open(&p.alice_addr, &after).await.unwrap(), b"four");
    }

    #[tokio::test]
    async fn test_replay_is_dropped() {
        let p = pair(SessionConfig::default()).await;
        let sealed = p.alice.seal(&p.bob_addr, b"once").await.unwrap();

        p.bob.open(&p.alice_addr, &sealed).await.unwrap();
        let err = p.bob.open(&p.alice_addr, &sealed).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(err.disposition(), Disposition::Drop);
    }

    #[tokio::test]
    async fn test_message_without_session_or_handshake() {
        let p = pair(SessionConfig::default()).await;
        let sealed = p.alice.seal(&p.bob_addr, b"hello").await.unwrap();
        let stripped = SealedMessage {
            handshake: None,
            body: sealed.body,
        };

        let err = p.bob.open(&p.alice_addr, &stripped).await.unwrap_err();
        assert!(matches!(err, ProtocolError::SessionNotFound(_)));
        assert_eq!(err.disposition(), Disposition::ResetSession);
    }

    #[tokio::test]
    async fn test_desync_discards_session() {
        let p = pair(SessionConfig {
            max_skipped_message_keys: 3,
            ..Default::default()
        })
        .await;
        let first = p.alice.seal(&p.bob_addr, b"0").await.unwrap();
        p.bob.open(&p.alice_addr, &first).await.unwrap();
        let reply = p.bob.seal(&p.alice_addr, b"ok").await.unwrap();
        p.alice.open(&p.bob_addr, &reply).await.unwrap();

        let mut last = None;
        for i in 0..6u8 {
            last = Some(p.alice.seal(&p.bob_addr, &[i]).await.unwrap());
        }
        let err = p
            .bob
            .open(&p.alice_addr, &last.unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::ResetSession);
        assert!(!p.bob.has_session(&p.alice_addr).await);
    }

    #[tokio::test]
    async fn test_simultaneous_initiation_converges() {
        let p = pair(SessionConfig::default()).await;
        let from_alice = p.alice.seal(&p.bob_addr, b"hi bob").await.unwrap();
        let from_bob = p.bob.seal(&p.alice_addr, b"hi alice").await.unwrap();

        // alice < bob, so alice keeps her session and bob answers it
        assert!(p.alice.open(&p.bob_addr, &from_bob).await.is_err());
        assert_eq!(
            p.bob.open(&p.alice_addr, &from_alice).await.unwrap(),
            b"hi bob"
        );

        let reply = p.bob.seal(&p.alice_addr, b"again").await.unwrap();
        assert_eq!(p.alice.open(&p.bob_addr, &reply).await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_sessions_survive_restart() {
        let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());
        let storage = MemoryStorage::new();
        let alice_addr = PeerAddress::new("alice", "phone");
        let bob_addr = PeerAddress::new("bob", "laptop");
        let alice = SessionManager::new(
            alice_addr.clone(),
            IdentityKeyPair::generate(),
            directory.clone(),
            SessionConfig::default(),
        );
        let bob_identity = IdentityKeyPair::generate();
        let bob = SessionManager::new(
            bob_addr.clone(),
            bob_identity.clone(),
            directory.clone(),
            SessionConfig::default(),
        )
        .with_store(storage.clone());
        bob.publish_prekeys(1).await.unwrap();

        let first = alice.seal(&bob_addr, b"before").await.unwrap();
        bob.open(&alice_addr, &first).await.unwrap();
        assert_eq!(storage.session_count(), 1);
        drop(bob);

        let bob = SessionManager::new(
            bob_addr.clone(),
            bob_identity,
            directory,
            SessionConfig::default(),
        )
        .with_store(storage);
        let second = alice.seal(&bob_addr, b"after").await.unwrap();
        assert_eq!(bob.open(&alice_addr, &second).await.unwrap(), b"after");
        assert!(bob.restore(&alice_addr).await.unwrap());
        bob.persist(&alice_addr).await.unwrap();
    }

    fn manager(local: &PeerAddress, directory: &Arc<dyn PreKeyDirectory>) -> SessionManager {
        SessionManager::new(
            local.clone(),
            IdentityKeyPair::generate(),
            directory.clone(),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_handshake_not_answered_twice_across_reset_and_restart() {
        let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());
        let storage = MemoryStorage::new();
        let alice_addr = PeerAddress::new("alice", "phone");
        let bob_addr = PeerAddress::new("bob", "laptop");
        let alice = manager(&alice_addr, &directory);
        let bob_identity = IdentityKeyPair::generate();
        let bob = SessionManager::new(
            bob_addr.clone(),
            bob_identity.clone(),
            directory.clone(),
            SessionConfig::default(),
        )
        .with_store(storage.clone());
        alice.publish_prekeys(0).await.unwrap();
        bob.publish_prekeys(0).await.unwrap();

        let recorded = alice.seal(&bob_addr, b"transfer 10").await.unwrap();
        bob.open(&alice_addr, &recorded).await.unwrap();

        bob.reset(&alice_addr).await.unwrap();
        let err = bob.open(&alice_addr, &recorded).await.unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeReplay(_)));
        assert_eq!(err.disposition(), Disposition::Drop);
        assert!(!err.is_duplicate());
        assert!(!bob.has_session(&alice_addr).await);

        drop(bob);
        let bob = SessionManager::new(bob_addr, bob_identity, directory, SessionConfig::default())
            .with_store(storage);
        let err = bob.open(&alice_addr, &recorded).await.unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeReplay(_)));
    }

    #[test]
    fn test_answered_log_is_bounded() {
        let mut log = HandshakeLog::default();
        let keys: Vec<PublicKeyBytes> = (0..3).map(|i| PublicKeyBytes([i; 32])).collect();
        for key in &keys {
            log.record(*key, 2);
        }
        assert!(!log.contains(&keys[0]));
        assert!(log.contains(&keys[1]) && log.contains(&keys[2]));
    }

    #[tokio::test]
    async fn test_initiator_identity_must_match_directory() {
        let p = pair(SessionConfig::default()).await;

        // claims to be alice/phone with a key of its own
        let mallory = manager(&p.alice_addr, &p.directory);
        let forged = mallory.seal(&p.bob_addr, b"it's me").await.unwrap();

        let err = p.bob.open(&p.alice_addr, &forged).await.unwrap_err();
        assert!(matches!(err, ProtocolError::IdentityMismatch(_)));
        assert_eq!(err.disposition(), Disposition::Drop);
        assert!(!p.bob.has_session(&p.alice_addr).await);

        let genuine = p.alice.seal(&p.bob_addr, b"hello").await.unwrap();
        assert_eq!(p.bob.open(&p.alice_addr, &genuine).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_first_identity_is_pinned_for_unlisted_peer() {
        let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());
        let alice_addr = PeerAddress::new("alice", "phone");
        let bob_addr = PeerAddress::new("bob", "laptop");
        let alice = manager(&alice_addr, &directory);
        let bob = manager(&bob_addr, &directory);
        bob.publish_prekeys(3).await.unwrap();

        let first = alice.seal(&bob_addr, b"one").await.unwrap();
        bob.open(&alice_addr, &first).await.unwrap();

        let mallory = manager(&alice_addr, &directory);
        let forged = mallory.seal(&bob_addr, b"two").await.unwrap();
        let err = bob.open(&alice_addr, &forged).await.unwrap_err();
        assert!(matches!(err, ProtocolError::IdentityMismatch(_)));

        // the genuine session is untouched
        let next = alice.seal(&bob_addr, b"three").await.unwrap();
        assert_eq!(bob.open(&alice_addr, &next).await.unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_generation_and_counters() {
        let p = pair(SessionConfig::default()).await;
        assert_eq!(p.alice.session_generation(&p.bob_addr).await, 0);
        assert!(p.alice.chain_counters(&p.bob_addr).await.is_none());

        let first = p.alice.seal(&p.bob_addr, b"one").await.unwrap();
        let established = p.alice.session_generation(&p.bob_addr).await;
        assert_eq!(established, 1);
        p.alice.seal(&p.bob_addr, b"two").await.unwrap();
        assert_eq!(p.alice.session_generation(&p.bob_addr).await, established);
        assert_eq!(p.alice.chain_counters(&p.bob_addr).await.unwrap().sending, 2);

        p.bob.open(&p.alice_addr, &first).await.unwrap();
        let reply = p.bob.seal(&p.alice_addr, b"ok").await.unwrap();
        p.alice.open(&p.bob_addr, &reply).await.unwrap();
        assert_eq!(p.alice.session_generation(&p.bob_addr).await, established + 1);

        p.alice.reset(&p.bob_addr).await.unwrap();
        assert_eq!(p.alice.session_generation(&p.bob_addr).await, established + 2);
        assert!(p.alice.chain_counters(&p.bob_addr).await.is_none());
    }

    #[tokio::test]
    async fn test_reset_forces_new_handshake() {
        let p = pair(SessionConfig::default()).await;
        let first = p.alice.seal(&p.bob_addr, b"one").await.unwrap();
        p.bob.open(&p.alice_addr, &first).await.unwrap();
        let reply = p.bob.seal(&p.alice_addr, b"two").await.unwrap();
        p.alice.open(&p.bob_addr, &reply).await.unwrap();

        p.alice.reset(&p.bob_addr).await.unwrap();
        let fresh = p.alice.seal(&p.bob_addr, b"three").await.unwrap();
        assert!(fresh.handshake.is_some());
        assert_eq!(p.bob.open(&p.alice_addr, &fresh).await.unwrap(), b"three");
    }
}
