//! Pre-key directory
//!
//! Stands in for the identity service: devices publish their pre-keys and
//! initiators fetch one bundle per handshake.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use tidewire_core::PeerAddress;
use tidewire_crypto::identity::IdentityPublicKey;
use tidewire_crypto::keys::{PreKeyBundle, PreKeyUpload};

use crate::error::{ProtocolError, Result};

/// Source of peers' pre-key bundles
#[async_trait]
pub trait PreKeyDirectory: Send + Sync {
    /// Fetch a bundle for `peer`, consuming one of its one-time pre-keys
    async fn fetch_bundle(&self, peer: &PeerAddress) -> Result<PreKeyBundle>;

    /// Publish (or replace) the pre-keys of `peer`
    async fn publish_bundle(&self, peer: &PeerAddress, upload: PreKeyUpload) -> Result<()>;

    /// Identity `peer` has registered, without consuming any pre-key
    ///
    /// `None` when the peer never published.
    async fn identity_key(&self, peer: &PeerAddress) -> Result<Option<IdentityPublicKey>>;
}

/// In-memory directory
#[derive(Default)]
pub struct MemoryDirectory {
    uploads: DashMap<PeerAddress, PreKeyUpload>,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time pre-keys left for `peer`
    pub fn one_time_prekeys_left(&self, peer: &PeerAddress) -> usize {
        self.uploads
            .get(peer)
            .map(|upload| upload.one_time_prekeys.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PreKeyDirectory for MemoryDirectory {
    async fn fetch_bundle(&self, peer: &PeerAddress) -> Result<PreKeyBundle> {
        let mut upload = self
            .uploads
            .get_mut(peer)
            .ok_or_else(|| ProtocolError::PreKeyUnavailable(peer.clone()))?;
        let bundle = upload.take_bundle();
        debug!(
            "Handed out bundle for {} ({} one-time pre-keys left)",
            peer,
            upload.one_time_prekeys.len()
        );
        Ok(bundle)
    }

    async fn publish_bundle(&self, peer: &PeerAddress, upload: PreKeyUpload) -> Result<()> {
        debug!(
            "Published pre-keys for {} ({} one-time)",
            peer,
            upload.one_time_prekeys.len()
        );
        self.uploads.insert(peer.clone(), upload);
        Ok(())
    }

    async fn identity_key(&self, peer: &PeerAddress) -> Result<Option<IdentityPublicKey>> {
        match self.uploads.get(peer) {
            Some(upload) => Ok(Some(IdentityPublicKey::from_wire(&upload.identity_key)?)),
            None => Ok(None),
        }
    }
}
