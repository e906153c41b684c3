//! Persistence traits for session state and receipts
//!
//! Blobs are opaque to the store. Session snapshots contain key material, so
//! real backends must encrypt at rest; [`MemoryStorage`] is for tests and
//! simulations.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MessageId, SessionId};

/// Storage for ratchet session snapshots
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session snapshot
    async fn load_session(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>>;

    /// Save (or replace) a session snapshot
    async fn save_session(&self, session_id: &SessionId, snapshot: Vec<u8>) -> Result<()>;

    /// Delete a session snapshot
    async fn delete_session(&self, session_id: &SessionId) -> Result<()>;

    /// IDs of all stored sessions
    async fn list_sessions(&self) -> Result<Vec<SessionId>>;

    /// Load the log of handshakes answered under `session_id`
    ///
    /// Kept apart from the snapshot: deleting a session must not forget
    /// which handshakes were already answered.
    async fn load_handshake_log(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>>;

    /// Save (or replace) the handshake log of `session_id`
    async fn save_handshake_log(&self, session_id: &SessionId, log: Vec<u8>) -> Result<()>;
}

/// Storage for per-message receipt status
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Load the receipt blob of a message
    async fn load_receipt(&self, message_id: &MessageId) -> Result<Option<Vec<u8>>>;

    /// Save (or replace) the receipt blob of a message
    async fn save_receipt(&self, message_id: &MessageId, receipt: Vec<u8>) -> Result<()>;

    /// Every stored receipt
    async fn load_all_receipts(&self) -> Result<Vec<(MessageId, Vec<u8>)>>;
}

/// In-memory storage for testing
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tracing::debug;

    /// In-memory storage implementation
    #[derive(Default)]
    pub struct MemoryStorage {
        sessions: RwLock<HashMap<String, Vec<u8>>>,
        handshake_logs: RwLock<HashMap<String, Vec<u8>>>,
        receipts: RwLock<HashMap<MessageId, Vec<u8>>>,
    }

    impl MemoryStorage {
        /// Create new in-memory storage
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Number of stored sessions
        pub fn session_count(&self) -> usize {
            self.sessions.read().len()
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStorage {
        async fn load_session(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>> {
            Ok(self.sessions.read().get(session_id.as_str()).cloned())
        }

        async fn save_session(&self, session_id: &SessionId, snapshot: Vec<u8>) -> Result<()> {
            debug!("Saving session {} ({} bytes)", session_id, snapshot.len());
            self.sessions
                .write()
                .insert(session_id.as_str().to_string(), snapshot);
            Ok(())
        }

        async fn delete_session(&self, session_id: &SessionId) -> Result<()> {
            self.sessions.write().remove(session_id.as_str());
            Ok(())
        }

        async fn list_sessions(&self) -> Result<Vec<SessionId>> {
            let sessions = self.sessions.read();
            let mut ids: Vec<_> = sessions.keys().cloned().collect();
            ids.sort();
            Ok(ids.into_iter().map(SessionId::from_raw).collect())
        }

        async fn load_handshake_log(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>> {
            Ok(self.handshake_logs.read().get(session_id.as_str()).cloned())
        }

        async fn save_handshake_log(&self, session_id: &SessionId, log: Vec<u8>) -> Result<()> {
            self.handshake_logs
                .write()
                .insert(session_id.as_str().to_string(), log);
            Ok(())
        }
    }

    #[async_trait]
    impl ReceiptStore for MemoryStorage {
        async fn load_receipt(&self, message_id: &MessageId) -> Result<Option<Vec<u8>>> {
            Ok(self.receipts.read().get(message_id).cloned())
        }

        async fn save_receipt(&self, message_id: &MessageId, receipt: Vec<u8>) -> Result<()> {
            self.receipts.write().insert(*message_id, receipt);
            Ok(())
        }

        async fn load_all_receipts(&self) -> Result<Vec<(MessageId, Vec<u8>)>> {
            Ok(self
                .receipts
                .read()
                .iter()
                .map(|(id, blob)| (*id, blob.clone()))
                .collect())
        }
    }
}

pub use memory::MemoryStorage;
