//! # Tidewire Protocol
//!
//! Session and delivery layers on top of an unreliable, unordered,
//! size-limited transport.
//!
//! ## Overview
//!
//! - **Sessions**: X3DH handshakes and Double Ratchet sessions per peer device
//! - **Fragmentation**: split sealed messages across the transport size limit
//! - **Reliability**: duplicate filtering, batched acks, retries and NACKs
//! - **Receipts**: delivered / read / played / screenshot status
//! - **Connection supervision**: reconnect backoff, heartbeats, offline queue
//! - **Multi-device sync**: last-write-wins session state across devices
//!
//! ## Usage
//!
//! ```ignore
//! use tidewire_protocol::prelude::*;
//!
//! let sessions = Arc::new(SessionManager::new(local, identity, directory, config.session.clone()));
//! sessions.publish_prekeys(100).await?;
//!
//! let (link, mut events) = PeerLink::spawn(peer, sessions, connector, receipts, offline, config)?;
//! link.connect().await?;
//! let id = link.send_message(b"hello".to_vec()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     // LinkEvent::Delivered { id }, LinkEvent::Message { .. }, ...
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod fragment;
pub mod peer;
pub mod receipts;
pub mod session_manager;
pub mod supervisor;
pub mod sync;
pub mod transport;
pub mod wire;

pub use config::ProtocolConfig;
pub use error::{Disposition, ProtocolError, Result};
pub use peer::{LinkEvent, PeerLink};
pub use session_manager::SessionManager;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{
        ConnectionConfig, DeliveryConfig, FragmentConfig, ProtocolConfig, SessionConfig,
    };
    pub use crate::directory::{MemoryDirectory, PreKeyDirectory};
    pub use crate::error::{Disposition, ProtocolError, Result};
    pub use crate::peer::{LinkEvent, PeerLink};
    pub use crate::receipts::{ReceiptKind, ReceiptStatus, ReceiptTracker};
    pub use crate::session_manager::SessionManager;
    pub use crate::supervisor::{ConnectionState, ConnectionSupervisor, OfflineQueue};
    pub use crate::sync::{SessionSyncCoordinator, SessionSyncEvent, SyncEnvelope};
    pub use crate::transport::{Connector, LinkProfile, MemoryNetwork, Transport};
}
