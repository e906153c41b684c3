//! # Tidewire Core
//!
//! Shared identifiers and persistence traits for the Tidewire session and
//! delivery layers.
//!
//! This crate provides:
//! - User, device, message and session identifiers
//! - Storage traits for session snapshots and receipts
//! - Common error types

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use types::{DeviceId, MessageId, PeerAddress, SessionId, Timestamp, UserId};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::storage::{MemoryStorage, ReceiptStore, SessionStore};
    pub use crate::types::{DeviceId, MessageId, PeerAddress, SessionId, Timestamp, UserId};
}
