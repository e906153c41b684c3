//! Identifiers shared by every Tidewire crate

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_id! {
    /// Account name as the directory knows it
    UserId
}

name_id! {
    /// Name of one of a user's devices
    ///
    /// Ordered so that last-write-wins ties break the same way everywhere.
    DeviceId
}

/// Shared by every fragment, ack and receipt of one message
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Random v4 id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex chars, for logs
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One endpoint: a device of a user
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// The user
    pub user_id: UserId,
    /// One of the user's devices
    pub device_id: DeviceId,
}

impl PeerAddress {
    /// Address of `device_id` belonging to `user_id`
    pub fn new(user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Key under which the session with one peer device is stored
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// `user:device`
    pub fn for_peer(peer: &PeerAddress) -> Self {
        Self(format!("{}:{}", peer.user_id, peer.device_id))
    }

    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    /// Borrow the key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock time in unix milliseconds
///
/// Only used where devices compare times with each other; local timers use
/// tokio's monotonic clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// From unix milliseconds
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Unix milliseconds
    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f UTC")),
            None => write!(f, "{}ms", self.0),
        }
    }
}
