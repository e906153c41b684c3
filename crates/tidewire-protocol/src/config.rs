//! Protocol configuration
//!
//! [`ProtocolConfig`] is built once and handed to constructors; nothing reads
//! global flags. Durations are stored as integer seconds or milliseconds so
//! the config round-trips through TOML.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tidewire_crypto::ratchet::{RatchetLimits, DEFAULT_MAX_SKIPPED_MESSAGE_KEYS};

use crate::wire::FRAME_OVERHEAD;

/// Complete configuration of the session and delivery layers
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Ratchet session settings
    pub session: SessionConfig,
    /// Fragmentation, reassembly and dedup settings
    pub fragment: FragmentConfig,
    /// Ack, retry and batching settings
    pub delivery: DeliveryConfig,
    /// Reconnect, heartbeat and offline queue settings
    pub connection: ConnectionConfig,
}

impl ProtocolConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.session.validate()?;
        self.fragment.validate()?;
        self.delivery.validate()?;
        self.connection.validate()?;
        Ok(())
    }
}

/// Ratchet session configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on cached skipped keys and on a single chain gap
    pub max_skipped_message_keys: u32,
    /// Bound on fetching a peer's pre-key bundle (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Handshakes remembered per peer so a recorded one cannot be answered
    /// twice
    pub max_answered_handshakes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_message_keys: DEFAULT_MAX_SKIPPED_MESSAGE_KEYS,
            handshake_timeout_ms: 10_000,
            max_answered_handshakes: 256,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_skipped_message_keys == 0 {
            return Err("max_skipped_message_keys must be greater than 0".to_string());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("handshake_timeout_ms must be greater than 0".to_string());
        }
        if self.max_answered_handshakes == 0 {
            return Err("max_answered_handshakes must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Limits passed to every ratchet session
    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_skipped_message_keys: self.max_skipped_message_keys,
        }
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Fragmentation and duplicate filtering configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Maximum payload bytes per fragment
    pub fragment_max_size: usize,
    /// Time a partial message may wait for its remaining fragments (seconds)
    pub reassembly_timeout_secs: u64,
    /// Ask the sender for missing fragments when reassembly stalls
    pub enable_nack: bool,
    /// Reject re-delivered fragments and acks
    pub enable_dedup: bool,
    /// How long a seen fragment or ack is remembered (seconds)
    pub dedup_window_secs: u64,
    /// Maximum remembered fragments and acks
    pub max_dedup_cache_size: usize,
    /// Partial messages buffered at once; the oldest is dropped beyond this
    pub max_pending_reassemblies: usize,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            fragment_max_size: 16 * 1024,
            reassembly_timeout_secs: 30,
            enable_nack: true,
            enable_dedup: true,
            dedup_window_secs: 60,
            max_dedup_cache_size: 10_000,
            max_pending_reassemblies: 64,
        }
    }
}

impl FragmentConfig {
    fn validate(&self) -> Result<(), String> {
        if self.fragment_max_size == 0 {
            return Err("fragment_max_size must be greater than 0".to_string());
        }
        if self.reassembly_timeout_secs == 0 {
            return Err("reassembly_timeout_secs must be greater than 0".to_string());
        }
        if self.max_pending_reassemblies == 0 {
            return Err("max_pending_reassemblies must be greater than 0".to_string());
        }
        if self.enable_dedup && self.max_dedup_cache_size == 0 {
            return Err("max_dedup_cache_size must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Transport payload size needed to carry a full fragment frame
    pub fn required_transport_payload(&self) -> usize {
        self.fragment_max_size + FRAME_OVERHEAD
    }

    /// Reassembly timeout
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    /// Dedup window
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Acknowledgement and retry configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Track deliveries and acknowledge received messages
    pub enable_acks: bool,
    /// Time to wait for an ack before retransmitting (seconds)
    pub ack_timeout_secs: u64,
    /// Retransmissions before a message is failed
    pub max_retries: u32,
    /// How long an acked or failed entry stays queryable (seconds)
    pub ack_grace_secs: u64,
    /// Maximum delay before pending acks are flushed (milliseconds)
    pub batch_ack_interval_ms: u64,
    /// Pending acks that trigger an immediate flush
    pub batch_ack_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enable_acks: true,
            ack_timeout_secs: 30,
            max_retries: 3,
            ack_grace_secs: 5,
            batch_ack_interval_ms: 100,
            batch_ack_size: 10,
        }
    }
}

impl DeliveryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.ack_timeout_secs == 0 {
            return Err("ack_timeout_secs must be greater than 0".to_string());
        }
        if self.batch_ack_size == 0 {
            return Err("batch_ack_size must be greater than 0".to_string());
        }
        if self.batch_ack_interval_ms == 0 {
            return Err("batch_ack_interval_ms must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Ack timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Grace period before acked entries are dropped
    pub fn ack_grace(&self) -> Duration {
        Duration::from_secs(self.ack_grace_secs)
    }

    /// Ack batch interval
    pub fn batch_ack_interval(&self) -> Duration {
        Duration::from_millis(self.batch_ack_interval_ms)
    }

    /// Time after which an unacknowledged message is failed
    pub fn delivery_deadline(&self) -> Duration {
        self.ack_timeout() * (self.max_retries + 1)
    }
}

/// Connection supervision configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Consecutive failed connection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay (milliseconds)
    pub base_reconnect_delay_ms: u64,
    /// Reconnect delay ceiling (milliseconds)
    pub max_reconnect_delay_ms: u64,
    /// Backoff multiplier
    pub reconnect_backoff_multiplier: f64,
    /// Bound on a single connection attempt (seconds)
    pub connect_timeout_secs: u64,
    /// Time between heartbeats (seconds)
    pub heartbeat_interval_secs: u64,
    /// Bound on a single heartbeat (seconds)
    pub heartbeat_timeout_secs: u64,
    /// Age at which queued outbound messages are discarded (seconds)
    pub offline_message_expiry_secs: u64,
    /// Maximum queued outbound messages per peer
    pub max_queued_messages: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            reconnect_backoff_multiplier: 2.0,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            offline_message_expiry_secs: 24 * 3600,
            max_queued_messages: 1000,
        }
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_reconnect_attempts == 0 {
            return Err("max_reconnect_attempts must be greater than 0".to_string());
        }
        if self.reconnect_backoff_multiplier < 1.0 {
            return Err("reconnect_backoff_multiplier must be at least 1.0".to_string());
        }
        if self.base_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err("base_reconnect_delay_ms must not exceed max_reconnect_delay_ms".to_string());
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_secs == 0 {
            return Err("heartbeat interval and timeout must be greater than 0".to_string());
        }
        if self.max_queued_messages == 0 {
            return Err("max_queued_messages must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Calculate delay before reconnect attempt `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_reconnect_delay_ms as f64
            * self.reconnect_backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_reconnect_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Offline queue expiry
    pub fn offline_message_expiry(&self) -> Duration {
        Duration::from_secs(self.offline_message_expiry_secs)
    }
}
