//! CLI configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tidewire_protocol::config::ProtocolConfig;
use tidewire_protocol::transport::LinkProfile;

/// CLI configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Simulated network
    pub network: NetworkConfig,
    /// Simulated traffic
    pub traffic: TrafficConfig,
    /// Protocol settings used by both simulated peers
    pub protocol: ProtocolConfig,
}

/// Impairments of the simulated link
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Probability a frame is dropped
    pub loss: f64,
    /// Probability a frame is delivered twice
    pub duplicate: f64,
    /// Probability a frame is delayed
    pub reorder: f64,
    /// Longest delay (milliseconds)
    pub max_delay_ms: u64,
    /// Largest frame the link carries
    pub max_payload: usize,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss: 0.05,
            duplicate: 0.02,
            reorder: 0.1,
            max_delay_ms: 200,
            max_payload: 64 * 1024,
            seed: None,
        }
    }
}

impl NetworkConfig {
    /// Link profile for the in-memory network
    pub fn profile(&self) -> LinkProfile {
        LinkProfile {
            loss: self.loss,
            duplicate: self.duplicate,
            reorder: self.reorder,
            max_delay_ms: self.max_delay_ms,
            max_payload: self.max_payload,
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (name, p) in [
            ("loss", self.loss),
            ("duplicate", self.duplicate),
            ("reorder", self.reorder),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("{} must be between 0 and 1", name));
            }
        }
        Ok(())
    }
}

/// Messages sent during a simulation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Messages sent from the first peer to the second
    pub messages: usize,
    /// Body size in bytes
    pub message_size: usize,
    /// Whether the receiver answers each message with a READ receipt
    pub read_receipts: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            messages: 100,
            message_size: 2048,
            read_receipts: true,
        }
    }
}

impl CliConfig {
    /// Load config from file or create default
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: CliConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            config.save(path)?;

            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.network.validate()?;
        self.protocol.validate()
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("tidewire");
        path.push("config.toml");
        path
    }
}
