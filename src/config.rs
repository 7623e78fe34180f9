//! Simulation configuration
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid. CLI flags are applied on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::swarm::common::{SwarmError, DEFAULT_REFRESH_INTERVAL};

/// Top-level configuration shared by the tracker and every peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Segments fetched between two swarm refreshes
    pub refresh_interval: usize,

    /// Selection attempts per segment before the file is given up
    pub max_source_attempts: u32,

    /// Base delay between selection attempts in milliseconds (doubles per attempt)
    pub source_retry_backoff_ms: u64,

    /// Simulated transfer time of one segment on the uploader side
    pub serve_delay_ms: u64,

    /// Compare served segment hashes with the tracker's manifest
    pub verify_hashes: bool,

    /// Message substrate settings
    pub transport: TransportConfig,
}

/// Settings of the in-process message substrate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of each logical channel
    pub channel_capacity: usize,

    /// How long a send may wait for channel space, in milliseconds
    pub send_timeout_ms: u64,

    /// Extra attempts after a send timed out
    pub send_retries: u32,

    /// Base backoff between send attempts in milliseconds
    pub retry_backoff_ms: u64,

    /// How long a peer waits for a reply on its download channel, in
    /// milliseconds (None = block until a message arrives)
    pub recv_timeout_ms: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_source_attempts: 5,
            source_retry_backoff_ms: 20,
            serve_delay_ms: 0,
            verify_hashes: true,
            transport: TransportConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            send_timeout_ms: 1_000,
            send_retries: 3,
            retry_backoff_ms: 50,
            recv_timeout_ms: None,
        }
    }
}

impl SimConfig {
    /// Reads a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, SwarmError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SwarmError> {
        let config: SimConfig = serde_json::from_str(raw)
            .map_err(|e| SwarmError::Config(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.refresh_interval == 0 {
            return Err(SwarmError::Config("refresh_interval must be at least 1".into()));
        }
        if self.max_source_attempts == 0 {
            return Err(SwarmError::Config("max_source_attempts must be at least 1".into()));
        }
        self.transport.validate()
    }

    pub fn with_refresh_interval(mut self, interval: usize) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_serve_delay_ms(mut self, delay_ms: u64) -> Self {
        self.serve_delay_ms = delay_ms;
        self
    }

    pub fn source_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.source_retry_backoff_ms)
    }

    pub fn serve_delay(&self) -> Duration {
        Duration::from_millis(self.serve_delay_ms)
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.channel_capacity == 0 {
            return Err(SwarmError::Config("channel_capacity must be at least 1".into()));
        }
        if self.send_timeout_ms == 0 {
            return Err(SwarmError::Config("send_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}
