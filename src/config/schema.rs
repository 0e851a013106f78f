//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::codec::wire::DEFAULT_MAX_FRAME_SIZE;
use crate::net::{Destination, Mode};

/// Root configuration for the transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection pool settings.
    pub pool: PoolConfig,

    /// Mode used for destinations without an override.
    pub default_mode: Mode,

    /// Per-destination overrides.
    pub destinations: Vec<DestinationConfig>,

    /// Frame codec settings.
    pub codec: CodecConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            default_mode: Mode::Multiplexed,
            destinations: Vec::new(),
            codec: CodecConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Mode configured for `destination`.
    pub fn mode_for(&self, destination: &Destination) -> Mode {
        self.destinations
            .iter()
            .find(|d| {
                d.address
                    .parse::<Destination>()
                    .is_ok_and(|parsed| &parsed == destination)
            })
            .map(|d| d.mode)
            .unwrap_or(self.default_mode)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle exclusive connections kept per destination.
    pub max_idle_per_destination: usize,

    /// Dial timeout in milliseconds (0 disables the bound).
    pub dial_timeout_ms: u64,

    /// Idle exclusive connections older than this are dropped (0 = never).
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_destination: 8,
            dial_timeout_ms: 5000,
            idle_timeout_secs: 90,
        }
    }
}

/// Mode override for one destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DestinationConfig {
    /// Destination as `host:port`.
    pub address: String,

    /// Connection discipline for this destination.
    pub mode: Mode,
}

/// Frame codec configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest frame payload accepted or produced, in bytes.
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Record metrics through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
