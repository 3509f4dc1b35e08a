//! Controller configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Tunables for every device's state machine.
///
/// All fields are optional in TOML; missing fields take the protocol
/// defaults.
///
/// ```toml
/// page_size = 20
/// fetch_timeout_ms = 10000
/// local_max_volume = 15
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Maximum items requested per folder page.
    pub page_size: u32,
    /// Bound on a single fetch round trip; rearmed on each intermediate response.
    pub fetch_timeout_ms: u64,
    /// How long set-absolute-volume echoes are suppressed.
    pub abs_vol_timeout_ms: u64,
    /// Expected child count for a folder the peer has not described yet.
    pub unknown_children: u32,
    /// Maximum step of the local volume stream.
    pub local_max_volume: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            fetch_timeout_ms: 10_000,
            abs_vol_timeout_ms: 1_000,
            unknown_children: 255,
            local_max_volume: 15,
        }
    }
}

impl ControllerConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn abs_vol_timeout(&self) -> Duration {
        Duration::from_millis(self.abs_vol_timeout_ms)
    }
}
