//! Error types for avrctl.

use thiserror::Error;

use crate::types::DeviceAddress;

/// Main error type for avrctl operations.
///
/// Peer misbehaviour (timeouts, malformed responses, unreachable folders) is
/// absorbed by the state machine and never surfaces here.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The device's session task has stopped.
    #[error("session closed: {0}")]
    SessionClosed(DeviceAddress),

    /// No session exists for the device.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceAddress),

    /// A device address string could not be parsed.
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
}
