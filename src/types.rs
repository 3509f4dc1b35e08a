//! Core data types for avrctl.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::Error;

/// 48-bit hardware address identifying a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            if part.len() != 2 {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| Error::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Browsing scope a node's contents are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Scope {
    PlayerList = 0,
    FileSystem = 1,
    Search = 2,
    NowPlaying = 3,
}

/// Passthrough key codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyCode {
    VolumeUp = 0x41,
    VolumeDown = 0x42,
    Play = 0x44,
    Stop = 0x45,
    Pause = 0x46,
    Rewind = 0x48,
    FastForward = 0x49,
    Forward = 0x4B,
    Backward = 0x4C,
}

impl KeyCode {
    /// Keys that stay pressed until released explicitly or superseded.
    pub fn is_held(self) -> bool {
        matches!(self, KeyCode::FastForward | KeyCode::Rewind)
    }
}

/// Passthrough key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyState {
    Pressed = 0,
    Released = 1,
}

/// Direction of a change-folder-path command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FolderDirection {
    Up = 0,
    Down = 1,
}

/// Playback status reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayStatus {
    Stopped,
    Playing,
    Paused,
    FwdSeek,
    RevSeek,
    Error,
    #[default]
    None,
}

impl From<u8> for PlayStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => PlayStatus::Stopped,
            1 => PlayStatus::Playing,
            2 => PlayStatus::Paused,
            3 => PlayStatus::FwdSeek,
            4 => PlayStatus::RevSeek,
            0xFF => PlayStatus::Error,
            _ => PlayStatus::None,
        }
    }
}

impl PlayStatus {
    /// Playback speed implied by the status.
    pub fn speed(self) -> f32 {
        match self {
            PlayStatus::Playing => 1.0,
            PlayStatus::FwdSeek => 3.0,
            PlayStatus::RevSeek => -3.0,
            _ => 0.0,
        }
    }
}

/// Connection state broadcast for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}
