//! Local volume stream the peer's absolute volume is mapped onto.

use std::sync::atomic::{AtomicU32, Ordering};

/// Access to the local audio output volume.
pub trait VolumeControl: Send + Sync {
    /// Highest volume step.
    fn max(&self) -> u32;
    fn current(&self) -> u32;
    fn set(&self, value: u32);
}

/// In-memory volume stream.
#[derive(Debug)]
pub struct LocalVolume {
    max: u32,
    current: AtomicU32,
}

impl LocalVolume {
    pub fn new(max: u32, current: u32) -> Self {
        Self {
            max,
            current: AtomicU32::new(current.min(max)),
        }
    }
}

impl VolumeControl for LocalVolume {
    fn max(&self) -> u32 {
        self.max
    }

    fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    fn set(&self, value: u32) {
        self.current.store(value.min(self.max), Ordering::Relaxed);
    }
}

/// Peer volume scale maximum.
pub const ABS_VOL_BASE: u32 = 127;

/// Map a peer volume (0..=127) onto a local scale of `0..=max`, rounding to nearest.
pub fn peer_to_local(max: u32, peer: u8) -> u32 {
    let peer = u32::from(peer).min(ABS_VOL_BASE);
    (max * peer + ABS_VOL_BASE / 2) / ABS_VOL_BASE
}

/// Map a local volume onto the peer scale.
pub fn local_to_peer(max: u32, local: u32) -> u8 {
    if max == 0 {
        return 0;
    }
    let local = local.min(max);
    ((local * ABS_VOL_BASE + max / 2) / max) as u8
}
