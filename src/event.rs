//! Notifications delivered to the browsing front end.
//!
//! Every device reports onto one shared unbounded channel; events are sent
//! synchronously from inside the state machine step that caused them, so the
//! front end never sees a node between two peer responses.

use tokio::sync::mpsc;
use tracing::trace;

use crate::player::{PlaybackSnapshot, TrackMetadata};
use crate::session::MediaControls;
use crate::tree::NodeSnapshot;
use crate::types::{ConnectionState, DeviceAddress};

/// Events from the controller to the front end.
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// A node's listing or cache state changed.
    NodeChanged(NodeSnapshot),

    /// The peer loaded a different track, or none.
    TrackChanged {
        device: DeviceAddress,
        track: Option<TrackMetadata>,
    },

    /// Playback status or position changed.
    PlaybackStateChanged {
        device: DeviceAddress,
        state: PlaybackSnapshot,
    },

    /// A device became controllable; transport actions go through `controls`.
    AddressedPlayerChanged {
        device: DeviceAddress,
        controls: MediaControls,
    },

    /// Broadcast connection state changed.
    ConnectionStateChanged {
        device: DeviceAddress,
        previous: ConnectionState,
        current: ConnectionState,
    },
}

/// Sending half of the front-end channel.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<BrowserEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BrowserEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: BrowserEvent) {
        // The front end going away is not an error for the controller.
        if self.tx.send(event).is_err() {
            trace!("Front end receiver dropped");
        }
    }

    pub fn node_changed(&self, snapshot: Option<NodeSnapshot>) {
        if let Some(snapshot) = snapshot {
            self.send(BrowserEvent::NodeChanged(snapshot));
        }
    }

    pub fn playback_changed(&self, device: DeviceAddress, state: PlaybackSnapshot) {
        self.send(BrowserEvent::PlaybackStateChanged { device, state });
    }

    pub fn track_changed(&self, device: DeviceAddress, track: Option<TrackMetadata>) {
        self.send(BrowserEvent::TrackChanged { device, track });
    }
}
