//! Messages processed by a device's state machine.
//!
//! - [`PeerEvent`] - asynchronous events and responses from the peer
//! - [`Message`] - everything queued on a device, including local intents

use tokio::sync::oneshot;

use crate::player::{PlayerModel, TrackMetadata};
use crate::transport::GroupKey;
use crate::tree::{BrowseItem, NodeSnapshot, PeerItem};
use crate::types::{ConnectionState, KeyCode, KeyState, PlayStatus};

/// Events and responses arriving from the peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The loaded track changed.
    TrackChanged(Option<TrackMetadata>),
    /// Play status changed.
    PlayStatusChanged(PlayStatus),
    /// Playback position changed; `None` when the peer does not know.
    PositionChanged {
        song_length_ms: Option<u64>,
        position_ms: Option<u64>,
    },
    /// The peer sets our absolute volume (0..=127).
    SetAbsoluteVolume { volume: u8, label: u8 },
    /// The peer registers for volume-changed notifications.
    RegisterAbsoluteVolume { label: u8 },
    /// A page of a folder or now-playing listing.
    FolderItems(Vec<PeerItem>),
    /// The requested range lies beyond the end of the listing.
    FolderItemsOutOfRange,
    /// A page of the player list.
    PlayerItems(Vec<PlayerModel>),
    /// A change-folder-path command completed.
    FolderPathChanged { item_count: u32 },
    /// A set-browsed-player command completed.
    BrowsedPlayerSet { item_count: u32, depth: u32 },
    /// A set-addressed-player command completed.
    AddressedPlayerSet { player_id: i32, accepted: bool },
    /// The peer switched its addressed player.
    AddressedPlayerChanged { player_id: i32 },
    /// The now-playing list changed.
    NowPlayingContentChanged,
}

impl PeerEvent {
    /// Events that belong to an in-flight fetch.
    pub(crate) fn is_fetch_response(&self) -> bool {
        matches!(
            self,
            PeerEvent::FolderItems(_)
                | PeerEvent::FolderItemsOutOfRange
                | PeerEvent::PlayerItems(_)
                | PeerEvent::FolderPathChanged { .. }
                | PeerEvent::BrowsedPlayerSet { .. }
        )
    }
}

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Fetch,
    AbsoluteVolume,
}

/// Read-only questions answered by the session task.
#[derive(Debug)]
pub(crate) enum Query {
    /// Listing of the node with this id, requesting a fetch if not cached.
    Contents {
        id: String,
        reply: oneshot::Sender<Option<Vec<BrowseItem>>>,
    },
    /// Snapshot of the node with this id.
    Node {
        id: String,
        reply: oneshot::Sender<Option<NodeSnapshot>>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Everything a device's queue carries.
#[derive(Debug)]
pub(crate) enum Message {
    Connect {
        remote_control: bool,
        browsing: bool,
    },
    Disconnect,
    /// Posted to itself on entering Disconnected.
    Cleanup,
    /// Fetch the contents of the node with this id.
    GetFolderItems(String),
    /// Invalidate and refetch now playing.
    RefreshNowPlaying,
    Passthrough(KeyCode),
    GroupNavigation(GroupKey, KeyState),
    PlayerApplicationSettings(Vec<(u8, u8)>),
    SetAddressedPlayer(i32),
    /// Play the node with this id.
    PlayItem(String),
    /// Play the now-playing entry at this position.
    PlayQueueItem(usize),
    /// The local volume stream moved.
    LocalVolumeChanged,
    Peer(PeerEvent),
    Timeout {
        kind: TimerKind,
        generation: u64,
    },
    Query(Query),
    /// Stop the session task without cleanup.
    Shutdown,
}
