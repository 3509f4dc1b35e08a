//! Fake peer.
//!
//! Drives a `DeviceRegistry` against a scripted in-process peer that answers
//! browse and playback commands from a small canned library, printing each
//! node listing as it arrives.
//!
//! Run with: RUST_LOG=info cargo run --bin fake_peer
//! Run with debug: RUST_LOG=avrctl=debug,fake_peer=debug cargo run --bin fake_peer [config.toml]

use std::sync::Arc;
use std::time::Duration;

use avrctl::player::features;
use avrctl::tree::{NOW_PLAYING_PREFIX, ROOT_ID};
use avrctl::{
    BrowserEvent, CommandSink, ControllerConfig, DeviceAddress, DeviceRegistry, FolderDirection,
    KeyCode, KeyState, NodeSnapshot, PeerCommand, PeerEvent, PeerItem, PlayStatus, PlayerModel,
    TrackMetadata,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Canned library
// ============================================================================

#[derive(Debug)]
enum Entry {
    Folder { uid: u64, name: String, children: Vec<Entry> },
    Track { uid: u64, title: String },
}

impl Entry {
    fn as_item(&self) -> PeerItem {
        match self {
            Entry::Folder { uid, name, .. } => PeerItem::Folder {
                uid: *uid,
                name: name.clone(),
                playable: false,
            },
            Entry::Track { uid, title } => PeerItem::Track {
                uid: *uid,
                title: title.clone(),
            },
        }
    }
}

fn tracks(first_uid: u64, count: u64, prefix: &str) -> Vec<Entry> {
    (0..count)
        .map(|i| Entry::Track {
            uid: first_uid + i,
            title: format!("{prefix} {}", i + 1),
        })
        .collect()
}

fn library() -> Vec<Entry> {
    vec![
        Entry::Folder {
            uid: 10,
            name: "Albums".into(),
            children: tracks(100, 3, "Album track"),
        },
        Entry::Folder {
            uid: 20,
            name: "Playlists".into(),
            children: tracks(200, 25, "Playlist track"),
        },
    ]
}

fn players() -> Vec<PlayerModel> {
    let mut bitmap = vec![0u8; 16];
    bitmap[(features::BROWSING / 8) as usize] |= 1 << (features::BROWSING % 8);
    vec![
        PlayerModel::new(1, "Music", bitmap, PlayStatus::Stopped),
        PlayerModel::new(2, "Radio", Vec::new(), PlayStatus::Stopped),
    ]
}

// ============================================================================
// Peer
// ============================================================================

struct FakePeer {
    library: Vec<Entry>,
    now_playing: Vec<Entry>,
    /// Indices into `library` of the open folder.
    path: Vec<usize>,
}

impl FakePeer {
    fn new() -> Self {
        Self {
            library: library(),
            now_playing: tracks(300, 5, "Queued"),
            path: Vec::new(),
        }
    }

    fn folder(&self) -> &[Entry] {
        let mut entries = self.library.as_slice();
        for &i in &self.path {
            match entries.get(i) {
                Some(Entry::Folder { children, .. }) => entries = children,
                _ => return &[],
            }
        }
        entries
    }

    fn page(entries: &[Entry], start: u32, end: u32) -> PeerEvent {
        let start = start as usize;
        if start >= entries.len() {
            return PeerEvent::FolderItemsOutOfRange;
        }
        let end = (end as usize + 1).min(entries.len());
        PeerEvent::FolderItems(entries[start..end].iter().map(Entry::as_item).collect())
    }

    fn respond(&mut self, command: PeerCommand) -> Vec<PeerEvent> {
        match command {
            PeerCommand::GetPlayerList { start, end } => {
                let players = players();
                let end = (end as usize + 1).min(players.len());
                let start = (start as usize).min(end);
                vec![PeerEvent::PlayerItems(players[start..end].to_vec())]
            }
            PeerCommand::SetBrowsedPlayer(_) => {
                self.path.clear();
                vec![PeerEvent::BrowsedPlayerSet {
                    item_count: self.library.len() as u32,
                    depth: 0,
                }]
            }
            PeerCommand::ChangeFolderPath { direction, uid } => {
                match direction {
                    FolderDirection::Up => {
                        self.path.pop();
                    }
                    FolderDirection::Down => {
                        let found = self.folder().iter().position(
                            |e| matches!(e, Entry::Folder { uid: u, .. } if *u == uid),
                        );
                        match found {
                            Some(i) => self.path.push(i),
                            None => warn!(uid, "No such folder"),
                        }
                    }
                }
                vec![PeerEvent::FolderPathChanged {
                    item_count: self.folder().len() as u32,
                }]
            }
            PeerCommand::GetFolderList { start, end } => vec![Self::page(self.folder(), start, end)],
            PeerCommand::GetNowPlayingList { start, end } => {
                vec![Self::page(&self.now_playing, start, end)]
            }
            PeerCommand::GetPlaybackState => vec![
                PeerEvent::PlayStatusChanged(PlayStatus::Paused),
                PeerEvent::PositionChanged {
                    song_length_ms: Some(180_000),
                    position_ms: Some(0),
                },
            ],
            PeerCommand::Passthrough {
                key,
                state: KeyState::Pressed,
            } => match key {
                KeyCode::Play => vec![PeerEvent::PlayStatusChanged(PlayStatus::Playing)],
                KeyCode::Pause => vec![PeerEvent::PlayStatusChanged(PlayStatus::Paused)],
                KeyCode::Stop => vec![PeerEvent::PlayStatusChanged(PlayStatus::Stopped)],
                _ => Vec::new(),
            },
            PeerCommand::PlayItem { uid, .. } => {
                let position = self.now_playing.iter().position(
                    |e| matches!(e, Entry::Track { uid: u, .. } if *u == uid),
                );
                let track = TrackMetadata {
                    title: Some(format!("Item {uid}")),
                    track_number: position.map(|p| p as u64 + 1),
                    total_tracks: Some(self.now_playing.len() as u64),
                    ..Default::default()
                };
                vec![
                    PeerEvent::TrackChanged(Some(track)),
                    PeerEvent::PlayStatusChanged(PlayStatus::Playing),
                ]
            }
            other => {
                debug!(command = ?other, "No scripted response");
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

async fn wait_for_listing(
    events: &mut mpsc::UnboundedReceiver<BrowserEvent>,
    id: &str,
) -> Option<NodeSnapshot> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                BrowserEvent::NodeChanged(node) if node.id == id && node.cached => return Some(node),
                BrowserEvent::NodeChanged(node) => {
                    debug!(node = %node.id, items = node.items.len(), "Partial listing");
                }
                BrowserEvent::PlaybackStateChanged { state, .. } => {
                    info!(status = ?state.status, position = ?state.position_ms, "Playback");
                }
                BrowserEvent::TrackChanged { track, .. } => {
                    info!(title = ?track.and_then(|t| t.title), "Track");
                }
                BrowserEvent::ConnectionStateChanged { current, .. } => {
                    info!(%current, "Connection");
                }
                BrowserEvent::AddressedPlayerChanged { .. } => {}
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .ok()
        .flatten()
}

fn print_listing(node: &NodeSnapshot) {
    println!("{} ({} items)", node.title, node.items.len());
    for item in &node.items {
        println!("  {:<24} {:?}", item.title, item.kind);
    }
}

fn child_id(node: &NodeSnapshot, title: &str) -> Option<String> {
    node.items
        .iter()
        .find(|item| item.title == title)
        .map(|item| item.id.clone())
}

#[tokio::main]
async fn main() -> avrctl::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    info!(?config, "Starting fake peer");

    let (transport, mut commands) = CommandSink::new();
    let (registry, mut events) = DeviceRegistry::new(config, Arc::new(transport));
    let registry = Arc::new(registry);
    let addr: DeviceAddress = "AA:BB:CC:DD:EE:01".parse()?;

    // Peer side: answer every command the controller sends.
    let peer_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut peer = FakePeer::new();
        while let Some((device, command)) = commands.recv().await {
            for event in peer.respond(command) {
                if let Err(e) = peer_registry.peer_event(device, event) {
                    warn!(error = %e, "Peer event not delivered");
                }
            }
        }
    });

    registry.on_connection_state_changed(addr, true, true)?;
    let Some(session) = registry.session(addr) else {
        return Err(avrctl::Error::UnknownDevice(addr));
    };
    let root = registry.root_snapshot();
    print_listing(&root);

    let mut browse = format!("{ROOT_ID}{addr}");
    for title in ["Music", "Playlists"] {
        session.request_contents(&browse)?;
        let Some(node) = wait_for_listing(&mut events, &browse).await else {
            warn!(node = %browse, "Listing never completed");
            break;
        };
        print_listing(&node);
        match child_id(&node, title) {
            Some(id) => browse = id,
            None => {
                warn!(title, "Not found");
                break;
            }
        }
    }
    session.request_contents(&browse)?;
    if let Some(node) = wait_for_listing(&mut events, &browse).await {
        print_listing(&node);
    }

    let now_playing = format!("{NOW_PLAYING_PREFIX}{addr}");
    session.refresh_now_playing()?;
    if let Some(node) = wait_for_listing(&mut events, &now_playing).await {
        print_listing(&node);
    }

    let controls = session.controls();
    controls.skip_to_queue_item(2)?;
    controls.fast_forward()?;
    controls.pause()?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        debug!(?event, "Event");
    }

    if registry.disconnect(addr).await? {
        info!(device = %addr, "Disconnect requested");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        devices = registry.device_count(),
        state = %registry.connection_state(addr).await,
        "Done"
    );
    Ok(())
}
