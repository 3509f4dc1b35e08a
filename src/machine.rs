//! Per-device connection state machine.
//!
//! The machine is driven one [`Message`] at a time by the device's session
//! task and is the only writer of the device's [`BrowseTree`] and addressed
//! [`PlayerModel`]. Browsing is serialized through the nested `Fetching`
//! state: one target at a time, one peer round trip per hop, bounded by a
//! timer that is rearmed on every intermediate response.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::event::{BrowserEvent, EventSink};
use crate::manager::lock;
use crate::msg::{Message, PeerEvent, Query, TimerKind};
use crate::player::{PlaybackSnapshot, PlayerModel};
use crate::session::MediaControls;
use crate::transport::{NotificationType, Transport};
use crate::tree::{BrowseTree, GlobalRoot, NodeKey, PeerItem};
use crate::types::{
    ConnectionState, DeviceAddress, FolderDirection, KeyCode, KeyState, PlayStatus, Scope,
};
use crate::volume::{self, VolumeControl};

/// Machine states. `Fetching` is nested under `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Connected,
    Fetching,
    Disconnecting,
}

/// In-flight fetch scope × newly requested scope pairs that cut the fetch short.
const ABORT_POLICY: &[(Scope, Scope)] = &[
    (Scope::PlayerList, Scope::PlayerList),
    (Scope::FileSystem, Scope::FileSystem),
    (Scope::Search, Scope::Search),
    (Scope::NowPlaying, Scope::NowPlaying),
    (Scope::FileSystem, Scope::PlayerList),
];

fn should_abort(in_flight: Scope, requested: Scope) -> bool {
    ABORT_POLICY.contains(&(in_flight, requested))
}

/// Shared collaborators every machine talks to.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub volume: Arc<dyn VolumeControl>,
    pub events: EventSink,
    pub global_root: Arc<Mutex<GlobalRoot>>,
}

/// Progress of the current fetch.
#[derive(Debug)]
struct Fetch {
    target: NodeKey,
    /// Hop whose peer command is outstanding.
    next_step: Option<NodeKey>,
    direction: Option<FolderDirection>,
    abort: bool,
}

/// One-shot timer that posts [`Message::Timeout`] back to the machine.
///
/// Each arm bumps the generation so a timeout that raced with a rearm or
/// cancel is recognisable as stale.
#[derive(Debug, Default)]
struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    fn arm(&mut self, mailbox: &mpsc::UnboundedSender<Message>, kind: TimerKind, after: Duration) {
        self.cancel();
        let generation = self.generation;
        let mailbox = mailbox.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = mailbox.send(Message::Timeout { kind, generation });
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }

    fn clear(&mut self) {
        self.task = None;
        self.generation += 1;
    }
}

pub(crate) struct ConnectionStateMachine {
    device: DeviceAddress,
    config: ControllerConfig,
    state: State,
    most_recent_state: ConnectionState,
    remote_control_connected: bool,
    browsing_connected: bool,
    tree: BrowseTree,
    addressed_player: PlayerModel,
    available_players: HashMap<i32, PlayerModel>,
    held_key: Option<KeyCode>,
    abs_vol_to_ignore: u32,
    abs_vol_label: Option<u8>,
    fetch: Option<Fetch>,
    deferred: VecDeque<Message>,
    fetch_timer: Timer,
    volume_timer: Timer,
    cleanup_requested: bool,
    collab: Collaborators,
    mailbox: mpsc::UnboundedSender<Message>,
}

impl ConnectionStateMachine {
    pub fn new(
        device: DeviceAddress,
        name: impl Into<String>,
        config: ControllerConfig,
        collab: Collaborators,
        mailbox: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let tree = BrowseTree::new(device, name, config.unknown_children);
        Self {
            device,
            config,
            state: State::Disconnected,
            most_recent_state: ConnectionState::Disconnected,
            remote_control_connected: false,
            browsing_connected: false,
            tree,
            addressed_player: PlayerModel::default(),
            available_players: HashMap::new(),
            held_key: None,
            abs_vol_to_ignore: 0,
            abs_vol_label: None,
            fetch: None,
            deferred: VecDeque::new(),
            fetch_timer: Timer::default(),
            volume_timer: Timer::default(),
            cleanup_requested: false,
            collab,
            mailbox,
        }
    }

    /// Broadcast view of the current state.
    pub fn connection_state(&self) -> ConnectionState {
        match self.state {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting => ConnectionState::Connecting,
            State::Connected | State::Fetching => ConnectionState::Connected,
            State::Disconnecting => ConnectionState::Disconnecting,
        }
    }

    /// Whether the machine asked to be removed from the registry.
    pub fn take_cleanup_request(&mut self) -> bool {
        std::mem::take(&mut self.cleanup_requested)
    }

    /// Release everything before the session task exits.
    pub fn teardown(&mut self) {
        self.fetch_timer.cancel();
        self.volume_timer.cancel();
        self.deferred.clear();
        self.available_players.clear();
        self.tree.clear();
    }

    /// Process one message to completion, then replay anything deferred
    /// while a fetch was in flight.
    pub fn handle(&mut self, msg: Message) {
        self.dispatch(msg);
        while self.state != State::Fetching {
            let Some(deferred) = self.deferred.pop_front() else {
                break;
            };
            trace!(device = %self.device, ?deferred, "Replaying deferred message");
            self.dispatch(deferred);
        }
    }

    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::Query(query) => self.answer(query),
            Message::Connect {
                remote_control,
                browsing,
            } => self.on_connect(remote_control, browsing),
            msg => match self.state {
                State::Disconnected => self.on_disconnected(msg),
                State::Connected => self.on_connected(msg),
                State::Fetching => self.on_fetching(msg),
                State::Connecting | State::Disconnecting => {
                    trace!(device = %self.device, ?msg, "Dropping message in transient state");
                }
            },
        }
    }

    fn post(&self, msg: Message) {
        let _ = self.mailbox.send(msg);
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition_to(&mut self, next: State) {
        let previous = self.state;
        if previous == State::Fetching && next != State::Fetching {
            self.fetch_timer.cancel();
            self.fetch = None;
        }
        self.state = next;
        debug!(device = %self.device, from = ?previous, to = ?next, "Transition");

        match next {
            State::Disconnected => {
                if self.most_recent_state != ConnectionState::Disconnected {
                    self.post(Message::Cleanup);
                }
                self.broadcast(ConnectionState::Disconnected);
            }
            State::Connecting => {
                self.broadcast(ConnectionState::Connecting);
                self.transition_to(State::Connected);
            }
            State::Connected => {
                if self.most_recent_state == ConnectionState::Connecting {
                    self.broadcast(ConnectionState::Connected);
                    self.collab.events.send(BrowserEvent::AddressedPlayerChanged {
                        device: self.device,
                        controls: MediaControls::new(self.device, self.mailbox.clone()),
                    });
                } else {
                    trace!(device = %self.device, "Re-entering Connected");
                }
            }
            State::Fetching => {}
            State::Disconnecting => {
                self.on_browsing_disconnected();
                self.broadcast(ConnectionState::Disconnecting);
                self.transition_to(State::Disconnected);
            }
        }
    }

    fn broadcast(&mut self, current: ConnectionState) {
        let previous = self.most_recent_state;
        info!(device = %self.device, %previous, %current, "Connection state changed");
        self.most_recent_state = current;
        self.collab.events.send(BrowserEvent::ConnectionStateChanged {
            device: self.device,
            previous,
            current,
        });
    }

    fn on_connect(&mut self, remote_control: bool, browsing: bool) {
        debug!(device = %self.device, remote_control, browsing, "Connect");
        if browsing && !self.browsing_connected {
            let snapshot = {
                let mut root = lock(&self.collab.global_root);
                root.attach(self.device, self.tree.root_item());
                root.snapshot()
            };
            self.collab.events.node_changed(Some(snapshot));
            self.collab
                .events
                .playback_changed(self.device, self.addressed_player.playback_state().clone());
            self.browsing_connected = true;
        }
        self.remote_control_connected = remote_control;

        if self.state == State::Disconnected {
            self.transition_to(State::Connecting);
        }
    }

    fn on_browsing_disconnected(&mut self) {
        self.deferred.clear();
        self.held_key = None;
        self.volume_timer.cancel();
        self.abs_vol_to_ignore = 0;
        if !self.browsing_connected {
            return;
        }
        self.addressed_player.update_play_status(PlayStatus::Error);
        self.addressed_player.update_current_track(None);

        let now_playing = self.tree.now_playing();
        self.tree.set_cached(now_playing, false);
        self.collab.events.node_changed(self.tree.snapshot(now_playing));
        self.collab
            .events
            .playback_changed(self.device, PlaybackSnapshot::disconnected());

        let snapshot = {
            let mut root = lock(&self.collab.global_root);
            root.detach(self.device);
            root.snapshot()
        };
        self.collab.events.node_changed(Some(snapshot));
        self.collab.events.track_changed(self.device, None);
        self.browsing_connected = false;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn answer(&mut self, query: Query) {
        match query {
            Query::Contents { id, reply } => {
                let contents = self.tree.find(&id).and_then(|key| {
                    if self.tree.node(key).is_some_and(|n| !n.is_cached()) {
                        self.post(Message::GetFolderItems(id.clone()));
                    }
                    self.tree.contents(key)
                });
                let _ = reply.send(contents);
            }
            Query::Node { id, reply } => {
                let snapshot = self.tree.find(&id).and_then(|key| self.tree.snapshot(key));
                let _ = reply.send(snapshot);
            }
            Query::State { reply } => {
                let _ = reply.send(self.connection_state());
            }
        }
    }

    // ========================================================================
    // Disconnected
    // ========================================================================

    fn on_disconnected(&mut self, msg: Message) {
        match msg {
            Message::Cleanup => {
                debug!(device = %self.device, "Cleanup requested");
                self.cleanup_requested = true;
            }
            msg => trace!(device = %self.device, ?msg, "Unhandled message in Disconnected"),
        }
    }

    // ========================================================================
    // Connected
    // ========================================================================

    fn on_connected(&mut self, msg: Message) {
        match msg {
            Message::Peer(PeerEvent::SetAbsoluteVolume { volume, label }) => {
                self.abs_vol_to_ignore += 1;
                self.volume_timer.arm(
                    &self.mailbox,
                    TimerKind::AbsoluteVolume,
                    self.config.abs_vol_timeout(),
                );
                self.set_abs_volume(volume, label);
            }
            Message::Peer(PeerEvent::RegisterAbsoluteVolume { label }) => {
                let peer_volume =
                    volume::local_to_peer(self.collab.volume.max(), self.collab.volume.current());
                debug!(device = %self.device, label, peer_volume, "RX: RegisterAbsoluteVolume");
                self.abs_vol_label = Some(label);
                self.collab.transport.send_register_absolute_volume_response(
                    self.device,
                    NotificationType::Interim,
                    peer_volume,
                    label,
                );
            }
            Message::LocalVolumeChanged => self.on_local_volume_changed(),
            Message::Timeout {
                kind: TimerKind::AbsoluteVolume,
                generation,
            } => {
                if self.volume_timer.is_current(generation) {
                    trace!(device = %self.device, "Absolute volume ack window closed");
                    self.volume_timer.clear();
                    self.abs_vol_to_ignore = 0;
                }
            }
            Message::GetFolderItems(id) => match self.tree.find(&id) {
                Some(target) => self.enter_fetching(target),
                None => warn!(device = %self.device, node = %id, "Fetch requested for unknown node"),
            },
            Message::RefreshNowPlaying | Message::Peer(PeerEvent::NowPlayingContentChanged) => {
                let now_playing = self.tree.now_playing();
                self.tree.set_cached(now_playing, false);
                let id = self
                    .tree
                    .node(now_playing)
                    .map(|n| n.id().to_string())
                    .unwrap_or_default();
                self.dispatch(Message::GetFolderItems(id));
            }
            Message::PlayItem(id) => match self.tree.find(&id) {
                Some(key) => self.play_item(key),
                None => warn!(device = %self.device, node = %id, "Invalid item to play"),
            },
            Message::PlayQueueItem(position) => match self.tree.track_from_now_playing(position) {
                Some(key) => self.play_item(key),
                None => warn!(device = %self.device, position, "No now-playing entry at position"),
            },
            Message::Passthrough(key) => self.passthrough(key),
            Message::GroupNavigation(key, state) => {
                self.collab
                    .transport
                    .send_group_navigation(self.device, key, state);
            }
            Message::PlayerApplicationSettings(settings) => {
                self.collab
                    .transport
                    .set_player_application_settings(self.device, &settings);
            }
            Message::SetAddressedPlayer(player_id) => {
                self.collab
                    .transport
                    .set_addressed_player(self.device, player_id);
            }
            Message::Peer(PeerEvent::TrackChanged(track)) => {
                debug!(device = %self.device, title = ?track.as_ref().and_then(|t| t.title.as_deref()), "RX: TrackChanged");
                self.addressed_player.update_current_track(track.clone());
                self.collab.events.track_changed(self.device, track);
            }
            Message::Peer(PeerEvent::PlayStatusChanged(status)) => {
                debug!(device = %self.device, ?status, "RX: PlayStatusChanged");
                self.addressed_player.update_play_status(status);
                self.collab
                    .events
                    .playback_changed(self.device, self.addressed_player.playback_state().clone());
            }
            Message::Peer(PeerEvent::PositionChanged {
                song_length_ms,
                position_ms,
            }) => {
                trace!(device = %self.device, ?song_length_ms, ?position_ms, "RX: PositionChanged");
                if position_ms.is_some() {
                    self.addressed_player.set_position(position_ms);
                    self.collab.events.playback_changed(
                        self.device,
                        self.addressed_player.playback_state().clone(),
                    );
                }
            }
            Message::Peer(PeerEvent::AddressedPlayerChanged { player_id }) => {
                self.on_addressed_player_changed(player_id);
            }
            Message::Peer(PeerEvent::AddressedPlayerSet {
                player_id,
                accepted,
            }) => {
                if accepted {
                    self.on_addressed_player_changed(player_id);
                } else {
                    warn!(device = %self.device, player_id, "Peer rejected addressed player");
                }
            }
            Message::Disconnect => self.transition_to(State::Disconnecting),
            Message::Peer(event) if event.is_fetch_response() => {
                debug!(device = %self.device, ?event, "Dropping stale fetch response");
            }
            msg => trace!(device = %self.device, ?msg, "Unhandled message in Connected"),
        }
    }

    fn on_addressed_player_changed(&mut self, player_id: i32) {
        debug!(device = %self.device, player_id, "RX: AddressedPlayerChanged");
        match self.available_players.get(&player_id) {
            Some(player) => {
                self.addressed_player = player.clone();
                if let Some(key) = self.tree.find_player(player_id) {
                    self.tree.set_current_addressed_player(key);
                }
                debug!(device = %self.device, name = %self.addressed_player.name(), "Addressed player");
                self.collab.transport.get_playback_state(self.device);
            }
            None => {
                let root = self.tree.root();
                self.tree.set_cached(root, false);
                self.tree
                    .set_expected_children(root, self.config.unknown_children);
                self.collab.events.node_changed(self.tree.snapshot(root));
            }
        }
    }

    fn play_item(&self, key: NodeKey) {
        let Some(node) = self.tree.node(key) else {
            return;
        };
        debug!(device = %self.device, node = %node.id(), "Play item");
        self.collab
            .transport
            .play_item(self.device, node.scope(), node.peer_item_id(), 0);
    }

    fn passthrough(&mut self, key: KeyCode) {
        debug!(device = %self.device, ?key, "Passthrough");
        let transport = &self.collab.transport;
        if let Some(held) = self.held_key.take() {
            transport.send_passthrough(self.device, held, KeyState::Released);
            if held == key {
                return;
            }
        }

        transport.send_passthrough(self.device, key, KeyState::Pressed);
        if key.is_held() {
            self.held_key = Some(key);
        } else {
            transport.send_passthrough(self.device, key, KeyState::Released);
        }
    }

    fn set_abs_volume(&mut self, peer_volume: u8, label: u8) {
        let max = self.collab.volume.max();
        let current = self.collab.volume.current();
        let new = volume::peer_to_local(max, peer_volume);
        debug!(
            device = %self.device,
            peer_volume,
            max,
            current,
            new,
            "RX: SetAbsoluteVolume"
        );
        // Small peer steps may not move the local index at all.
        if new != current {
            self.collab.volume.set(new);
        }
        self.collab
            .transport
            .send_absolute_volume_response(self.device, peer_volume, label);
    }

    fn on_local_volume_changed(&mut self) {
        if self.abs_vol_to_ignore > 0 {
            self.abs_vol_to_ignore -= 1;
            trace!(device = %self.device, "Ignoring volume change caused by peer");
            return;
        }
        let Some(label) = self.abs_vol_label else {
            return;
        };
        let peer_volume =
            volume::local_to_peer(self.collab.volume.max(), self.collab.volume.current());
        self.collab.transport.send_register_absolute_volume_response(
            self.device,
            NotificationType::Changed,
            peer_volume,
            label,
        );
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    fn enter_fetching(&mut self, target: NodeKey) {
        self.transition_to(State::Fetching);
        self.fetch = Some(Fetch {
            target,
            next_step: None,
            direction: None,
            abort: false,
        });
        self.arm_fetch_timer();
        self.navigate_or_retrieve();
    }

    fn arm_fetch_timer(&mut self) {
        self.fetch_timer
            .arm(&self.mailbox, TimerKind::Fetch, self.config.fetch_timeout());
    }

    fn on_fetching(&mut self, msg: Message) {
        let Some((target, abort)) = self.fetch.as_ref().map(|f| (f.target, f.abort)) else {
            self.transition_to(State::Connected);
            self.dispatch(msg);
            return;
        };

        match msg {
            Message::Peer(PeerEvent::FolderItems(items)) => {
                let received = items.len();
                self.tree.add_children(target, items);

                let count = self.tree.children_len(target);
                let end = self
                    .tree
                    .node(target)
                    .map_or(0, |n| n.expected_children().saturating_sub(1));
                debug!(device = %self.device, received, count, end, "RX: FolderItems");

                let complete = count >= end as usize || received == 0 || abort;
                if complete {
                    self.tree.set_cached(target, true);
                }
                // Every page is surfaced, partial or not.
                self.collab.events.node_changed(self.tree.snapshot(target));

                if complete {
                    self.transition_to(State::Connected);
                } else {
                    self.fetch_contents(target);
                    self.arm_fetch_timer();
                }
            }
            Message::Peer(PeerEvent::FolderItemsOutOfRange) => {
                debug!(device = %self.device, "RX: FolderItemsOutOfRange");
                self.tree.set_cached(target, true);
                self.collab.events.node_changed(self.tree.snapshot(target));
                self.transition_to(State::Connected);
            }
            Message::Peer(PeerEvent::PlayerItems(players)) => self.on_player_items(players),
            Message::Peer(PeerEvent::FolderPathChanged { item_count }) => {
                let (next_step, direction) = self
                    .fetch
                    .as_ref()
                    .map_or((None, None), |f| (f.next_step, f.direction));
                debug!(device = %self.device, item_count, ?direction, "RX: FolderPathChanged");
                let Some(next_step) = next_step else {
                    self.transition_to(State::Connected);
                    return;
                };
                self.tree.set_current_folder(next_step);
                self.tree.set_expected_children(next_step, item_count);

                if abort {
                    self.transition_to(State::Connected);
                } else {
                    self.arm_fetch_timer();
                    self.navigate_or_retrieve();
                }
            }
            Message::Peer(PeerEvent::BrowsedPlayerSet { item_count, depth }) => {
                debug!(device = %self.device, item_count, depth, "RX: BrowsedPlayerSet");
                let next_step = self.fetch.as_ref().and_then(|f| f.next_step);
                let entered = next_step.is_some_and(|player| {
                    self.tree
                        .set_current_browsed_player(player, item_count, depth)
                });
                if entered {
                    self.arm_fetch_timer();
                    self.navigate_or_retrieve();
                } else {
                    self.transition_to(State::Connected);
                }
            }
            Message::Timeout {
                kind: TimerKind::Fetch,
                generation,
            } => {
                if self.fetch_timer.is_current(generation) {
                    warn!(
                        device = %self.device,
                        fetched = self.tree.children_len(target),
                        "Fetch timed out"
                    );
                    self.transition_to(State::Connected);
                }
            }
            Message::GetFolderItems(id) => {
                let requested = self.tree.find(&id);
                if requested == Some(target) {
                    debug!(device = %self.device, node = %id, "Already fetching node, ignoring");
                    return;
                }
                let in_flight = self.tree.node(target).map(|n| n.scope());
                let wanted = requested.and_then(|k| self.tree.node(k)).map(|n| n.scope());
                if let (Some(in_flight), Some(wanted)) = (in_flight, wanted)
                    && should_abort(in_flight, wanted)
                    && let Some(fetch) = self.fetch.as_mut()
                {
                    fetch.abort = true;
                }
                debug!(device = %self.device, node = %id, "Deferring fetch behind current one");
                self.deferred.push_back(Message::GetFolderItems(id));
            }
            Message::Cleanup => {}
            msg => self.on_connected(msg),
        }
    }

    fn on_player_items(&mut self, players: Vec<PlayerModel>) {
        debug!(device = %self.device, count = players.len(), "RX: PlayerItems");
        let root = self.tree.root();
        if self.tree.node(root).is_some_and(|n| !n.is_cached()) {
            self.available_players = players.iter().map(|p| (p.id(), p.clone())).collect();
            let count = players.len() as u32;
            self.tree
                .add_children(root, players.into_iter().map(PeerItem::Player).collect());
            self.tree.set_current_folder(root);
            self.tree.set_expected_children(root, count);
            self.tree.set_cached(root, true);
            self.collab.events.node_changed(self.tree.snapshot(root));
        }
        self.transition_to(State::Connected);
    }

    /// Take the next hop toward the fetch target, or fetch it if already there.
    fn navigate_or_retrieve(&mut self) {
        let Some(target) = self.fetch.as_ref().map(|f| f.target) else {
            return;
        };
        let next_step = self.tree.next_step_toward(Some(target));
        if let Some(fetch) = self.fetch.as_mut() {
            fetch.next_step = next_step;
            fetch.direction = None;
        }
        debug!(
            device = %self.device,
            from = ?self.tree.current_folder(),
            toward = ?target,
            next = ?next_step,
            "Navigating"
        );

        // The fetch stays parked until its timer fires.
        let Some(next_step) = next_step else {
            warn!(device = %self.device, "Fetch target no longer reachable");
            return;
        };

        if target == self.tree.now_playing()
            || target == self.tree.root()
            || next_step == self.tree.current_folder()
        {
            self.fetch_contents(next_step);
        } else if self.tree.is_player(next_step) {
            let Some(node) = self.tree.node(next_step) else {
                return;
            };
            if node.is_browsable() {
                self.collab
                    .transport
                    .set_browsed_player(self.device, node.peer_item_id() as i32);
            } else {
                debug!(device = %self.device, "Player doesn't support browsing");
                self.tree.set_cached(next_step, true);
                self.transition_to(State::Connected);
            }
        } else if next_step == self.tree.navigate_up() {
            if !self.tree.is_player(target) {
                self.tree.decrement_depth();
            }
            let current = self.tree.current_folder();
            let parent = self.tree.node(current).and_then(|n| n.parent());
            if let Some(fetch) = self.fetch.as_mut() {
                fetch.next_step = parent;
                fetch.direction = Some(FolderDirection::Up);
            }
            self.tree.set_cached(current, false);
            self.collab
                .transport
                .change_folder_path(self.device, FolderDirection::Up, 0);
        } else {
            let uid = self.tree.node(next_step).map_or(0, |n| n.peer_item_id());
            if let Some(fetch) = self.fetch.as_mut() {
                fetch.direction = Some(FolderDirection::Down);
            }
            self.collab
                .transport
                .change_folder_path(self.device, FolderDirection::Down, uid);
        }
    }

    /// Request the next page of `key`'s contents.
    fn fetch_contents(&self, key: NodeKey) {
        let Some(node) = self.tree.node(key) else {
            return;
        };
        let start = node.children().len() as u32;
        let end = node
            .expected_children()
            .min(start + self.config.page_size)
            .saturating_sub(1);
        let transport = &self.collab.transport;
        match node.scope() {
            Scope::PlayerList => transport.get_player_list(self.device, start, end),
            Scope::NowPlaying => transport.get_now_playing_list(self.device, start, end),
            Scope::FileSystem => transport.get_folder_list(self.device, start, end),
            Scope::Search => {
                warn!(device = %self.device, "Search scope cannot be fetched here");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use crate::player::features;
    use crate::transport::{CommandSink, PeerCommand};

    const ADDR: DeviceAddress = DeviceAddress([0xAA, 0xBB, 0xCC, 0, 0, 1]);

    /// Volume stream that counts writes.
    struct CountingVolume {
        current: AtomicU32,
        sets: AtomicUsize,
    }

    impl VolumeControl for CountingVolume {
        fn max(&self) -> u32 {
            15
        }
        fn current(&self) -> u32 {
            self.current.load(Ordering::SeqCst)
        }
        fn set(&self, value: u32) {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.current.store(value, Ordering::SeqCst);
        }
    }

    struct Harness {
        machine: ConnectionStateMachine,
        commands: mpsc::UnboundedReceiver<(DeviceAddress, PeerCommand)>,
        events: mpsc::UnboundedReceiver<BrowserEvent>,
        mailbox: mpsc::UnboundedReceiver<Message>,
        volume: Arc<CountingVolume>,
        global_root: Arc<Mutex<GlobalRoot>>,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, commands) = CommandSink::new();
            let (event_tx, events) = mpsc::unbounded_channel();
            let (mailbox_tx, mailbox) = mpsc::unbounded_channel();
            let volume = Arc::new(CountingVolume {
                current: AtomicU32::new(0),
                sets: AtomicUsize::new(0),
            });
            let global_root = Arc::new(Mutex::new(GlobalRoot::default()));
            let collab = Collaborators {
                transport: Arc::new(sink),
                volume: volume.clone(),
                events: EventSink::new(event_tx),
                global_root: global_root.clone(),
            };
            let machine = ConnectionStateMachine::new(
                ADDR,
                "Phone",
                ControllerConfig::default(),
                collab,
                mailbox_tx,
            );
            Self {
                machine,
                commands,
                events,
                mailbox,
                volume,
                global_root,
            }
        }

        fn connected() -> Self {
            let mut h = Self::new();
            h.machine.handle(Message::Connect {
                remote_control: true,
                browsing: true,
            });
            h.events();
            h
        }

        fn commands(&mut self) -> Vec<PeerCommand> {
            let mut out = Vec::new();
            while let Ok((device, command)) = self.commands.try_recv() {
                assert_eq!(device, ADDR);
                out.push(command);
            }
            out
        }

        fn events(&mut self) -> Vec<BrowserEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Feed everything the machine posted to itself.
        fn pump_mailbox(&mut self) {
            while let Ok(msg) = self.mailbox.try_recv() {
                self.machine.handle(msg);
            }
        }

        fn peer(&mut self, event: PeerEvent) {
            self.machine.handle(Message::Peer(event));
        }

        fn request(&mut self, key: NodeKey) {
            let id = self.machine.tree.node(key).unwrap().id().to_string();
            self.machine.handle(Message::GetFolderItems(id));
        }

        /// Root populated with a browsable player A (id 1) and a plain player B (id 2).
        fn with_players(&mut self) -> (NodeKey, NodeKey) {
            let root = self.machine.tree.root();
            self.request(root);
            assert_eq!(self.commands(), vec![PeerCommand::GetPlayerList { start: 0, end: 19 }]);
            self.peer(PeerEvent::PlayerItems(vec![
                PlayerModel::new(1, "A", bitmap(&[features::BROWSING]), PlayStatus::Stopped),
                PlayerModel::new(2, "B", Vec::new(), PlayStatus::Stopped),
            ]));
            let children = self.machine.tree.node(root).unwrap().children().to_vec();
            (children[0], children[1])
        }
    }

    fn bitmap(bits: &[u32]) -> Vec<u8> {
        let mut map = vec![0u8; 16];
        for &bit in bits {
            map[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        map
    }

    fn tracks(range: std::ops::Range<u64>) -> Vec<PeerItem> {
        range
            .map(|uid| PeerItem::Track {
                uid,
                title: format!("track {uid}"),
            })
            .collect()
    }

    fn folders(range: std::ops::Range<u64>) -> Vec<PeerItem> {
        range
            .map(|uid| PeerItem::Folder {
                uid,
                name: format!("folder {uid}"),
                playable: false,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_broadcasts_and_installs_controls() {
        let mut h = Harness::new();
        h.machine.handle(Message::Connect {
            remote_control: true,
            browsing: true,
        });
        assert_eq!(h.machine.connection_state(), ConnectionState::Connected);

        let events = h.events();
        assert!(matches!(&events[0], BrowserEvent::NodeChanged(s) if s.items.len() == 1));
        assert!(matches!(
            &events[1],
            BrowserEvent::PlaybackStateChanged { state, .. } if state.error.is_none()
        ));
        assert!(matches!(
            events[2],
            BrowserEvent::ConnectionStateChanged {
                previous: ConnectionState::Disconnected,
                current: ConnectionState::Connecting,
                ..
            }
        ));
        assert!(matches!(
            events[3],
            BrowserEvent::ConnectionStateChanged {
                current: ConnectionState::Connected,
                ..
            }
        ));
        assert!(matches!(events[4], BrowserEvent::AddressedPlayerChanged { .. }));
        assert_eq!(events.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_grafts_once() {
        let mut h = Harness::connected();
        h.machine.handle(Message::Connect {
            remote_control: true,
            browsing: true,
        });

        assert_eq!(lock(&h.global_root).snapshot().items.len(), 1);
        // Second connect is silent: no graft, no state change.
        assert!(h.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_converges() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.machine.tree.set_expected_children(np, 45);

        h.request(np);
        assert_eq!(h.commands(), vec![PeerCommand::GetNowPlayingList { start: 0, end: 19 }]);
        h.peer(PeerEvent::FolderItems(tracks(0..20)));
        assert_eq!(h.commands(), vec![PeerCommand::GetNowPlayingList { start: 20, end: 39 }]);
        h.peer(PeerEvent::FolderItems(tracks(20..40)));
        assert_eq!(h.commands(), vec![PeerCommand::GetNowPlayingList { start: 40, end: 44 }]);
        h.peer(PeerEvent::FolderItems(tracks(40..45)));
        assert!(h.commands().is_empty());

        let node = h.machine.tree.node(np).unwrap();
        assert_eq!(node.children().len(), 45);
        assert!(node.is_cached());
        assert_eq!(h.machine.state, State::Connected);

        let listings: Vec<_> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BrowserEvent::NodeChanged(s) => Some((s.items.len(), s.cached)),
                _ => None,
            })
            .collect();
        assert_eq!(listings, vec![(20, false), (40, false), (45, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_terminates_fetch() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();

        h.request(np);
        h.commands();
        h.peer(PeerEvent::FolderItems(tracks(0..20)));
        h.commands();
        h.peer(PeerEvent::FolderItems(Vec::new()));

        assert!(h.commands().is_empty());
        assert!(h.machine.tree.node(np).unwrap().is_cached());
        assert_eq!(h.machine.tree.children_len(np), 20);
        assert_eq!(h.machine.state, State::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_marks_cached() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.peer(PeerEvent::FolderItemsOutOfRange);
        assert!(h.machine.tree.node(np).unwrap().is_cached());
        assert_eq!(h.machine.state, State::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn player_list_populates_root_once() {
        let mut h = Harness::connected();
        let (a, b) = h.with_players();
        let root = h.machine.tree.root();

        let node = h.machine.tree.node(root).unwrap();
        assert!(node.is_cached());
        assert_eq!(node.expected_children(), 2);
        assert!(h.machine.tree.node(a).unwrap().is_browsable());
        assert!(!h.machine.tree.node(b).unwrap().is_browsable());
        assert_eq!(h.machine.state, State::Connected);

        // A cached root ignores a second listing.
        h.request(root);
        h.commands();
        h.peer(PeerEvent::PlayerItems(vec![PlayerModel::new(9, "Z", Vec::new(), PlayStatus::Stopped)]));
        assert_eq!(h.machine.tree.children_len(root), 2);
        assert_eq!(h.machine.state, State::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn browsing_into_player_and_folder() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();

        h.request(a);
        assert_eq!(h.commands(), vec![PeerCommand::SetBrowsedPlayer(1)]);
        h.peer(PeerEvent::BrowsedPlayerSet { item_count: 3, depth: 0 });
        assert_eq!(h.commands(), vec![PeerCommand::GetFolderList { start: 0, end: 2 }]);
        h.peer(PeerEvent::FolderItems(folders(100..103)));
        assert!(h.machine.tree.node(a).unwrap().is_cached());
        assert_eq!(h.machine.tree.current_folder(), a);

        let x = h.machine.tree.node(a).unwrap().children()[1];
        h.request(x);
        assert_eq!(
            h.commands(),
            vec![PeerCommand::ChangeFolderPath { direction: FolderDirection::Down, uid: 101 }]
        );
        h.peer(PeerEvent::FolderPathChanged { item_count: 2 });
        assert_eq!(h.machine.tree.current_folder(), x);
        assert_eq!(h.machine.tree.depth(), 0);
        assert_eq!(h.commands(), vec![PeerCommand::GetFolderList { start: 0, end: 1 }]);
        h.peer(PeerEvent::FolderItems(tracks(0..2)));
        assert!(h.machine.tree.node(x).unwrap().is_cached());

        // Entered folders don't count as depth; the player is set directly.
        h.request(a);
        assert_eq!(h.commands(), vec![PeerCommand::SetBrowsedPlayer(1)]);
        assert!(h.machine.tree.node(x).unwrap().is_cached());
    }

    #[tokio::test(start_paused = true)]
    async fn non_browsable_player_is_terminal() {
        let mut h = Harness::connected();
        let (_, b) = h.with_players();

        h.request(b);
        assert!(h.commands().is_empty());
        assert!(h.machine.tree.node(b).unwrap().is_cached());
        assert_eq!(h.machine.tree.contents(b), Some(Vec::new()));
        assert_eq!(h.machine.state, State::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn climbs_out_of_reported_depth_before_listing_player() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();

        h.request(a);
        h.commands();
        h.peer(PeerEvent::BrowsedPlayerSet { item_count: 5, depth: 2 });
        assert_eq!(
            h.commands(),
            vec![PeerCommand::ChangeFolderPath { direction: FolderDirection::Up, uid: 0 }]
        );
        h.peer(PeerEvent::FolderPathChanged { item_count: 4 });
        assert_eq!(
            h.commands(),
            vec![PeerCommand::ChangeFolderPath { direction: FolderDirection::Up, uid: 0 }]
        );
        h.peer(PeerEvent::FolderPathChanged { item_count: 3 });
        assert_eq!(h.machine.tree.current_folder(), a);
        assert_eq!(h.machine.tree.depth(), 0);
        assert_eq!(h.commands(), vec![PeerCommand::GetFolderList { start: 0, end: 2 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_waits_for_timeout() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();
        h.request(a);
        h.peer(PeerEvent::BrowsedPlayerSet { item_count: 3, depth: 0 });
        h.peer(PeerEvent::FolderItems(folders(100..103)));
        let x = h.machine.tree.node(a).unwrap().children()[0];
        h.request(x);
        h.commands();

        // The target is evicted while the hop into it is outstanding.
        h.machine.tree.set_cached(a, false);
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.peer(PeerEvent::FolderPathChanged { item_count: 2 });

        assert!(h.commands().is_empty());
        assert_eq!(h.machine.state, State::Fetching);
        assert_eq!(h.machine.tree.current_folder(), a);

        tokio::time::sleep(Duration::from_secs(11)).await;
        h.pump_mailbox();
        assert_eq!(
            h.commands(),
            vec![PeerCommand::GetNowPlayingList { start: 0, end: 19 }]
        );
        assert_eq!(h.machine.state, State::Fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_content() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();

        h.request(np);
        h.peer(PeerEvent::FolderItems(tracks(0..20)));
        assert_eq!(h.machine.state, State::Fetching);

        tokio::time::sleep(Duration::from_secs(11)).await;
        h.pump_mailbox();

        assert_eq!(h.machine.state, State::Connected);
        assert_eq!(h.machine.tree.children_len(np), 20);
        assert!(!h.machine.tree.node(np).unwrap().is_cached());
    }

    #[tokio::test(start_paused = true)]
    async fn intermediate_response_rearms_timeout() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();

        h.request(np);
        tokio::time::sleep(Duration::from_secs(8)).await;
        h.pump_mailbox();
        h.peer(PeerEvent::FolderItems(tracks(0..20)));

        tokio::time::sleep(Duration::from_secs(8)).await;
        h.pump_mailbox();
        assert_eq!(h.machine.state, State::Fetching);

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.pump_mailbox();
        assert_eq!(h.machine.state, State::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn player_list_request_aborts_folder_fetch() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();
        h.request(a);
        h.peer(PeerEvent::BrowsedPlayerSet { item_count: 2, depth: 0 });
        h.peer(PeerEvent::FolderItems(folders(100..102)));
        let x = h.machine.tree.node(a).unwrap().children()[0];

        h.request(x);
        h.peer(PeerEvent::FolderPathChanged { item_count: 100 });
        h.commands();

        // Root was cached by the player listing; invalidate it so the
        // replayed request really fetches.
        let root = h.machine.tree.root();
        h.machine.tree.set_cached(root, false);
        h.request(root);
        assert!(h.machine.fetch.as_ref().unwrap().abort);
        assert_eq!(h.machine.deferred.len(), 1);

        h.peer(PeerEvent::FolderItems(folders(200..220)));
        let node = h.machine.tree.node(x).unwrap();
        assert_eq!(node.children().len(), 20);
        assert!(node.is_cached());

        // The deferred player-list request ran as soon as the fetch ended.
        assert_eq!(h.machine.state, State::Fetching);
        assert_eq!(h.commands(), vec![PeerCommand::GetPlayerList { start: 0, end: 1 }]);
        assert!(h.machine.deferred.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn now_playing_request_does_not_abort_folder_fetch() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();
        h.request(a);
        h.peer(PeerEvent::BrowsedPlayerSet { item_count: 60, depth: 0 });
        h.commands();

        let np = h.machine.tree.now_playing();
        h.request(np);
        assert!(!h.machine.fetch.as_ref().unwrap().abort);

        h.peer(PeerEvent::FolderItems(folders(0..20)));
        assert_eq!(h.commands(), vec![PeerCommand::GetFolderList { start: 20, end: 39 }]);
        assert_eq!(h.machine.deferred.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_node_request_is_ignored() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.commands();
        h.request(np);

        assert!(h.commands().is_empty());
        assert!(h.machine.deferred.is_empty());
        assert!(!h.machine.fetch.as_ref().unwrap().abort);
    }

    #[tokio::test(start_paused = true)]
    async fn control_messages_pass_through_while_fetching() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.commands();

        h.machine.handle(Message::Passthrough(KeyCode::Play));
        assert_eq!(
            h.commands(),
            vec![
                PeerCommand::Passthrough { key: KeyCode::Play, state: KeyState::Pressed },
                PeerCommand::Passthrough { key: KeyCode::Play, state: KeyState::Released },
            ]
        );
        assert_eq!(h.machine.state, State::Fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn held_keys_release_before_next_press() {
        let mut h = Harness::connected();
        h.machine.handle(Message::Passthrough(KeyCode::FastForward));
        h.machine.handle(Message::Passthrough(KeyCode::Rewind));
        h.machine.handle(Message::Passthrough(KeyCode::FastForward));

        use KeyState::{Pressed, Released};
        let pt = |key, state| PeerCommand::Passthrough { key, state };
        assert_eq!(
            h.commands(),
            vec![
                pt(KeyCode::FastForward, Pressed),
                pt(KeyCode::FastForward, Released),
                pt(KeyCode::Rewind, Pressed),
                pt(KeyCode::Rewind, Released),
                pt(KeyCode::FastForward, Pressed),
            ]
        );
        assert_eq!(h.machine.held_key, Some(KeyCode::FastForward));

        // Pressing the held key again only releases it.
        h.machine.handle(Message::Passthrough(KeyCode::FastForward));
        assert_eq!(h.commands(), vec![pt(KeyCode::FastForward, Released)]);
        assert_eq!(h.machine.held_key, None);
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_volume_applies_once() {
        let mut h = Harness::connected();
        h.peer(PeerEvent::SetAbsoluteVolume { volume: 64, label: 3 });
        assert_eq!(h.volume.current(), 8);
        assert_eq!(h.volume.sets.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.commands(),
            vec![PeerCommand::AbsoluteVolumeResponse { volume: 64, label: 3 }]
        );

        h.peer(PeerEvent::SetAbsoluteVolume { volume: 64, label: 4 });
        assert_eq!(h.volume.sets.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.commands(),
            vec![PeerCommand::AbsoluteVolumeResponse { volume: 64, label: 4 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn local_volume_echo_is_suppressed() {
        let mut h = Harness::connected();
        h.peer(PeerEvent::RegisterAbsoluteVolume { label: 7 });
        assert_eq!(
            h.commands(),
            vec![PeerCommand::RegisterAbsoluteVolumeResponse {
                response: NotificationType::Interim,
                volume: 0,
                label: 7,
            }]
        );

        h.peer(PeerEvent::SetAbsoluteVolume { volume: 127, label: 1 });
        h.commands();
        h.machine.handle(Message::LocalVolumeChanged);
        assert!(h.commands().is_empty());

        h.machine.handle(Message::LocalVolumeChanged);
        assert_eq!(
            h.commands(),
            vec![PeerCommand::RegisterAbsoluteVolumeResponse {
                response: NotificationType::Changed,
                volume: 127,
                label: 7,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn volume_ack_timeout_clears_ignore_counter() {
        let mut h = Harness::connected();
        h.peer(PeerEvent::RegisterAbsoluteVolume { label: 2 });
        h.peer(PeerEvent::SetAbsoluteVolume { volume: 64, label: 1 });
        h.commands();
        assert_eq!(h.machine.abs_vol_to_ignore, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.pump_mailbox();
        assert_eq!(h.machine.abs_vol_to_ignore, 0);

        h.machine.handle(Message::LocalVolumeChanged);
        assert_eq!(h.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn track_and_status_reach_front_end() {
        let mut h = Harness::connected();
        let track = crate::TrackMetadata {
            title: Some("Song".into()),
            track_number: Some(2),
            ..Default::default()
        };
        h.peer(PeerEvent::TrackChanged(Some(track.clone())));
        h.peer(PeerEvent::PlayStatusChanged(PlayStatus::Playing));
        h.peer(PeerEvent::PositionChanged { song_length_ms: Some(1000), position_ms: None });

        let events = h.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], BrowserEvent::TrackChanged { track: Some(t), .. } if *t == track));
        assert!(matches!(
            &events[1],
            BrowserEvent::PlaybackStateChanged { state, .. }
                if state.status == PlayStatus::Playing && state.active_queue_item == Some(1)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn addressed_player_change() {
        let mut h = Harness::connected();
        let (a, _) = h.with_players();
        h.events();

        h.peer(PeerEvent::AddressedPlayerChanged { player_id: 1 });
        assert_eq!(h.machine.addressed_player.name(), "A");
        assert_eq!(h.machine.tree.current_addressed_player(), Some(a));
        assert_eq!(h.commands(), vec![PeerCommand::GetPlaybackState]);

        // An unknown player means the player list is stale.
        h.peer(PeerEvent::AddressedPlayerChanged { player_id: 42 });
        let root = h.machine.tree.root();
        let node = h.machine.tree.node(root).unwrap();
        assert!(!node.is_cached());
        assert!(node.children().is_empty());
        assert_eq!(node.expected_children(), 255);
        assert!(matches!(&h.events()[..], [BrowserEvent::NodeChanged(s)] if s.items.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn play_queue_item_uses_now_playing_scope() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.peer(PeerEvent::FolderItems(tracks(10..13)));
        h.peer(PeerEvent::FolderItems(Vec::new()));
        h.commands();

        h.machine.handle(Message::PlayQueueItem(1));
        assert_eq!(
            h.commands(),
            vec![PeerCommand::PlayItem { scope: Scope::NowPlaying, uid: 11, uid_counter: 0 }]
        );
        h.machine.handle(Message::PlayQueueItem(7));
        assert!(h.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn now_playing_change_refetches() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.peer(PeerEvent::FolderItems(tracks(0..3)));
        h.peer(PeerEvent::FolderItems(Vec::new()));
        h.commands();

        h.peer(PeerEvent::NowPlayingContentChanged);
        assert_eq!(h.machine.tree.children_len(np), 0);
        assert_eq!(h.machine.state, State::Fetching);
        assert_eq!(h.commands(), vec![PeerCommand::GetNowPlayingList { start: 0, end: 19 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn contents_query_requests_fetch_when_uncached() {
        let mut h = Harness::connected();
        let np_id = h
            .machine
            .tree
            .node(h.machine.tree.now_playing())
            .unwrap()
            .id()
            .to_string();

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.machine.handle(Message::Query(Query::Contents { id: np_id, reply: tx }));
        assert_eq!(rx.await.unwrap(), None);

        h.pump_mailbox();
        assert_eq!(h.machine.state, State::Fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tears_down_browsing() {
        let mut h = Harness::connected();
        let np = h.machine.tree.now_playing();
        h.request(np);
        h.peer(PeerEvent::FolderItems(tracks(0..5)));
        h.request(h.machine.tree.root());
        h.events();

        h.machine.handle(Message::Disconnect);
        assert_eq!(h.machine.connection_state(), ConnectionState::Disconnected);
        assert!(h.machine.deferred.is_empty());
        assert!(lock(&h.global_root).snapshot().items.is_empty());
        assert_eq!(h.machine.tree.children_len(np), 0);

        let events = h.events();
        assert!(events.iter().any(|e| matches!(
            e,
            BrowserEvent::PlaybackStateChanged { state, .. } if state.status == PlayStatus::Error
        )));
        assert!(events.iter().any(|e| matches!(e, BrowserEvent::TrackChanged { track: None, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            BrowserEvent::ConnectionStateChanged { current: ConnectionState::Disconnecting, .. }
        )));

        h.pump_mailbox();
        assert!(h.machine.take_cleanup_request());
        assert!(!h.machine.take_cleanup_request());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_before_cleanup_keeps_machine() {
        let mut h = Harness::connected();
        h.machine.handle(Message::Disconnect);
        h.machine.handle(Message::Connect {
            remote_control: true,
            browsing: true,
        });
        assert_eq!(h.machine.connection_state(), ConnectionState::Connected);

        // The queued cleanup arrives too late to matter.
        h.pump_mailbox();
        assert!(!h.machine.take_cleanup_request());
        assert_eq!(lock(&h.global_root).snapshot().items.len(), 1);
    }

    #[test]
    fn abort_policy_is_asymmetric() {
        assert!(should_abort(Scope::FileSystem, Scope::FileSystem));
        assert!(should_abort(Scope::FileSystem, Scope::PlayerList));
        assert!(should_abort(Scope::NowPlaying, Scope::NowPlaying));
        assert!(!should_abort(Scope::PlayerList, Scope::FileSystem));
        assert!(!should_abort(Scope::FileSystem, Scope::NowPlaying));
        assert!(!should_abort(Scope::NowPlaying, Scope::PlayerList));
    }
}
