//! Browse tree: an in-memory, lazily populated mirror of the peer's
//! player / folder / track hierarchy.
//!
//! Nodes live in an arena owned by [`BrowseTree`] and refer to each other by
//! [`NodeKey`]. The id index maps the stable string ids handed to the front
//! end onto arena keys. Contents arrive one page at a time and a node is
//! only `cached` once the peer has delivered everything it is going to.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::player::PlayerModel;
use crate::types::{DeviceAddress, Scope};

/// Id of the global root that device roots are grafted under.
pub const ROOT_ID: &str = "__ROOT__";
/// Id of the navigate-up sentinel.
pub const UP_ID: &str = "__UP__";
/// Prefix of a device's now-playing node id.
pub const NOW_PLAYING_PREFIX: &str = "NOW_PLAYING";

/// Opaque arena handle for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Root,
    NowPlayingRoot,
    NavigateUp,
    Player,
    Folder,
    Track,
}

/// One item delivered by the peer in a listing.
#[derive(Debug, Clone)]
pub enum PeerItem {
    Folder { uid: u64, name: String, playable: bool },
    Track { uid: u64, title: String },
    Player(PlayerModel),
}

/// A node of the browse tree.
#[derive(Debug, Clone)]
pub struct BrowseNode {
    id: String,
    kind: NodeKind,
    title: String,
    scope: Scope,
    device: DeviceAddress,
    cached: bool,
    expected_children: u32,
    children: Vec<NodeKey>,
    parent: Option<NodeKey>,
    peer_item_id: u64,
    browsable: bool,
    playable: bool,
}

impl BrowseNode {
    fn new(id: String, kind: NodeKind, title: String, device: DeviceAddress, unknown: u32) -> Self {
        Self {
            id,
            kind,
            title,
            scope: Scope::FileSystem,
            device,
            cached: false,
            expected_children: unknown,
            children: Vec::new(),
            parent: None,
            peer_item_id: 0,
            browsable: true,
            playable: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn device(&self) -> DeviceAddress {
        self.device
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn expected_children(&self) -> u32 {
        self.expected_children
    }

    pub fn children(&self) -> &[NodeKey] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub fn peer_item_id(&self) -> u64 {
        self.peer_item_id
    }

    pub fn is_browsable(&self) -> bool {
        self.browsable
    }

    pub fn is_player(&self) -> bool {
        self.kind == NodeKind::Player
    }

    fn item(&self) -> BrowseItem {
        BrowseItem {
            id: self.id.clone(),
            title: self.title.clone(),
            kind: self.kind,
            browsable: self.browsable,
            playable: self.playable,
        }
    }
}

// ============================================================================
// Front-end views
// ============================================================================

/// Listing entry as shown to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowseItem {
    pub id: String,
    pub title: String,
    pub kind: NodeKind,
    pub browsable: bool,
    pub playable: bool,
}

/// A node together with its current child listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub title: String,
    pub kind: NodeKind,
    pub scope: Scope,
    pub device: Option<DeviceAddress>,
    pub cached: bool,
    pub expected_children: u32,
    pub items: Vec<BrowseItem>,
}

impl NodeSnapshot {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// Tree
// ============================================================================

/// Per-device browse tree.
#[derive(Debug)]
pub struct BrowseTree {
    device: DeviceAddress,
    unknown_children: u32,
    nodes: HashMap<NodeKey, BrowseNode>,
    index: HashMap<String, NodeKey>,
    next_key: u64,
    root: NodeKey,
    now_playing: NodeKey,
    navigate_up: NodeKey,
    current_folder: NodeKey,
    current_browsed_player: Option<NodeKey>,
    current_addressed_player: Option<NodeKey>,
    depth: u32,
}

impl BrowseTree {
    /// Create a tree seeded with the root, now-playing and navigate-up nodes.
    pub fn new(device: DeviceAddress, name: impl Into<String>, unknown_children: u32) -> Self {
        let mut tree = Self {
            device,
            unknown_children,
            nodes: HashMap::new(),
            index: HashMap::new(),
            next_key: 0,
            root: NodeKey(0),
            now_playing: NodeKey(0),
            navigate_up: NodeKey(0),
            current_folder: NodeKey(0),
            current_browsed_player: None,
            current_addressed_player: None,
            depth: 0,
        };
        tree.seed(name.into());
        tree
    }

    fn seed(&mut self, name: String) {
        let mut root = BrowseNode::new(
            format!("{ROOT_ID}{}", self.device),
            NodeKind::Root,
            name,
            self.device,
            self.unknown_children,
        );
        root.scope = Scope::PlayerList;
        self.root = self.insert(root, true);

        let mut now_playing = BrowseNode::new(
            format!("{NOW_PLAYING_PREFIX}{}", self.device),
            NodeKind::NowPlayingRoot,
            NOW_PLAYING_PREFIX.to_string(),
            self.device,
            self.unknown_children,
        );
        now_playing.scope = Scope::NowPlaying;
        self.now_playing = self.insert(now_playing, true);

        let up = BrowseNode::new(
            UP_ID.to_string(),
            NodeKind::NavigateUp,
            UP_ID.to_string(),
            self.device,
            0,
        );
        self.navigate_up = self.insert(up, false);

        self.current_folder = self.root;
    }

    fn insert(&mut self, node: BrowseNode, indexed: bool) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        if indexed {
            self.index.insert(node.id.clone(), key);
        }
        self.nodes.insert(key, node);
        key
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn now_playing(&self) -> NodeKey {
        self.now_playing
    }

    pub fn navigate_up(&self) -> NodeKey {
        self.navigate_up
    }

    pub fn node(&self, key: NodeKey) -> Option<&BrowseNode> {
        self.nodes.get(&key)
    }

    /// Resolve a front-end id to a live node.
    pub fn find(&self, id: &str) -> Option<NodeKey> {
        self.index.get(id).copied()
    }

    /// Number of ids currently resolvable.
    pub fn indexed_len(&self) -> usize {
        self.index.len()
    }

    pub fn children_len(&self, key: NodeKey) -> usize {
        self.nodes.get(&key).map_or(0, |n| n.children.len())
    }

    pub fn is_player(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).is_some_and(BrowseNode::is_player)
    }

    /// Find the player node advertising `player_id`.
    pub fn find_player(&self, player_id: i32) -> Option<NodeKey> {
        let root = self.nodes.get(&self.root)?;
        root.children.iter().copied().find(|k| {
            self.nodes
                .get(k)
                .is_some_and(|n| n.is_player() && n.peer_item_id == player_id as u64)
        })
    }

    /// Child of the now-playing list at `position`.
    pub fn track_from_now_playing(&self, position: usize) -> Option<NodeKey> {
        self.nodes.get(&self.now_playing)?.children.get(position).copied()
    }

    /// Append peer-delivered items under `parent`, returning how many were added.
    pub fn add_children(&mut self, parent: NodeKey, items: Vec<PeerItem>) -> usize {
        let Some(parent_node) = self.nodes.get(&parent) else {
            warn!(?parent, "Adding children to a node that no longer exists");
            return 0;
        };
        let inherit_scope = parent_node.scope == Scope::NowPlaying;
        let parent_scope = parent_node.scope;

        let mut added = 0;
        for item in items {
            let id = Uuid::new_v4().to_string();
            let mut node = match item {
                PeerItem::Folder { uid, name, playable } => {
                    let mut node =
                        BrowseNode::new(id, NodeKind::Folder, name, self.device, self.unknown_children);
                    node.peer_item_id = uid;
                    node.playable = playable;
                    node
                }
                PeerItem::Track { uid, title } => {
                    let mut node = BrowseNode::new(id, NodeKind::Track, title, self.device, 0);
                    node.peer_item_id = uid;
                    node.browsable = false;
                    node.playable = true;
                    node
                }
                PeerItem::Player(player) => {
                    let mut node = BrowseNode::new(
                        id,
                        NodeKind::Player,
                        player.name().to_string(),
                        self.device,
                        self.unknown_children,
                    );
                    node.peer_item_id = player.id() as u64;
                    node.browsable = player.is_browsable();
                    node
                }
            };
            if inherit_scope {
                node.scope = parent_scope;
            }
            node.parent = Some(parent);
            let key = self.insert(node, true);
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.push(key);
            }
            added += 1;
        }
        trace!(?parent, added, "Added children");
        added
    }

    pub fn set_expected_children(&mut self, key: NodeKey, count: u32) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.expected_children = count;
        }
    }

    /// Mark a node cached or invalidate it.
    ///
    /// Invalidation detaches the node's direct children and drops them from
    /// the id index. Deeper descendants keep their index entries.
    pub fn set_cached(&mut self, key: NodeKey, cached: bool) {
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };
        node.cached = cached;
        if cached {
            return;
        }

        let children = std::mem::take(&mut node.children);
        for child in &children {
            if let Some(child_node) = self.nodes.get(child)
                && self.index.get(&child_node.id) == Some(child)
            {
                self.index.remove(&child_node.id);
            }
        }
        if !children.is_empty() {
            debug!(node = %self.nodes[&key].id, evicted = children.len(), "Invalidated node");
            self.collect_garbage();
        }
    }

    /// Drop arena nodes that are neither attached to the tree, still
    /// indexed, nor on the parent chain of a current position or indexed node.
    fn collect_garbage(&mut self) {
        let mut live = HashSet::new();
        let mut stack = vec![self.root, self.now_playing, self.navigate_up];
        while let Some(key) = stack.pop() {
            if live.insert(key)
                && let Some(node) = self.nodes.get(&key)
            {
                stack.extend(node.children.iter().copied());
            }
        }

        let anchors = [
            Some(self.current_folder),
            self.current_browsed_player,
            self.current_addressed_player,
        ];
        let indexed: Vec<NodeKey> = self.index.values().copied().collect();
        for anchor in anchors.into_iter().flatten().chain(indexed) {
            let mut cursor = Some(anchor);
            while let Some(key) = cursor {
                let Some(node) = self.nodes.get(&key) else {
                    break;
                };
                if live.insert(key) {
                    // Detached subtrees under an anchor stay reachable for
                    // navigation back up, but not by id.
                    stack.extend(node.children.iter().copied());
                }
                cursor = node.parent;
            }
        }
        while let Some(key) = stack.pop() {
            if live.insert(key)
                && let Some(node) = self.nodes.get(&key)
            {
                stack.extend(node.children.iter().copied());
            }
        }

        self.nodes.retain(|key, _| live.contains(key));
    }

    /// Current listing of a node, or `None` when nothing has been fetched yet.
    pub fn contents(&self, key: NodeKey) -> Option<Vec<BrowseItem>> {
        let node = self.nodes.get(&key)?;
        if node.children.is_empty() && !node.cached {
            return None;
        }
        Some(
            node.children
                .iter()
                .filter_map(|k| self.nodes.get(k))
                .map(BrowseNode::item)
                .collect(),
        )
    }

    pub fn snapshot(&self, key: NodeKey) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&key)?;
        Some(NodeSnapshot {
            id: node.id.clone(),
            title: node.title.clone(),
            kind: node.kind,
            scope: node.scope,
            device: Some(node.device),
            cached: node.cached,
            expected_children: node.expected_children,
            items: node
                .children
                .iter()
                .filter_map(|k| self.nodes.get(k))
                .map(BrowseNode::item)
                .collect(),
        })
    }

    /// Listing entry for this device's root, as grafted under the global root.
    pub fn root_item(&self) -> BrowseItem {
        self.nodes[&self.root].item()
    }

    pub fn current_folder(&self) -> NodeKey {
        self.current_folder
    }

    /// Make `key` the open folder. Fails for nodes that no longer exist.
    pub fn set_current_folder(&mut self, key: NodeKey) -> bool {
        if !self.nodes.contains_key(&key) {
            warn!(?key, "Setting an unknown current folder");
            return false;
        }
        self.current_folder = key;
        true
    }

    pub fn current_browsed_player(&self) -> Option<NodeKey> {
        self.current_browsed_player
    }

    /// Enter `player`, which the peer reports as `depth` folders deep with
    /// `items` entries in the innermost one.
    ///
    /// The intermediate folders are unknown, so a chain of placeholder nodes
    /// stands in for them; they are never indexed.
    pub fn set_current_browsed_player(&mut self, player: NodeKey, items: u32, depth: u32) -> bool {
        if !self.is_player(player) {
            warn!(?player, "Setting an unknown browsed player");
            return false;
        }
        self.current_browsed_player = Some(player);
        self.current_folder = player;
        for level in 0..depth {
            let mut placeholder = BrowseNode::new(
                level.to_string(),
                NodeKind::Folder,
                level.to_string(),
                self.device,
                self.unknown_children,
            );
            placeholder.parent = Some(self.current_folder);
            self.current_folder = self.insert(placeholder, false);
        }
        let current = self.current_folder;
        self.set_expected_children(current, items);
        self.depth = depth;
        self.collect_garbage();
        true
    }

    pub fn current_addressed_player(&self) -> Option<NodeKey> {
        self.current_addressed_player
    }

    pub fn set_current_addressed_player(&mut self, player: NodeKey) -> bool {
        if !self.is_player(player) {
            warn!(?player, "Setting an unknown addressed player");
            return false;
        }
        self.current_addressed_player = Some(player);
        true
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn decrement_depth(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Next single hop to take toward `target`.
    ///
    /// Returns the target itself when it can be fetched directly, the
    /// navigate-up sentinel when the current folder must be left first, the
    /// child of the current folder that leads to the target, or `None` when
    /// the target is no longer part of the tree.
    pub fn next_step_toward(&mut self, target: Option<NodeKey>) -> Option<NodeKey> {
        let target = target?;
        if target == self.current_folder || target == self.now_playing || target == self.root {
            return Some(target);
        }

        let node = self.nodes.get(&target)?;
        if node.is_player() {
            if self.depth > 0 {
                self.depth -= 1;
                return Some(self.navigate_up);
            }
            return Some(target);
        }

        if self.index.get(&node.id) != Some(&target) {
            return None;
        }

        Some(
            self.eldest_child(self.current_folder, target)
                .unwrap_or(self.navigate_up),
        )
    }

    /// Walk up from `target` to the node whose parent is `ancestor`.
    fn eldest_child(&self, ancestor: NodeKey, target: NodeKey) -> Option<NodeKey> {
        let mut descendant = target;
        loop {
            let parent = self.nodes.get(&descendant)?.parent?;
            if parent == ancestor {
                return Some(descendant);
            }
            descendant = parent;
        }
    }

    /// Reset to a freshly seeded tree.
    pub fn clear(&mut self) {
        let name = self.nodes[&self.root].title.clone();
        self.nodes.clear();
        self.index.clear();
        self.current_browsed_player = None;
        self.current_addressed_player = None;
        self.depth = 0;
        self.seed(name);
    }
}

// ============================================================================
// Global root
// ============================================================================

/// The root shared by all devices, holding each browsing-connected device's
/// root as a child. Owned by the registry.
#[derive(Debug, Default)]
pub struct GlobalRoot {
    devices: Vec<(DeviceAddress, BrowseItem)>,
}

impl GlobalRoot {
    /// Graft a device root. Returns false if it is already attached.
    pub fn attach(&mut self, device: DeviceAddress, item: BrowseItem) -> bool {
        if self.devices.iter().any(|(d, _)| *d == device) {
            return false;
        }
        self.devices.push((device, item));
        true
    }

    pub fn detach(&mut self, device: DeviceAddress) -> bool {
        let before = self.devices.len();
        self.devices.retain(|(d, _)| *d != device);
        self.devices.len() != before
    }

    /// Device owning the root with the given id.
    pub fn device_for(&self, id: &str) -> Option<DeviceAddress> {
        self.devices
            .iter()
            .find(|(_, item)| item.id == id)
            .map(|(d, _)| *d)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: ROOT_ID.to_string(),
            title: ROOT_ID.to_string(),
            kind: NodeKind::Root,
            scope: Scope::PlayerList,
            device: None,
            cached: true,
            expected_children: self.devices.len() as u32,
            items: self.devices.iter().map(|(_, item)| item.clone()).collect(),
        }
    }
}
