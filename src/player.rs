//! Remote player model: feature set, playback status and position.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::PlayStatus;

/// Player feature bits (octet-addressed bitmask advertised by the peer).
pub mod features {
    pub const PLAY: u32 = 40;
    pub const STOP: u32 = 41;
    pub const PAUSE: u32 = 42;
    pub const REWIND: u32 = 44;
    pub const FAST_FORWARD: u32 = 45;
    pub const FORWARD: u32 = 47;
    pub const BACKWARD: u32 = 48;
    pub const BROWSING: u32 = 59;
    pub const NOW_PLAYING: u32 = 65;
}

/// Set of transport actions the front end may offer for a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Actions(u32);

impl Actions {
    pub const NONE: Actions = Actions(0);
    pub const PLAY: Actions = Actions(1 << 0);
    pub const PAUSE: Actions = Actions(1 << 1);
    pub const STOP: Actions = Actions(1 << 2);
    pub const SKIP_TO_NEXT: Actions = Actions(1 << 3);
    pub const SKIP_TO_PREVIOUS: Actions = Actions(1 << 4);
    pub const REWIND: Actions = Actions(1 << 5);
    pub const FAST_FORWARD: Actions = Actions(1 << 6);
    pub const SKIP_TO_QUEUE_ITEM: Actions = Actions(1 << 7);
    pub const PREPARE: Actions = Actions(1 << 8);

    /// Actions every player gets regardless of its advertised features.
    pub const BASELINE: Actions = Actions(
        Self::PREPARE.0
            | Self::PLAY.0
            | Self::PAUSE.0
            | Self::STOP.0
            | Self::SKIP_TO_NEXT.0
            | Self::SKIP_TO_PREVIOUS.0,
    );

    pub fn contains(self, other: Actions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Actions {
    type Output = Actions;

    fn bitor(self, rhs: Actions) -> Actions {
        Actions(self.0 | rhs.0)
    }
}

// ============================================================================
// Track metadata
// ============================================================================

/// Element attribute ids carried in a track-changed event.
pub mod attribute {
    pub const TITLE: u32 = 0x01;
    pub const ARTIST: u32 = 0x02;
    pub const ALBUM: u32 = 0x03;
    pub const TRACK_NUMBER: u32 = 0x04;
    pub const TOTAL_TRACKS: u32 = 0x05;
    pub const GENRE: u32 = 0x06;
    pub const PLAYING_TIME: u32 = 0x07;
}

/// Metadata of the track currently loaded on the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// 1-based position within the now-playing list.
    pub track_number: Option<u64>,
    pub total_tracks: Option<u64>,
    pub genre: Option<String>,
    pub duration_ms: Option<u64>,
}

impl TrackMetadata {
    /// Build metadata from parallel attribute-id / value arrays.
    ///
    /// Extra entries on either side and values that fail to parse are
    /// skipped; every well-formed pair is still applied.
    pub fn from_attributes(ids: &[u32], values: &[String]) -> Self {
        if ids.len() != values.len() {
            warn!(
                ids = ids.len(),
                values = values.len(),
                "Mismatched track attribute arrays"
            );
        }

        let mut meta = TrackMetadata::default();
        for (&id, value) in ids.iter().zip(values) {
            match id {
                attribute::TITLE => meta.title = Some(value.clone()),
                attribute::ARTIST => meta.artist = Some(value.clone()),
                attribute::ALBUM => meta.album = Some(value.clone()),
                attribute::GENRE => meta.genre = Some(value.clone()),
                attribute::TRACK_NUMBER => meta.track_number = parse_number(id, value),
                attribute::TOTAL_TRACKS => meta.total_tracks = parse_number(id, value),
                attribute::PLAYING_TIME => meta.duration_ms = parse_number(id, value),
                _ => debug!(id, "Ignoring unknown track attribute"),
            }
        }
        meta
    }
}

fn parse_number(id: u32, value: &str) -> Option<u64> {
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(id, value, "Skipping malformed numeric track attribute");
            None
        }
    }
}

// ============================================================================
// Playback snapshot
// ============================================================================

/// Point-in-time playback state handed to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub status: PlayStatus,
    /// Position at `updated_at`; `None` when the peer has not reported one.
    pub position_ms: Option<u64>,
    pub speed: f32,
    pub actions: Actions,
    /// 0-based index into the now-playing list.
    pub active_queue_item: Option<u64>,
    pub error: Option<String>,
    #[serde(skip)]
    pub updated_at: Option<Instant>,
}

impl PlaybackSnapshot {
    /// Snapshot announcing that browsing to the device was lost.
    pub fn disconnected() -> Self {
        Self {
            status: PlayStatus::Error,
            position_ms: None,
            speed: 1.0,
            actions: Actions::NONE,
            active_queue_item: None,
            error: Some("device disconnected".to_string()),
            updated_at: None,
        }
    }

    /// Extrapolate the position to `now` using the snapshot's speed.
    pub fn position_at(&self, now: Instant) -> Option<u64> {
        let position = self.position_ms?;
        let Some(updated_at) = self.updated_at else {
            return Some(position);
        };
        let elapsed = now.saturating_duration_since(updated_at).as_millis() as f64;
        Some((position as f64 + elapsed * self.speed as f64).max(0.0) as u64)
    }
}

// ============================================================================
// Player
// ============================================================================

/// One player exposed by the peer.
#[derive(Debug, Clone)]
pub struct PlayerModel {
    id: i32,
    name: String,
    feature_bitmap: Vec<u8>,
    play_status: PlayStatus,
    position_ms: Option<u64>,
    position_update_time: Instant,
    speed: f32,
    allowed_actions: Actions,
    current_track: Option<TrackMetadata>,
    queue_position: Option<u64>,
    snapshot: PlaybackSnapshot,
}

impl Default for PlayerModel {
    fn default() -> Self {
        Self::new(-1, "", Vec::new(), PlayStatus::None)
    }
}

impl PlayerModel {
    pub fn new(
        id: i32,
        name: impl Into<String>,
        feature_bitmap: Vec<u8>,
        play_status: PlayStatus,
    ) -> Self {
        let mut player = Self {
            id,
            name: name.into(),
            feature_bitmap,
            play_status,
            position_ms: None,
            position_update_time: Instant::now(),
            speed: play_status.speed(),
            allowed_actions: Actions::BASELINE,
            current_track: None,
            queue_position: None,
            snapshot: PlaybackSnapshot::disconnected(),
        };
        player.allowed_actions = player.compute_actions();
        player.rebuild_snapshot();
        player
    }

    fn compute_actions(&self) -> Actions {
        let mut actions = Actions::BASELINE;
        if self.supports_feature(features::REWIND) {
            actions = actions | Actions::REWIND;
        }
        if self.supports_feature(features::FAST_FORWARD) {
            actions = actions | Actions::FAST_FORWARD;
        }
        if self.supports_feature(features::NOW_PLAYING) {
            actions = actions | Actions::SKIP_TO_QUEUE_ITEM;
        }
        actions
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn play_status(&self) -> PlayStatus {
        self.play_status
    }

    pub fn position_ms(&self) -> Option<u64> {
        self.position_ms
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn allowed_actions(&self) -> Actions {
        self.allowed_actions
    }

    pub fn current_track(&self) -> Option<&TrackMetadata> {
        self.current_track.as_ref()
    }

    /// Whether the player accepts set-browsed-player.
    pub fn is_browsable(&self) -> bool {
        self.supports_feature(features::BROWSING)
    }

    pub fn supports_feature(&self, bit: u32) -> bool {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        self.feature_bitmap
            .get(byte)
            .is_some_and(|b| b & mask == mask)
    }

    /// Latest playback snapshot.
    pub fn playback_state(&self) -> &PlaybackSnapshot {
        &self.snapshot
    }

    /// Apply a new play status.
    ///
    /// The position is advanced to now at the old speed before the new
    /// speed takes effect.
    pub fn update_play_status(&mut self, status: PlayStatus) {
        let now = Instant::now();
        if let Some(position) = self.position_ms {
            let elapsed = now
                .saturating_duration_since(self.position_update_time)
                .as_millis() as f64;
            let advanced = (position as f64 + elapsed * self.speed as f64).max(0.0);
            self.position_ms = Some(advanced as u64);
        }
        self.position_update_time = now;
        self.play_status = status;
        self.speed = status.speed();
        self.rebuild_snapshot();
    }

    pub fn set_position(&mut self, position_ms: Option<u64>) {
        self.position_ms = position_ms;
        self.position_update_time = Instant::now();
        self.rebuild_snapshot();
    }

    pub fn update_current_track(&mut self, track: Option<TrackMetadata>) {
        if let Some(number) = track.as_ref().and_then(|t| t.track_number) {
            self.queue_position = Some(number.saturating_sub(1));
        }
        self.current_track = track;
        self.rebuild_snapshot();
    }

    fn rebuild_snapshot(&mut self) {
        self.snapshot = PlaybackSnapshot {
            status: self.play_status,
            position_ms: self.position_ms,
            speed: self.speed,
            actions: self.allowed_actions,
            active_queue_item: self.queue_position,
            error: None,
            updated_at: Some(self.position_update_time),
        };
    }
}
