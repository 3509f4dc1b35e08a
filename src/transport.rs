//! Command transport toward the peer.
//!
//! Encoding commands onto the air interface is someone else's job; the
//! controller only needs fire-and-forget calls keyed by device address.
//! [`CommandSink`] is the channel-backed implementation used to bridge to
//! whatever owns the real link (and by the tests).

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{DeviceAddress, FolderDirection, KeyCode, KeyState, Scope};

/// Group navigation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupKey {
    NextGroup = 0x00,
    PreviousGroup = 0x01,
}

/// Response type of a register-notification reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationType {
    Changed = 0x0D,
    Interim = 0x0F,
}

/// Outbound command surface of the remote-control link.
///
/// Every call is fire-and-forget; results come back later as
/// [`PeerEvent`](crate::PeerEvent)s.
pub trait Transport: Send + Sync {
    fn send_passthrough(&self, device: DeviceAddress, key: KeyCode, state: KeyState);
    fn send_group_navigation(&self, device: DeviceAddress, key: GroupKey, state: KeyState);
    fn set_player_application_settings(&self, device: DeviceAddress, settings: &[(u8, u8)]);
    fn send_absolute_volume_response(&self, device: DeviceAddress, volume: u8, label: u8);
    fn send_register_absolute_volume_response(
        &self,
        device: DeviceAddress,
        response: NotificationType,
        volume: u8,
        label: u8,
    );
    fn get_playback_state(&self, device: DeviceAddress);
    fn get_now_playing_list(&self, device: DeviceAddress, start: u32, end: u32);
    fn get_folder_list(&self, device: DeviceAddress, start: u32, end: u32);
    fn get_player_list(&self, device: DeviceAddress, start: u32, end: u32);
    fn change_folder_path(&self, device: DeviceAddress, direction: FolderDirection, uid: u64);
    fn play_item(&self, device: DeviceAddress, scope: Scope, uid: u64, uid_counter: u16);
    fn set_browsed_player(&self, device: DeviceAddress, player_id: i32);
    fn set_addressed_player(&self, device: DeviceAddress, player_id: i32);
}

/// A command issued to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Passthrough { key: KeyCode, state: KeyState },
    GroupNavigation { key: GroupKey, state: KeyState },
    PlayerApplicationSettings(Vec<(u8, u8)>),
    AbsoluteVolumeResponse { volume: u8, label: u8 },
    RegisterAbsoluteVolumeResponse { response: NotificationType, volume: u8, label: u8 },
    GetPlaybackState,
    GetNowPlayingList { start: u32, end: u32 },
    GetFolderList { start: u32, end: u32 },
    GetPlayerList { start: u32, end: u32 },
    ChangeFolderPath { direction: FolderDirection, uid: u64 },
    PlayItem { scope: Scope, uid: u64, uid_counter: u16 },
    SetBrowsedPlayer(i32),
    SetAddressedPlayer(i32),
}

/// [`Transport`] that forwards every command onto a channel.
#[derive(Debug, Clone)]
pub struct CommandSink {
    tx: mpsc::UnboundedSender<(DeviceAddress, PeerCommand)>,
}

impl CommandSink {
    /// Create a sink and the receiver its commands arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(DeviceAddress, PeerCommand)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, device: DeviceAddress, command: PeerCommand) {
        debug!(device = %device, ?command, "TX");
        if self.tx.send((device, command)).is_err() {
            warn!(device = %device, "Command receiver dropped");
        }
    }
}

impl Transport for CommandSink {
    fn send_passthrough(&self, device: DeviceAddress, key: KeyCode, state: KeyState) {
        self.send(device, PeerCommand::Passthrough { key, state });
    }

    fn send_group_navigation(&self, device: DeviceAddress, key: GroupKey, state: KeyState) {
        self.send(device, PeerCommand::GroupNavigation { key, state });
    }

    fn set_player_application_settings(&self, device: DeviceAddress, settings: &[(u8, u8)]) {
        self.send(device, PeerCommand::PlayerApplicationSettings(settings.to_vec()));
    }

    fn send_absolute_volume_response(&self, device: DeviceAddress, volume: u8, label: u8) {
        self.send(device, PeerCommand::AbsoluteVolumeResponse { volume, label });
    }

    fn send_register_absolute_volume_response(
        &self,
        device: DeviceAddress,
        response: NotificationType,
        volume: u8,
        label: u8,
    ) {
        self.send(
            device,
            PeerCommand::RegisterAbsoluteVolumeResponse { response, volume, label },
        );
    }

    fn get_playback_state(&self, device: DeviceAddress) {
        self.send(device, PeerCommand::GetPlaybackState);
    }

    fn get_now_playing_list(&self, device: DeviceAddress, start: u32, end: u32) {
        self.send(device, PeerCommand::GetNowPlayingList { start, end });
    }

    fn get_folder_list(&self, device: DeviceAddress, start: u32, end: u32) {
        self.send(device, PeerCommand::GetFolderList { start, end });
    }

    fn get_player_list(&self, device: DeviceAddress, start: u32, end: u32) {
        self.send(device, PeerCommand::GetPlayerList { start, end });
    }

    fn change_folder_path(&self, device: DeviceAddress, direction: FolderDirection, uid: u64) {
        self.send(device, PeerCommand::ChangeFolderPath { direction, uid });
    }

    fn play_item(&self, device: DeviceAddress, scope: Scope, uid: u64, uid_counter: u16) {
        self.send(device, PeerCommand::PlayItem { scope, uid, uid_counter });
    }

    fn set_browsed_player(&self, device: DeviceAddress, player_id: i32) {
        self.send(device, PeerCommand::SetBrowsedPlayer(player_id));
    }

    fn set_addressed_player(&self, device: DeviceAddress, player_id: i32) {
        self.send(device, PeerCommand::SetAddressedPlayer(player_id));
    }
}
