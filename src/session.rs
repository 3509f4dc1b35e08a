//! Per-device session: a task owning one [`ConnectionStateMachine`] and the
//! handle used to talk to it.
//!
//! Everything addressed to a device goes through [`SessionHandle`], which
//! only enqueues. The session task processes one message at a time, so the
//! machine never needs a lock.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::machine::{Collaborators, ConnectionStateMachine};
use crate::msg::{Message, PeerEvent, Query};
use crate::transport::GroupKey;
use crate::tree::{BrowseItem, NodeSnapshot};
use crate::types::{ConnectionState, DeviceAddress, KeyCode, KeyState};
use crate::{Error, Result};

/// Called when the machine asks to be discarded. Receives the session's
/// queue and returns false to keep the session alive if work is pending.
pub(crate) type CleanupFn = Box<dyn Fn(&mpsc::UnboundedReceiver<Message>) -> bool + Send>;

// ============================================================================
// Media controls
// ============================================================================

/// Transport controls handed to the front end when a device becomes
/// controllable.
///
/// Each call becomes a passthrough key or play command on the device's
/// queue; nothing is sent synchronously.
#[derive(Debug, Clone)]
pub struct MediaControls {
    device: DeviceAddress,
    tx: mpsc::UnboundedSender<Message>,
}

impl MediaControls {
    pub(crate) fn new(device: DeviceAddress, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { device, tx }
    }

    pub fn device(&self) -> DeviceAddress {
        self.device
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::SessionClosed(self.device))
    }

    pub fn play(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Play))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Pause))
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Stop))
    }

    pub fn skip_to_next(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Forward))
    }

    pub fn skip_to_previous(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Backward))
    }

    /// Starts seeking forward; the key stays held until the next key.
    pub fn fast_forward(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::FastForward))
    }

    /// Starts seeking backward; the key stays held until the next key.
    pub fn rewind(&self) -> Result<()> {
        self.send(Message::Passthrough(KeyCode::Rewind))
    }

    /// Play the now-playing entry at `position` (0-based).
    pub fn skip_to_queue_item(&self, position: usize) -> Result<()> {
        self.send(Message::PlayQueueItem(position))
    }

    /// Play the browse node with this id.
    pub fn play_from_media_id(&self, id: &str) -> Result<()> {
        self.send(Message::PlayItem(id.to_string()))
    }
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to a running device session.
pub struct SessionHandle {
    device: DeviceAddress,
    command_tx: mpsc::UnboundedSender<Message>,
    #[allow(dead_code)] // Kept alive with the session
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the session task for `device`.
    pub(crate) fn spawn(
        device: DeviceAddress,
        config: ControllerConfig,
        collab: Collaborators,
        on_cleanup: CleanupFn,
    ) -> Self {
        debug!(device = %device, "Spawning session");
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let machine = ConnectionStateMachine::new(
            device,
            device.to_string(),
            config,
            collab,
            command_tx.clone(),
        );

        let runner = SessionRunner {
            device,
            machine,
            command_rx,
            on_cleanup,
        };
        let task = tokio::spawn(async move {
            runner.run().await;
        });

        Self {
            device,
            command_tx,
            task,
        }
    }

    pub fn device(&self) -> DeviceAddress {
        self.device
    }

    /// Whether the session task has gone away.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub(crate) fn send(&self, msg: Message) -> Result<()> {
        self.command_tx
            .send(msg)
            .map_err(|_| Error::SessionClosed(self.device))
    }

    async fn ask<T>(&self, query: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Message::Query(query(reply_tx)))?;
        reply_rx.await.map_err(|_| Error::SessionClosed(self.device))
    }

    pub fn connect(&self, remote_control: bool, browsing: bool) -> Result<()> {
        self.send(Message::Connect {
            remote_control,
            browsing,
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Message::Disconnect)
    }

    /// Deliver an event or response from the peer.
    pub fn peer_event(&self, event: PeerEvent) -> Result<()> {
        self.send(Message::Peer(event))
    }

    /// Fetch the contents of the node with this id.
    pub fn request_contents(&self, id: &str) -> Result<()> {
        self.send(Message::GetFolderItems(id.to_string()))
    }

    /// Invalidate and refetch the now-playing list.
    pub fn refresh_now_playing(&self) -> Result<()> {
        self.send(Message::RefreshNowPlaying)
    }

    pub fn local_volume_changed(&self) -> Result<()> {
        self.send(Message::LocalVolumeChanged)
    }

    pub fn passthrough(&self, key: KeyCode) -> Result<()> {
        self.send(Message::Passthrough(key))
    }

    pub fn group_navigation(&self, key: GroupKey, state: KeyState) -> Result<()> {
        self.send(Message::GroupNavigation(key, state))
    }

    pub fn set_player_application_settings(&self, settings: Vec<(u8, u8)>) -> Result<()> {
        self.send(Message::PlayerApplicationSettings(settings))
    }

    pub fn set_addressed_player(&self, player_id: i32) -> Result<()> {
        self.send(Message::SetAddressedPlayer(player_id))
    }

    pub fn play_item(&self, id: &str) -> Result<()> {
        self.send(Message::PlayItem(id.to_string()))
    }

    pub fn controls(&self) -> MediaControls {
        MediaControls::new(self.device, self.command_tx.clone())
    }

    /// Listing of a node, or `None` if unknown or not fetched yet. An
    /// unfetched node is fetched in the background.
    pub async fn get_contents(&self, id: &str) -> Result<Option<Vec<BrowseItem>>> {
        let id = id.to_string();
        self.ask(|reply| Query::Contents { id, reply }).await
    }

    pub async fn node(&self, id: &str) -> Result<Option<NodeSnapshot>> {
        let id = id.to_string();
        self.ask(|reply| Query::Node { id, reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.ask(|reply| Query::State { reply }).await
    }

    /// Stop the session task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown)
    }
}

// ============================================================================
// Session runner
// ============================================================================

struct SessionRunner {
    device: DeviceAddress,
    machine: ConnectionStateMachine,
    command_rx: mpsc::UnboundedReceiver<Message>,
    on_cleanup: CleanupFn,
}

impl SessionRunner {
    async fn run(mut self) {
        info!(device = %self.device, "Session task started");

        let mut cleanup_due = false;
        while let Some(msg) = self.command_rx.recv().await {
            if matches!(msg, Message::Shutdown) {
                debug!(device = %self.device, "Shutdown requested");
                break;
            }
            self.machine.handle(msg);

            cleanup_due |= self.machine.take_cleanup_request();
            if !cleanup_due {
                continue;
            }
            if self.machine.connection_state() != ConnectionState::Disconnected {
                cleanup_due = false;
            } else if (self.on_cleanup)(&self.command_rx) {
                break;
            } else {
                debug!(device = %self.device, "Cleanup deferred, messages pending");
            }
        }

        self.machine.teardown();
        info!(device = %self.device, "Session task stopped");
    }
}
