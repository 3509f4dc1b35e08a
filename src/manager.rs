//! Device registry: the entry point of the controller.
//!
//! The `DeviceRegistry` creates one session per connected device, routes
//! link-layer connection changes and peer events to it, and owns the global
//! browse root that every browsing-connected device's tree hangs under.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::event::{BrowserEvent, EventSink};
use crate::machine::Collaborators;
use crate::msg::PeerEvent;
use crate::session::{CleanupFn, SessionHandle};
use crate::transport::Transport;
use crate::tree::{BrowseItem, GlobalRoot, NodeSnapshot, ROOT_ID};
use crate::types::{ConnectionState, DeviceAddress};
use crate::volume::{LocalVolume, VolumeControl};
use crate::{Error, Result};

/// Lock a mutex, taking over the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Sessions = Arc<Mutex<HashMap<DeviceAddress, Arc<SessionHandle>>>>;

/// Registry of remote-control devices.
///
/// Must be used from within a tokio runtime; each device's state machine
/// runs on its own task.
///
/// # Example
///
/// ```ignore
/// let (transport, mut commands) = CommandSink::new();
/// let (registry, mut events) = DeviceRegistry::new(ControllerConfig::default(), Arc::new(transport));
///
/// registry.on_connection_state_changed(addr, true, true)?;
/// registry.peer_event(addr, PeerEvent::PlayStatusChanged(PlayStatus::Playing))?;
///
/// while let Some(event) = events.recv().await {
///     // Render node listings, playback state, ...
/// }
/// ```
pub struct DeviceRegistry {
    config: ControllerConfig,
    collab: Collaborators,
    /// Sessions keyed by device address.
    sessions: Sessions,
}

impl DeviceRegistry {
    /// Create a registry with an in-memory local volume stream.
    ///
    /// Returns the registry and the receiver for all front-end events.
    pub fn new(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<BrowserEvent>) {
        let max = config.local_max_volume;
        let volume = Arc::new(LocalVolume::new(max, max / 2));
        Self::with_volume(config, transport, volume)
    }

    /// Create a registry mapping absolute volume onto `volume`.
    pub fn with_volume(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        volume: Arc<dyn VolumeControl>,
    ) -> (Self, mpsc::UnboundedReceiver<BrowserEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let collab = Collaborators {
            transport,
            volume,
            events: EventSink::new(event_tx),
            global_root: Arc::new(Mutex::new(GlobalRoot::default())),
        };

        (
            Self {
                config,
                collab,
                sessions: Arc::new(Mutex::new(HashMap::new())),
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Local volume stream absolute volume is mapped onto.
    pub fn volume(&self) -> Arc<dyn VolumeControl> {
        Arc::clone(&self.collab.volume)
    }

    /// Report a change of the control and browsing channels of `device`.
    ///
    /// Either channel being up connects the device, creating its session on
    /// first contact; both down disconnects it.
    pub fn on_connection_state_changed(
        &self,
        device: DeviceAddress,
        remote_control: bool,
        browsing: bool,
    ) -> Result<()> {
        info!(device = %device, remote_control, browsing, "Connection state changed");
        let mut sessions = lock(&self.sessions);

        if !remote_control && !browsing {
            return match sessions.get(&device) {
                Some(session) => session.disconnect(),
                None => {
                    debug!(device = %device, "Disconnect for unknown device");
                    Ok(())
                }
            };
        }

        let existing = sessions.get(&device).filter(|s| !s.is_closed()).cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                let session = Arc::new(self.spawn_session(device));
                sessions.insert(device, Arc::clone(&session));
                session
            }
        };
        session.connect(remote_control, browsing)
    }

    fn spawn_session(&self, device: DeviceAddress) -> SessionHandle {
        // Remove the session once its machine has fully disconnected,
        // unless something was queued for it in the meantime. Runs under
        // the registry lock so it cannot race a connect.
        let sessions = Arc::clone(&self.sessions);
        let on_cleanup: CleanupFn = Box::new(move |pending| {
            let mut sessions = lock(&sessions);
            if !pending.is_empty() {
                return false;
            }
            debug!(device = %device, "Session cleaned up, removing from registry");
            sessions.remove(&device);
            true
        });

        SessionHandle::spawn(device, self.config.clone(), self.collab.clone(), on_cleanup)
    }

    /// Session of a known device.
    pub fn session(&self, device: DeviceAddress) -> Option<Arc<SessionHandle>> {
        lock(&self.sessions).get(&device).cloned()
    }

    /// Deliver an event or response from `device`'s peer.
    ///
    /// Events for devices without a session are dropped.
    pub fn peer_event(&self, device: DeviceAddress, event: PeerEvent) -> Result<()> {
        match self.session(device) {
            Some(session) => session.peer_event(event),
            None => {
                debug!(device = %device, ?event, "Dropping event for unknown device");
                Err(Error::UnknownDevice(device))
            }
        }
    }

    /// Tell every device the local volume moved.
    pub fn local_volume_changed(&self) {
        for session in self.sessions() {
            if let Err(e) = session.local_volume_changed() {
                warn!(error = %e, "Failed to forward volume change");
            }
        }
    }

    /// Disconnect a device if it is connected or connecting.
    ///
    /// Returns whether a disconnect was issued.
    pub async fn disconnect(&self, device: DeviceAddress) -> Result<bool> {
        let Some(session) = self.session(device) else {
            return Ok(false);
        };
        match session.state().await? {
            ConnectionState::Connected | ConnectionState::Connecting => {
                session.disconnect()?;
                Ok(true)
            }
            state => {
                debug!(device = %device, %state, "Not disconnecting");
                Ok(false)
            }
        }
    }

    /// Broadcast connection state of `device`; unknown devices are disconnected.
    pub async fn connection_state(&self, device: DeviceAddress) -> ConnectionState {
        match self.session(device) {
            Some(session) => session.state().await.unwrap_or_default(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Devices currently in the Connected state.
    pub async fn connected_devices(&self) -> Vec<DeviceAddress> {
        let mut devices = Vec::new();
        for session in self.sessions() {
            if let Ok(ConnectionState::Connected) = session.state().await {
                devices.push(session.device());
            }
        }
        devices.sort();
        devices
    }

    pub fn device_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Snapshot of the global root.
    pub fn root_snapshot(&self) -> NodeSnapshot {
        lock(&self.collab.global_root).snapshot()
    }

    /// Listing of the node with this id, wherever it lives.
    ///
    /// Returns `None` for ids no device knows and for nodes whose contents
    /// have not been fetched yet; the latter are fetched in the background
    /// and announced through [`BrowserEvent::NodeChanged`].
    pub async fn get_contents(&self, id: &str) -> Option<Vec<BrowseItem>> {
        if id == ROOT_ID {
            return Some(self.root_snapshot().items);
        }

        let owner = lock(&self.collab.global_root).device_for(id);
        let candidates = match owner.and_then(|d| self.session(d)) {
            Some(session) => vec![session],
            None => self.sessions(),
        };
        for session in candidates {
            match session.get_contents(id).await {
                Ok(Some(items)) => return Some(items),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Session gone during lookup"),
            }
        }
        None
    }

    /// Clone handles so the lock is not held across awaits.
    fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        lock(&self.sessions).values().cloned().collect()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for session in lock(&self.sessions).values() {
            let _ = session.shutdown();
        }
    }
}
