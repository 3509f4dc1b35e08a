//! # avrctl
//!
//! Controller side of a remote-control browsing link: one connection state
//! machine per device, a lazily fetched mirror of each device's
//! player / folder / track hierarchy, and absolute-volume mapping.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use avrctl::{BrowserEvent, CommandSink, ControllerConfig, DeviceRegistry, PeerEvent};
//!
//! #[tokio::main]
//! async fn main() -> avrctl::Result<()> {
//!     let (transport, mut commands) = CommandSink::new();
//!     let (registry, mut events) =
//!         DeviceRegistry::new(ControllerConfig::default(), Arc::new(transport));
//!
//!     let addr = "AA:BB:CC:DD:EE:01".parse()?;
//!     registry.on_connection_state_changed(addr, true, true)?;
//!
//!     // Hand `commands` to whatever owns the link and feed its replies
//!     // back with `registry.peer_event(addr, ...)`.
//!
//!     while let Some(event) = events.recv().await {
//!         if let BrowserEvent::NodeChanged(node) = event {
//!             println!("{}", node.to_json()?);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod msg;
pub mod player;
pub mod session;
pub mod transport;
pub mod tree;
pub mod types;
pub mod volume;

// Internal modules
pub(crate) mod machine;

// Re-export main public API
pub use config::ControllerConfig;
pub use event::BrowserEvent;
pub use manager::DeviceRegistry;
pub use msg::PeerEvent;
pub use player::{Actions, PlaybackSnapshot, PlayerModel, TrackMetadata};
pub use session::{MediaControls, SessionHandle};
pub use transport::{CommandSink, GroupKey, NotificationType, PeerCommand, Transport};
pub use tree::{BrowseItem, BrowseNode, BrowseTree, NodeKey, NodeKind, NodeSnapshot, PeerItem};
pub use volume::{LocalVolume, VolumeControl};

pub use error::Error;
pub use types::*;

/// Result type for avrctl operations.
pub type Result<T> = std::result::Result<T, Error>;
