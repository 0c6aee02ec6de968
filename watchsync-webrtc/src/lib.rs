//! # watchsync webrtc
//!
//! [`PeerConnector`](watchsync_core::PeerConnector) backed by the `webrtc`
//! crate. Local tracks are shared across every peer connection of the mesh;
//! disabling a [`LocalTrack`](watchsync_core::LocalTrack) drops its samples
//! instead of renegotiating.
//!
//! ```no_run
//! use watchsync_webrtc::WebRtcConnector;
//!
//! let connector = WebRtcConnector::new(&["stun:stun.l.google.com:19302".to_string()])?;
//! assert_eq!(connector.ice_servers().len(), 1);
//! # Ok::<(), watchsync_core::WatchSyncError>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connector;
pub mod fanout;
pub mod peer;

// Re-export main types
pub use connector::WebRtcConnector;
pub use fanout::{FanoutTrack, TrackFanout};
pub use peer::WebRtcPeer;
