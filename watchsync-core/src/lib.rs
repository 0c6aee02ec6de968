//! # watchsync core
//!
//! Error taxonomy, media track handles and the peer transport abstraction
//! shared by every watchsync crate.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod track;
pub mod transport;

// Re-export main types
pub use error::WatchSyncError;
pub use track::{LocalMedia, LocalTrack, RemoteTrackInfo, TrackKind};
pub use transport::{
    IceCandidate, LinkConnectionState, LinkEventSender, PeerConnector, PeerTransport, SdpKind,
    TransportEvent, TransportEventKind,
};
